use tokio::sync::mpsc;
use tracing::{trace, warn};
use xmpp_parsers::minidom::Element;

use crate::error::TransportError;
use crate::stanza::serialize_stanza;

pub type StanzaSender = mpsc::Sender<Vec<u8>>;

pub type StanzaReceiver = mpsc::Receiver<Vec<u8>>;

/// Bounded byte channel carrying one complete serialized stanza per message.
pub fn stanza_channel(buffer: usize) -> (StanzaSender, StanzaReceiver) {
    mpsc::channel(buffer.max(1))
}

/// Outbound half of the connection, as seen by the engine.
///
/// `send` must not block on the network: implementations queue the stanza
/// and report a full or closed queue as an error.
#[cfg_attr(test, mockall::automock)]
pub trait StanzaSink: Send + Sync + 'static {
    fn send(&self, stanza: &Element) -> Result<(), TransportError>;
}

/// [`StanzaSink`] that serializes onto a [`StanzaSender`] for a writer task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: StanzaSender,
}

impl ChannelSink {
    pub fn new(sender: StanzaSender) -> Self {
        Self { sender }
    }
}

impl StanzaSink for ChannelSink {
    fn send(&self, stanza: &Element) -> Result<(), TransportError> {
        let payload = serialize_stanza(stanza)?;
        trace!(bytes = payload.len(), name = stanza.name(), "queueing stanza");
        self.sender.try_send(payload).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => {
                warn!("outbound stanza queue is full");
                TransportError::Backpressure
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}
