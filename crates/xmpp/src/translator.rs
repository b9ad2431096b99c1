use std::sync::Arc;

use tracing::{debug, warn};
use xmpp_parsers::minidom::Element;

use crate::error::{ProtocolError, TransportError, condition_name};
use crate::stanza::{StanzaExt, reply_to};
use crate::transport::StanzaSink;

/// Turns processing failures into stanza error replies.
pub struct ErrorTranslator {
    sink: Arc<dyn StanzaSink>,
}

impl ErrorTranslator {
    pub fn new(sink: Arc<dyn StanzaSink>) -> Self {
        Self { sink }
    }

    /// The `type='error'` reply to `original` carrying `error`.
    ///
    /// `None` for stanzas that must not be answered: errors and iq results.
    pub fn error_response(original: &Element, error: &ProtocolError) -> Option<Element> {
        if original.is_error() || original.stanza_type() == Some("result") {
            return None;
        }
        let mut reply = reply_to(original, "error");
        reply.append_child(error.to_element());
        Some(reply)
    }

    /// Send the error reply for `original`. Returns whether a reply was sent.
    pub fn reply(&self, original: &Element, error: &ProtocolError) -> Result<bool, TransportError> {
        let Some(response) = Self::error_response(original, error) else {
            debug!(
                name = original.name(),
                id = original.id().unwrap_or_default(),
                %error,
                "not answering error or result stanza"
            );
            return Ok(false);
        };
        if let Err(source) = self.sink.send(&response) {
            warn!(id = original.id().unwrap_or_default(), error = %source, "failed to send error reply");
            return Err(source);
        }
        debug!(
            id = original.id().unwrap_or_default(),
            condition = %condition_name(&error.condition),
            "sent error reply"
        );
        Ok(true)
    }

    /// Answer a stanza no module claimed.
    ///
    /// Only iq requests get `service-unavailable`; unclaimed messages and
    /// presences are dropped silently.
    pub fn unhandled(&self, original: &Element) -> Result<bool, TransportError> {
        if !original.is_request() {
            return Ok(false);
        }
        self.reply(original, &ProtocolError::service_unavailable())
    }
}
