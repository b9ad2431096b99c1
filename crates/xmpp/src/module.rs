use std::sync::Arc;

use auklet_core::EventBusError;
use auklet_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use tracing::warn;
use xmpp_parsers::minidom::Element;

use crate::correlator::{Request, RequestCorrelator, ResponseHandle};
use crate::criteria::Criterion;
use crate::error::{ConfigurationError, ProtocolError, RequestError};
use crate::transport::StanzaSink;

/// A unit of protocol behaviour plugged into the [`ModuleRegistry`].
///
/// `initialize` runs exactly once, during registration and before the first
/// `process` call. There is no teardown.
///
/// [`ModuleRegistry`]: crate::registry::ModuleRegistry
pub trait XmppModule: Send + Sync + 'static {
    /// Unique within a registry.
    fn module_type(&self) -> &str;

    /// Service discovery features this module implements.
    fn features(&self) -> &[&str] {
        &[]
    }

    /// Which inbound stanzas this module wants. `None` opts out of dispatch.
    fn criterion(&self) -> Option<&Criterion>;

    fn initialize(&self, _ctx: &ModuleContext) -> Result<(), ConfigurationError> {
        Ok(())
    }

    fn process(&self, stanza: &Element, ctx: &ModuleContext) -> Result<(), ProtocolError>;
}

/// Engine services handed to modules. Cheap to clone.
#[derive(Clone)]
pub struct ModuleContext {
    event_bus: Arc<dyn EventBus>,
    correlator: Arc<RequestCorrelator>,
    sink: Arc<dyn StanzaSink>,
}

impl ModuleContext {
    pub fn new(
        event_bus: Arc<dyn EventBus>,
        correlator: Arc<RequestCorrelator>,
        sink: Arc<dyn StanzaSink>,
    ) -> Self {
        Self {
            event_bus,
            correlator,
            sink,
        }
    }

    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.event_bus
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    pub fn sink(&self) -> &Arc<dyn StanzaSink> {
        &self.sink
    }

    /// Fire-and-forget send.
    pub fn send(&self, stanza: &Element) -> Result<(), crate::error::TransportError> {
        self.sink.send(stanza)
    }

    /// Register `request` with the correlator and put it on the wire.
    ///
    /// A send failure does not surface here: the pending entry is completed
    /// with [`RequestError::Transport`] and the handle reports it.
    pub fn send_request<T: Send + 'static>(
        &self,
        request: Request<T>,
    ) -> Result<ResponseHandle<T>, ConfigurationError> {
        let (stanza, handle) = self.correlator.submit(request)?;
        if let Err(source) = self.sink.send(&stanza) {
            let id = handle.id().to_string();
            warn!(id = %id, error = %source, "failed to send request");
            self.correlator
                .resolve(&id, Err(RequestError::Transport { id: id.clone(), source }));
        }
        Ok(handle)
    }

    /// Publish an event on behalf of the module `module_type`.
    pub fn publish(
        &self,
        channel: &str,
        module_type: &str,
        payload: EventPayload,
    ) -> Result<(), EventBusError> {
        let event = Event::new(
            Channel::new(channel)?,
            EventSource::Module(module_type.to_string()),
            payload,
        );
        self.event_bus.publish(event)
    }
}
