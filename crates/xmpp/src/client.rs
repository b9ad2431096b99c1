//! Glue between a transport and the engine.
//!
//! [`XmppClient`] owns the module registry and the [`ModuleContext`] shared
//! with modules. Inbound stanzas are offered to the request correlator first
//! and to the registry second; failures go to the error translator.

use std::sync::Arc;
use std::time::Duration;

use auklet_core::EventBusError;
use auklet_core::event::{
    Channel, Event, EventBus, EventHandler, EventPayload, EventSource, EventSubscription,
    SubscriptionHandle,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xmpp_parsers::minidom::Element;

use crate::correlator::{Request, RequestCorrelator, ResponseHandle};
use crate::error::{ConfigurationError, ParseError, TransportError};
use crate::module::{ModuleContext, XmppModule};
use crate::registry::{DispatchOutcome, ModuleRegistry};
use crate::stanza::{StanzaExt, parse_stanza};
use crate::transport::{StanzaReceiver, StanzaSink};
use crate::translator::ErrorTranslator;

const CLIENT_SOURCE: &str = "xmpp-client";

/// Where an inbound stanza ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// It answered one of our pending requests.
    Response,
    Dispatched(DispatchOutcome),
}

pub struct XmppClient {
    registry: ModuleRegistry,
    ctx: ModuleContext,
    translator: ErrorTranslator,
}

impl XmppClient {
    pub fn new(event_bus: Arc<dyn EventBus>, sink: Arc<dyn StanzaSink>) -> Self {
        Self::with_correlator(event_bus, sink, Arc::new(RequestCorrelator::default()))
    }

    pub fn with_correlator(
        event_bus: Arc<dyn EventBus>,
        sink: Arc<dyn StanzaSink>,
        correlator: Arc<RequestCorrelator>,
    ) -> Self {
        Self {
            registry: ModuleRegistry::new(),
            translator: ErrorTranslator::new(Arc::clone(&sink)),
            ctx: ModuleContext::new(event_bus, correlator, sink),
        }
    }

    pub fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        self.ctx.correlator()
    }

    pub fn register_module(&self, module: Arc<dyn XmppModule>) -> Result<(), ConfigurationError> {
        let module_type = module.module_type().to_string();
        let features = module.features().iter().map(|f| f.to_string()).collect();
        self.registry.register(module, &self.ctx)?;

        self.publish_system(
            "system.module.registered",
            EventPayload::ModuleRegistered {
                module_type,
                features,
            },
        );
        Ok(())
    }

    pub fn list_features(&self) -> Vec<String> {
        self.registry.features()
    }

    /// Route one parsed inbound stanza.
    pub fn handle_inbound(&self, stanza: &Element) -> InboundOutcome {
        if self.ctx.correlator().resolve_response(stanza) {
            return InboundOutcome::Response;
        }

        let outcome = self.registry.dispatch(stanza, &self.ctx);
        let replied = match &outcome {
            DispatchOutcome::Failed { error, .. } => self.translator.reply(stanza, error),
            DispatchOutcome::Unhandled => self.translator.unhandled(stanza),
            DispatchOutcome::Handled { .. } | DispatchOutcome::Ignored => Ok(false),
        };
        if let Err(error) = replied {
            warn!(
                id = stanza.id().unwrap_or_default(),
                %error,
                "could not deliver error reply"
            );
        }
        InboundOutcome::Dispatched(outcome)
    }

    /// Parse one complete serialized stanza and route it.
    pub fn handle_raw(&self, raw: &[u8]) -> Result<InboundOutcome, ParseError> {
        let stanza = parse_stanza(raw).inspect_err(|error| {
            warn!(%error, bytes = raw.len(), "dropping unparseable inbound data");
        })?;
        Ok(self.handle_inbound(&stanza))
    }

    /// Consume `inbound` in arrival order until the transport closes it.
    pub async fn run(&self, mut inbound: StanzaReceiver) {
        info!("inbound loop started");
        while let Some(raw) = inbound.recv().await {
            // parse failures are already logged
            let _ = self.handle_raw(&raw);
        }
        self.on_disconnect("inbound stream closed");
    }

    pub fn send(&self, stanza: &Element) -> Result<(), TransportError> {
        self.ctx.send(stanza)
    }

    pub fn send_request<T: Send + 'static>(
        &self,
        request: Request<T>,
    ) -> Result<ResponseHandle<T>, ConfigurationError> {
        self.ctx.send_request(request)
    }

    /// Fail every pending request and announce the lost connection.
    pub fn on_disconnect(&self, reason: &str) -> usize {
        let cancelled = self.ctx.correlator().cancel_all(reason);
        info!(reason, cancelled, "connection lost");
        self.publish_system(
            "system.connection.lost",
            EventPayload::ConnectionLost {
                reason: reason.to_string(),
                cancelled_requests: cancelled,
            },
        );
        cancelled
    }

    pub fn subscribe(
        &self,
        pattern: &str,
        handler: EventHandler,
    ) -> Result<SubscriptionHandle, EventBusError> {
        self.ctx.event_bus().subscribe(pattern, handler)
    }

    pub fn subscribe_channel(
        &self,
        pattern: &str,
        capacity: usize,
    ) -> Result<EventSubscription, EventBusError> {
        self.ctx.event_bus().subscribe_channel(pattern, capacity)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.ctx.event_bus().unsubscribe(handle)
    }

    pub fn spawn_timeout_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        self.ctx.correlator().spawn_sweeper(interval)
    }

    fn publish_system(&self, channel: &str, payload: EventPayload) {
        let event = match Channel::new(channel) {
            Ok(channel) => Event::new(channel, EventSource::System(CLIENT_SOURCE.into()), payload),
            Err(error) => {
                warn!(channel, %error, "invalid system channel");
                return;
            }
        };
        if let Err(error) = self.ctx.event_bus().publish(event) {
            debug!(channel, %error, "system event not published");
        }
    }
}
