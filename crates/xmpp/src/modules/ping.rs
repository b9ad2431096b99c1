//! XEP-0199 XMPP Ping.

use auklet_core::event::EventPayload;
use tracing::debug;
use xmpp_parsers::minidom::Element;
use xmpp_parsers::ns;

use crate::correlator::Request;
use crate::criteria::Criterion;
use crate::error::ProtocolError;
use crate::module::{ModuleContext, XmppModule};
use crate::stanza::{IqType, StanzaExt, build_iq, iq_result_for};

pub const PING_MODULE_TYPE: &str = ns::PING;

const FEATURES: &[&str] = &[ns::PING];

/// Answers inbound pings and builds outbound ones.
pub struct PingModule {
    criterion: Criterion,
}

impl PingModule {
    pub fn new() -> Self {
        Self {
            criterion: Criterion::chain([
                Criterion::name("iq"),
                Criterion::name_and_namespace("ping", ns::PING),
            ]),
        }
    }

    /// A ping to `to`, or to our own server when `None`.
    pub fn ping(to: Option<&str>) -> Request<()> {
        Request::unit(build_iq(
            IqType::Get,
            to,
            Some(Element::builder("ping", ns::PING).build()),
        ))
    }
}

impl Default for PingModule {
    fn default() -> Self {
        Self::new()
    }
}

impl XmppModule for PingModule {
    fn module_type(&self) -> &str {
        PING_MODULE_TYPE
    }

    fn features(&self) -> &[&str] {
        FEATURES
    }

    fn criterion(&self) -> Option<&Criterion> {
        Some(&self.criterion)
    }

    fn process(&self, stanza: &Element, ctx: &ModuleContext) -> Result<(), ProtocolError> {
        match stanza.iq_type() {
            Some(IqType::Get) => {
                let from = stanza.from_attr().map(str::to_string);
                debug!(from = from.as_deref().unwrap_or_default(), "answering ping");
                ctx.send(&iq_result_for(stanza)).map_err(|error| {
                    ProtocolError::internal_server_error(format!("ping reply not sent: {error}"))
                })?;
                if let Err(error) =
                    ctx.publish("xmpp.ping.received", PING_MODULE_TYPE, EventPayload::PingReceived { from })
                {
                    debug!(%error, "ping event not published");
                }
                Ok(())
            }
            Some(IqType::Set) => Err(ProtocolError::not_acceptable("ping must be sent as get")),
            _ => Err(ProtocolError::bad_request("unexpected ping stanza")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::RequestCorrelator;
    use crate::error::DefinedCondition;
    use crate::transport::MockStanzaSink;
    use auklet_core::event::{EventBus, LocalEventBus};
    use std::sync::Arc;

    fn ctx_with(sink: MockStanzaSink, bus: Arc<LocalEventBus>) -> ModuleContext {
        ModuleContext::new(bus, Arc::new(RequestCorrelator::default()), Arc::new(sink))
    }

    fn ping(kind: &str) -> Element {
        format!(
            "<iq xmlns='jabber:client' type='{kind}' id='c2s1' from='capulet.lit' \
             to='juliet@capulet.lit/balcony'><ping xmlns='urn:xmpp:ping'/></iq>"
        )
        .parse()
        .unwrap()
    }

    #[test]
    fn matches_only_ping_iqs() {
        let module = PingModule::new();
        let criterion = module.criterion().unwrap();
        assert!(criterion.matches(&ping("get")));

        let other: Element = "<iq xmlns='jabber:client' type='get' id='x'><query xmlns='jabber:iq:version'/></iq>"
            .parse()
            .unwrap();
        assert!(!criterion.matches(&other));
    }

    #[test]
    fn get_is_answered_with_result_and_published() {
        let mut sink = MockStanzaSink::new();
        sink.expect_send()
            .withf(|reply| {
                reply.iq_type() == Some(IqType::Result)
                    && reply.id() == Some("c2s1")
                    && reply.to_attr() == Some("capulet.lit")
            })
            .times(1)
            .returning(|_| Ok(()));
        let bus = Arc::new(LocalEventBus::new());
        let mut events = bus.subscribe_channel("xmpp.ping.*", 4).unwrap();

        PingModule::new()
            .process(&ping("get"), &ctx_with(sink, bus))
            .unwrap();

        let event = events.try_recv().expect("ping event");
        assert_eq!(
            event.payload,
            EventPayload::PingReceived {
                from: Some("capulet.lit".to_string())
            }
        );
    }

    #[test]
    fn set_is_not_acceptable() {
        let error = PingModule::new()
            .process(
                &ping("set"),
                &ctx_with(MockStanzaSink::new(), Arc::new(LocalEventBus::new())),
            )
            .unwrap_err();
        assert_eq!(error.condition, DefinedCondition::NotAcceptable);
    }

    #[test]
    fn outbound_ping_is_a_get_with_ping_child() {
        let request = PingModule::ping(Some("capulet.lit"));
        let stanza = request.stanza();
        assert_eq!(stanza.iq_type(), Some(IqType::Get));
        assert_eq!(stanza.to_attr(), Some("capulet.lit"));
        assert!(stanza.has_child("ping", ns::PING));
    }
}
