use auklet_core::event::{EventPayload, PubSubItem};
use auklet_xmpp::stanza::{IqType, StanzaExt, build_iq, to_xml_string};
use auklet_xmpp::{Criterion, Element, ModuleContext, ProtocolError, Request, XmppModule};
use tracing::{debug, warn};
use xmpp_parsers::jid::Jid;

use crate::stanzas::{
    NS_PUBSUB, NS_PUBSUB_EVENT, NS_PUBSUB_OWNER, PublishingInfo, RetrieveResponse,
    RetrievedAffiliation, Subscription, parse_affiliations_response, parse_publish_response,
    parse_retrieve_response, parse_subscribe_response, parse_subscriptions_response,
};

pub const PUBSUB_MODULE_TYPE: &str = NS_PUBSUB;

pub const EVENT_CHANNEL: &str = "xmpp.pubsub.event";
pub const PURGED_CHANNEL: &str = "xmpp.pubsub.purged";
pub const DELETED_CHANNEL: &str = "xmpp.pubsub.deleted";

/// XEP-0060 subscriber/publisher side.
///
/// Inbound event notifications become bus events; the associated functions
/// build outbound requests to send with [`ModuleContext::send_request`].
pub struct PubSubModule {
    criterion: Criterion,
}

impl PubSubModule {
    pub fn new() -> Self {
        Self {
            criterion: Criterion::chain([
                Criterion::name("message"),
                Criterion::name_and_namespace("event", NS_PUBSUB_EVENT),
            ]),
        }
    }

    /// Create `node`, optionally with a submitted configuration form.
    pub fn create(service: &Jid, node: &str, config_form: Option<Element>) -> Request<()> {
        let mut pubsub = pubsub(NS_PUBSUB)
            .append(Element::builder("create", NS_PUBSUB).attr("node", node).build());
        if let Some(form) = config_form {
            pubsub = pubsub.append(Element::builder("configure", NS_PUBSUB).append(form).build());
        }
        Request::unit(set(service, pubsub.build()))
    }

    pub fn subscribe(service: &Jid, node: &str, jid: &Jid) -> Request<Subscription> {
        let pubsub = pubsub(NS_PUBSUB)
            .append(
                Element::builder("subscribe", NS_PUBSUB)
                    .attr("node", node)
                    .attr("jid", jid.to_string())
                    .build(),
            )
            .build();
        Request::new(set(service, pubsub), |response| {
            parse_subscribe_response(&response)
        })
    }

    pub fn unsubscribe(
        service: &Jid,
        node: &str,
        jid: &Jid,
        subid: Option<&str>,
    ) -> Request<()> {
        let pubsub = pubsub(NS_PUBSUB)
            .append(
                Element::builder("unsubscribe", NS_PUBSUB)
                    .attr("node", node)
                    .attr("jid", jid.to_string())
                    .attr("subid", subid.map(str::to_string))
                    .build(),
            )
            .build();
        Request::unit(set(service, pubsub))
    }

    /// Remove every item from `node`. Owner only.
    pub fn purge_items(service: &Jid, node: &str) -> Request<()> {
        let pubsub = pubsub(NS_PUBSUB_OWNER)
            .append(Element::builder("purge", NS_PUBSUB_OWNER).attr("node", node).build())
            .build();
        Request::unit(set(service, pubsub))
    }

    pub fn retrieve_subscriptions(service: &Jid, node: &str) -> Request<Vec<Subscription>> {
        Self::subscriptions_request(NS_PUBSUB, service, node)
    }

    pub fn retrieve_subscriptions_as_owner(
        service: &Jid,
        node: &str,
    ) -> Request<Vec<Subscription>> {
        Self::subscriptions_request(NS_PUBSUB_OWNER, service, node)
    }

    fn subscriptions_request(
        ns: &'static str,
        service: &Jid,
        node: &str,
    ) -> Request<Vec<Subscription>> {
        let pubsub = pubsub(ns)
            .append(Element::builder("subscriptions", ns).attr("node", node).build())
            .build();
        Request::new(get(Some(service), pubsub), move |response| {
            parse_subscriptions_response(&response, ns)
        })
    }

    /// Set the state of each listed subscription. Owner only.
    pub fn modify_subscriptions(
        service: &Jid,
        node: &str,
        subscriptions: &[Subscription],
    ) -> Request<()> {
        let entries = subscriptions.iter().map(|subscription| {
            Element::builder("subscription", NS_PUBSUB_OWNER)
                .attr("jid", subscription.jid.to_string())
                .attr("subscription", subscription.state.as_str())
                .build()
        });
        let pubsub = pubsub(NS_PUBSUB_OWNER)
            .append(
                Element::builder("subscriptions", NS_PUBSUB_OWNER)
                    .attr("node", node)
                    .append_all(entries)
                    .build(),
            )
            .build();
        Request::unit(set(service, pubsub))
    }

    /// Retract `item_id` from `node`.
    pub fn delete_item(service: &Jid, node: &str, item_id: &str) -> Request<()> {
        let pubsub = pubsub(NS_PUBSUB)
            .append(
                Element::builder("retract", NS_PUBSUB)
                    .attr("node", node)
                    .append(Element::builder("item", NS_PUBSUB).attr("id", item_id).build())
                    .build(),
            )
            .build();
        Request::unit(set(service, pubsub))
    }

    /// Fetch one item, or every item when `item_id` is `None`.
    pub fn retrieve_items(
        service: &Jid,
        node: &str,
        item_id: Option<&str>,
    ) -> Request<RetrieveResponse> {
        let mut items = Element::builder("items", NS_PUBSUB).attr("node", node);
        if let Some(id) = item_id {
            items = items.append(Element::builder("item", NS_PUBSUB).attr("id", id).build());
        }
        let pubsub = pubsub(NS_PUBSUB).append(items.build()).build();
        Request::new(get(Some(service), pubsub), |response| {
            parse_retrieve_response(&response)
        })
    }

    /// Publish `payload` to `node`. `service` of `None` targets our own PEP
    /// service.
    pub fn publish(
        service: Option<&Jid>,
        node: &str,
        item_id: Option<&str>,
        payload: Option<Element>,
    ) -> Request<PublishingInfo> {
        let mut item = Element::builder("item", NS_PUBSUB).attr("id", item_id.map(str::to_string));
        if let Some(payload) = payload {
            item = item.append(payload);
        }
        let pubsub = pubsub(NS_PUBSUB)
            .append(
                Element::builder("publish", NS_PUBSUB)
                    .attr("node", node)
                    .append(item.build())
                    .build(),
            )
            .build();
        let to = service.map(Jid::to_string);
        Request::new(
            build_iq(IqType::Set, to.as_deref(), Some(pubsub)),
            |response| parse_publish_response(&response),
        )
    }

    pub fn retrieve_affiliations(
        service: Option<&Jid>,
        node: Option<&str>,
    ) -> Request<Vec<RetrievedAffiliation>> {
        let pubsub = pubsub(NS_PUBSUB)
            .append(
                Element::builder("affiliations", NS_PUBSUB)
                    .attr("node", node.map(str::to_string))
                    .build(),
            )
            .build();
        Request::new(get(service, pubsub), |response| {
            parse_affiliations_response(&response)
        })
    }

    fn publish_items(
        &self,
        service: Option<String>,
        items: &Element,
        ctx: &ModuleContext,
    ) -> Result<(), ProtocolError> {
        let node = event_node(items)?;
        let items: Vec<PubSubItem> = items
            .children()
            .filter(|child| child.name() == "item")
            .map(|item| PubSubItem {
                id: item.attr("id").map(str::to_string),
                payload: item.children().next().map(to_xml_string),
            })
            .collect();
        debug!(node = %node, count = items.len(), "pubsub notification");

        emit(
            ctx,
            EVENT_CHANNEL,
            EventPayload::PubSubEventReceived {
                service,
                node,
                items,
            },
        )
    }
}

impl Default for PubSubModule {
    fn default() -> Self {
        Self::new()
    }
}

impl XmppModule for PubSubModule {
    fn module_type(&self) -> &str {
        PUBSUB_MODULE_TYPE
    }

    fn criterion(&self) -> Option<&Criterion> {
        Some(&self.criterion)
    }

    fn process(&self, stanza: &Element, ctx: &ModuleContext) -> Result<(), ProtocolError> {
        let event = stanza
            .get_child("event", NS_PUBSUB_EVENT)
            .ok_or_else(|| ProtocolError::bad_request("missing pubsub event"))?;
        let service = stanza.from_attr().map(str::to_string);

        let Some(child) = event.children().next() else {
            return Err(ProtocolError::bad_request("empty pubsub event"));
        };
        match child.name() {
            "items" => self.publish_items(service, child, ctx),
            "purge" => emit(
                ctx,
                PURGED_CHANNEL,
                EventPayload::PubSubNodePurged {
                    service,
                    node: event_node(child)?,
                },
            ),
            "delete" => emit(
                ctx,
                DELETED_CHANNEL,
                EventPayload::PubSubNodeDeleted {
                    service,
                    node: event_node(child)?,
                },
            ),
            other => {
                debug!(element = other, "unsupported pubsub event");
                Err(ProtocolError::bad_request(format!(
                    "unsupported pubsub event <{other}/>"
                )))
            }
        }
    }
}

fn pubsub(ns: &str) -> xmpp_parsers::minidom::ElementBuilder {
    Element::builder("pubsub", ns)
}

fn set(service: &Jid, pubsub: Element) -> Element {
    build_iq(IqType::Set, Some(&service.to_string()), Some(pubsub))
}

fn get(service: Option<&Jid>, pubsub: Element) -> Element {
    let to = service.map(Jid::to_string);
    build_iq(IqType::Get, to.as_deref(), Some(pubsub))
}

fn event_node(element: &Element) -> Result<String, ProtocolError> {
    element
        .attr("node")
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::bad_request(format!("<{}/> without node", element.name())))
}

fn emit(ctx: &ModuleContext, channel: &str, payload: EventPayload) -> Result<(), ProtocolError> {
    ctx.publish(channel, PUBSUB_MODULE_TYPE, payload)
        .map_err(|error| {
            warn!(channel, %error, "failed to publish pubsub event");
            ProtocolError::internal_server_error("event not delivered")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanzas::{PubSubError, SubscriptionState};
    use assert_matches::assert_matches;
    use auklet_core::event::{EventBus, LocalEventBus};
    use auklet_xmpp::{DefinedCondition, RequestCorrelator, StanzaSink, TransportError};
    use std::str::FromStr;
    use std::sync::Arc;

    struct NullSink;

    impl StanzaSink for NullSink {
        fn send(&self, _stanza: &Element) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn ctx(bus: Arc<LocalEventBus>) -> ModuleContext {
        ModuleContext::new(bus, Arc::new(RequestCorrelator::default()), Arc::new(NullSink))
    }

    fn jid(value: &str) -> Jid {
        Jid::from_str(value).unwrap()
    }

    fn message(event: &str) -> Element {
        format!(
            "<message xmlns='jabber:client' from='pubsub.shakespeare.lit' to='francisco@denmark.lit' id='foo'>\
             <event xmlns='http://jabber.org/protocol/pubsub#event'>{event}</event></message>"
        )
        .parse()
        .unwrap()
    }

    // ── Inbound notifications ─────────────────────────────────────

    #[test]
    fn criterion_selects_event_messages() {
        let module = PubSubModule::new();
        let criterion = module.criterion().unwrap();
        assert!(criterion.matches(&message("<items node='n'/>")));

        let plain: Element = "<message xmlns='jabber:client'><body>hi</body></message>"
            .parse()
            .unwrap();
        assert!(!criterion.matches(&plain));
    }

    #[test]
    fn items_notification_publishes_one_event() {
        let bus = Arc::new(LocalEventBus::new());
        let mut events = bus.subscribe_channel("xmpp.pubsub.*", 8).unwrap();

        PubSubModule::new()
            .process(
                &message(
                    "<items node='princely_musings'>\
                     <item id='ae890ac52d0df67ed7cfdf51b644e901'>\
                     <entry xmlns='http://www.w3.org/2005/Atom'><title>Soliloquy</title></entry>\
                     </item></items>",
                ),
                &ctx(bus),
            )
            .unwrap();

        let event = events.try_recv().expect("pubsub event");
        assert_eq!(event.channel.as_str(), EVENT_CHANNEL);
        assert_matches!(
            event.payload,
            EventPayload::PubSubEventReceived { service, node, items }
                if service.as_deref() == Some("pubsub.shakespeare.lit")
                    && node == "princely_musings"
                    && items.len() == 1
                    && items[0].payload.as_deref().is_some_and(|p| p.contains("Soliloquy"))
        );
        assert!(events.try_recv().is_none());
    }

    #[test]
    fn purge_and_delete_have_their_own_channels() {
        let bus = Arc::new(LocalEventBus::new());
        let mut events = bus.subscribe_channel("xmpp.pubsub.*", 8).unwrap();
        let module = PubSubModule::new();
        let ctx = ctx(bus);

        module
            .process(&message("<purge node='princely_musings'/>"), &ctx)
            .unwrap();
        module
            .process(&message("<delete node='princely_musings'/>"), &ctx)
            .unwrap();

        assert_eq!(events.try_recv().unwrap().channel.as_str(), PURGED_CHANNEL);
        assert_eq!(events.try_recv().unwrap().channel.as_str(), DELETED_CHANNEL);
    }

    #[test]
    fn malformed_notifications_are_bad_requests() {
        let module = PubSubModule::new();
        let ctx = ctx(Arc::new(LocalEventBus::new()));

        for event in ["<items/>", "", "<configuration node='n'/>"] {
            let error = module.process(&message(event), &ctx).unwrap_err();
            assert_eq!(error.condition, DefinedCondition::BadRequest, "event {event:?}");
        }
    }

    // ── Outbound requests ─────────────────────────────────────────

    #[test]
    fn subscribe_request_shape_and_result() {
        let request = PubSubModule::subscribe(
            &jid("pubsub.shakespeare.lit"),
            "princely_musings",
            &jid("francisco@denmark.lit"),
        );
        let stanza = request.stanza();
        assert_eq!(stanza.iq_type(), Some(IqType::Set));
        assert_eq!(stanza.to_attr(), Some("pubsub.shakespeare.lit"));
        let subscribe = stanza
            .get_child("pubsub", NS_PUBSUB)
            .and_then(|p| p.get_child("subscribe", NS_PUBSUB))
            .unwrap();
        assert_eq!(subscribe.attr("node"), Some("princely_musings"));
        assert_eq!(subscribe.attr("jid"), Some("francisco@denmark.lit"));
    }

    #[test]
    fn owner_requests_use_owner_namespace() {
        let service = jid("pubsub.shakespeare.lit");
        let purge = PubSubModule::purge_items(&service, "n");
        assert!(purge.stanza().has_child("pubsub", NS_PUBSUB_OWNER));

        let subscriptions = PubSubModule::modify_subscriptions(
            &service,
            "n",
            &[Subscription {
                node: "n".to_string(),
                jid: jid("bard@shakespeare.lit"),
                state: SubscriptionState::Subscribed,
                subid: None,
            }],
        );
        let entry = subscriptions
            .stanza()
            .get_child("pubsub", NS_PUBSUB_OWNER)
            .and_then(|p| p.get_child("subscriptions", NS_PUBSUB_OWNER))
            .and_then(|s| s.get_child("subscription", NS_PUBSUB_OWNER))
            .unwrap();
        assert_eq!(entry.attr("subscription"), Some("subscribed"));

        let owner_view = PubSubModule::retrieve_subscriptions_as_owner(&service, "n");
        assert_eq!(owner_view.stanza().iq_type(), Some(IqType::Get));
        assert!(owner_view.stanza().has_child("pubsub", NS_PUBSUB_OWNER));
    }

    #[test]
    fn publish_without_service_targets_own_account() {
        let payload = Element::builder("entry", "http://www.w3.org/2005/Atom").build();
        let request = PubSubModule::publish(None, "princely_musings", Some("item-1"), Some(payload));
        let stanza = request.stanza();
        assert_eq!(stanza.to_attr(), None);
        let item = stanza
            .get_child("pubsub", NS_PUBSUB)
            .and_then(|p| p.get_child("publish", NS_PUBSUB))
            .and_then(|p| p.get_child("item", NS_PUBSUB))
            .unwrap();
        assert_eq!(item.attr("id"), Some("item-1"));
        assert!(item.has_child("entry", "http://www.w3.org/2005/Atom"));
    }

    #[test]
    fn create_and_retrieve_builders() {
        let service = jid("pubsub.shakespeare.lit");

        let form = Element::builder("x", "jabber:x:data").attr("type", "submit").build();
        let create = PubSubModule::create(&service, "princely_musings", Some(form));
        let pubsub = create.stanza().get_child("pubsub", NS_PUBSUB).unwrap();
        assert!(pubsub.has_child("create", NS_PUBSUB));
        assert!(pubsub.has_child("configure", NS_PUBSUB));

        let all = PubSubModule::retrieve_items(&service, "princely_musings", None);
        let items = all
            .stanza()
            .get_child("pubsub", NS_PUBSUB)
            .and_then(|p| p.get_child("items", NS_PUBSUB))
            .unwrap();
        assert_eq!(items.children().count(), 0);

        let affiliations = PubSubModule::retrieve_affiliations(None, None);
        let element = affiliations
            .stanza()
            .get_child("pubsub", NS_PUBSUB)
            .and_then(|p| p.get_child("affiliations", NS_PUBSUB))
            .unwrap();
        assert_eq!(element.attr("node"), None);
    }

    #[tokio::test]
    async fn malformed_subscribe_result_is_reported() {
        let correlator = RequestCorrelator::default();
        let request = PubSubModule::subscribe(
            &jid("pubsub.shakespeare.lit"),
            "n",
            &jid("francisco@denmark.lit"),
        )
        .with_id("s1");
        let (_, handle) = correlator.submit(request).unwrap();

        let result: Element = "<iq xmlns='jabber:client' type='result' id='s1'>\
                               <pubsub xmlns='http://jabber.org/protocol/pubsub'>\
                               <subscription node='n' jid='francisco@denmark.lit' subscription='lurking'/>\
                               </pubsub></iq>"
            .parse()
            .unwrap();
        assert!(correlator.resolve_response(&result));

        let error = handle.await.unwrap_err();
        let source = match error {
            auklet_xmpp::RequestError::MalformedResponse { source, .. } => source,
            other => panic!("unexpected error: {other}"),
        };
        assert_eq!(
            source.downcast_ref::<PubSubError>(),
            Some(&PubSubError::UnknownSubscriptionState("lurking".to_string()))
        );
    }
}
