#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio::time::timeout;

    use auklet_core::config::{Config, env_from};
    use auklet_core::event::{
        Channel, Event, EventBus, EventHandler, EventPayload, EventSource, LocalEventBus,
    };
    use auklet_pubsub::{Jid, PubSubModule, SubscriptionState};
    use auklet_xmpp::modules::PingModule;
    use auklet_xmpp::stanza::{IqType, build_iq, parse_stanza};
    use auklet_xmpp::{
        ChannelSink, ConfigurationError, Criterion, DefinedCondition, DispatchOutcome, Element,
        InboundOutcome, ModuleContext, ProtocolError, Request, RequestCorrelator, RequestError,
        StanzaExt, StanzaReceiver, XmppClient, XmppModule, stanza_channel,
    };

    const TIMEOUT: Duration = Duration::from_millis(500);

    const CONFIG: &str = r#"
[account]
jid = "francisco@denmark.lit"
password = "secret"

[requests]
timeout_seconds = 5
sweep_interval_ms = 100
"#;

    struct Harness {
        client: XmppClient,
        bus: Arc<LocalEventBus>,
        outbound: StanzaReceiver,
    }

    impl Harness {
        fn new() -> Self {
            let config = Config::from_toml_with_env(CONFIG, env_from(&[])).expect("config should load");
            let (sender, outbound) = stanza_channel(64);
            let bus = Arc::new(LocalEventBus::new());
            let client = XmppClient::with_correlator(
                bus.clone(),
                Arc::new(ChannelSink::new(sender)),
                Arc::new(RequestCorrelator::new(config.requests.timeout())),
            );
            client
                .register_module(Arc::new(PubSubModule::new()))
                .expect("pubsub registers");
            client
                .register_module(Arc::new(PingModule::new()))
                .expect("ping registers");
            Self {
                client,
                bus,
                outbound,
            }
        }

        fn inbound(&self, xml: &str) -> InboundOutcome {
            self.client
                .handle_raw(xml.as_bytes())
                .expect("inbound stanza should parse")
        }

        fn next_outbound(&mut self) -> Option<Element> {
            self.outbound
                .try_recv()
                .ok()
                .map(|bytes| parse_stanza(&bytes).expect("outbound stanza should parse"))
        }
    }

    fn jid(value: &str) -> Jid {
        Jid::from_str(value).unwrap()
    }

    struct Counter {
        module_type: &'static str,
        criterion: Criterion,
        calls: Mutex<Vec<String>>,
    }

    impl Counter {
        fn new(module_type: &'static str) -> Self {
            Self {
                module_type,
                criterion: Criterion::name_and_namespace("query", "urn:example:shared"),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl XmppModule for Counter {
        fn module_type(&self) -> &str {
            self.module_type
        }

        fn criterion(&self) -> Option<&Criterion> {
            Some(&self.criterion)
        }

        fn process(&self, stanza: &Element, ctx: &ModuleContext) -> Result<(), ProtocolError> {
            self.calls
                .lock()
                .unwrap()
                .push(stanza.id().unwrap_or_default().to_string());
            ctx.send(&auklet_xmpp::stanza::iq_result_for(stanza))
                .map_err(|e| ProtocolError::internal_server_error(e.to_string()))
        }
    }

    // ── 1. At most one handler ───────────────────────────────────────

    #[tokio::test]
    async fn only_the_first_matching_module_processes_a_stanza() {
        let mut harness = Harness::new();
        let first = Arc::new(Counter::new("first"));
        let second = Arc::new(Counter::new("second"));
        harness.client.register_module(first.clone()).unwrap();
        harness.client.register_module(second.clone()).unwrap();

        let outcome = harness.inbound(
            "<iq xmlns='jabber:client' type='get' id='q1' from='a@b.c'>\
             <query xmlns='urn:example:shared'/></iq>",
        );

        assert_eq!(
            outcome,
            InboundOutcome::Dispatched(DispatchOutcome::Handled {
                module: "first".to_string()
            })
        );
        assert_eq!(first.calls.lock().unwrap().len(), 1);
        assert!(second.calls.lock().unwrap().is_empty());
        assert_eq!(
            harness.next_outbound().unwrap().iq_type(),
            Some(IqType::Result)
        );
        assert!(harness.next_outbound().is_none());
    }

    // ── 2. Correlation uniqueness ────────────────────────────────────

    #[tokio::test]
    async fn pending_id_cannot_be_reused_until_resolved() {
        let mut harness = Harness::new();
        let request = || Request::raw(build_iq(IqType::Get, None, None)).with_id("dup");

        let first = harness.client.send_request(request()).unwrap();
        assert_matches!(
            harness.client.send_request(request()),
            Err(ConfigurationError::DuplicateCorrelationId(id)) if id == "dup"
        );
        assert!(harness.next_outbound().is_some());
        assert!(harness.next_outbound().is_none());

        harness.inbound("<iq xmlns='jabber:client' type='result' id='dup'/>");
        timeout(TIMEOUT, first)
            .await
            .expect("timed out")
            .expect("first request succeeds");

        assert!(harness.client.send_request(request()).is_ok());
    }

    // ── 3. Exactly-once resolution ───────────────────────────────────

    #[tokio::test]
    async fn response_then_sweep_then_cancel_resolve_once() {
        let harness = Harness::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&calls);

        let (id, _) = harness
            .client
            .correlator()
            .register(
                build_iq(IqType::Get, None, None),
                Some(Duration::ZERO),
                Box::new(move |outcome| recorded.lock().unwrap().push(outcome.is_ok())),
            )
            .unwrap();

        let response = format!("<iq xmlns='jabber:client' type='result' id='{id}'/>");
        assert_eq!(harness.inbound(&response), InboundOutcome::Response);
        assert_eq!(harness.client.correlator().timeout_sweep(), 0);
        assert_eq!(harness.client.on_disconnect("bye"), 0);
        assert!(!harness.client.correlator().resolve(&id, Err(RequestError::Timeout { id: id.clone() })));

        assert_eq!(*calls.lock().unwrap(), vec![true]);
    }

    // ── 4. Stale responses ───────────────────────────────────────────

    #[tokio::test]
    async fn unknown_responses_are_dropped_quietly() {
        let mut harness = Harness::new();
        let pending = harness
            .client
            .send_request(PingModule::ping(Some("denmark.lit")))
            .unwrap();
        harness.next_outbound();

        let outcome = harness.inbound("<iq xmlns='jabber:client' type='error' id='never-sent'/>");

        assert_eq!(outcome, InboundOutcome::Dispatched(DispatchOutcome::Ignored));
        assert!(harness.next_outbound().is_none());
        assert!(harness.client.correlator().is_pending(pending.id()));
    }

    // ── 5. Disconnect ────────────────────────────────────────────────

    #[tokio::test]
    async fn disconnect_cancels_every_pending_request() {
        let harness = Harness::new();
        let mut lost = harness
            .client
            .subscribe_channel("system.connection.lost", 4)
            .unwrap();
        let handles: Vec<_> = (0..5)
            .map(|_| {
                harness
                    .client
                    .send_request(PingModule::ping(None))
                    .unwrap()
            })
            .collect();

        assert_eq!(harness.client.on_disconnect("stream reset"), 5);
        assert_eq!(harness.client.correlator().pending_count(), 0);

        for handle in handles {
            let result = timeout(TIMEOUT, handle).await.expect("timed out");
            assert_matches!(result, Err(RequestError::Cancelled { reason, .. }) if reason == "stream reset");
        }
        let event = timeout(TIMEOUT, lost.recv()).await.expect("timed out").unwrap();
        assert_matches!(
            event.payload,
            EventPayload::ConnectionLost { cancelled_requests: 5, .. }
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn sweeper_times_out_unanswered_requests() {
        let harness = Harness::new();
        let sweeper = harness
            .client
            .spawn_timeout_sweeper(Duration::from_millis(100));

        let handle = harness
            .client
            .send_request(PingModule::ping(None).with_timeout(Duration::from_secs(1)))
            .unwrap();

        tokio::time::advance(Duration::from_millis(1200)).await;
        tokio::task::yield_now().await;

        assert_matches!(handle.await, Err(RequestError::Timeout { .. }));
        sweeper.abort();
    }

    // ── 6. Event ordering ────────────────────────────────────────────

    #[tokio::test]
    async fn every_subscriber_sees_events_in_publish_order() {
        let harness = Harness::new();
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        for seen in [&seen_a, &seen_b] {
            let seen = Arc::clone(seen);
            let handler: EventHandler = Arc::new(move |event: &Event| {
                if let EventPayload::Custom { data } = &event.payload {
                    seen.lock().unwrap().push(data["n"].as_u64().unwrap_or_default());
                }
                Ok(())
            });
            harness.client.subscribe("app.**", handler).unwrap();
        }

        for n in 0..20u64 {
            harness
                .bus
                .publish(Event::new(
                    Channel::new("app.counter.tick").unwrap(),
                    EventSource::App("test".into()),
                    EventPayload::Custom {
                        data: serde_json::json!({ "n": n }),
                    },
                ))
                .unwrap();
        }

        let expected: Vec<u64> = (0..20).collect();
        assert_eq!(*seen_a.lock().unwrap(), expected);
        assert_eq!(*seen_b.lock().unwrap(), expected);
    }

    // ── 7. Unhandled requests ────────────────────────────────────────

    #[tokio::test]
    async fn unhandled_request_is_answered_with_service_unavailable() {
        let mut harness = Harness::new();

        harness.inbound(
            "<iq xmlns='jabber:client' type='get' id='disco1' from='romeo@montague.lit/orchard' \
             to='francisco@denmark.lit/barracks'><query xmlns='http://jabber.org/protocol/disco#info'/></iq>",
        );

        let reply = harness.next_outbound().expect("error reply");
        assert_eq!(reply.iq_type(), Some(IqType::Error));
        assert_eq!(reply.id(), Some("disco1"));
        assert_eq!(reply.to_attr(), Some("romeo@montague.lit/orchard"));
        assert_eq!(reply.from_attr(), Some("francisco@denmark.lit/barracks"));
        let error = ProtocolError::from_stanza(&reply).unwrap();
        assert_eq!(error.condition, DefinedCondition::ServiceUnavailable);
    }

    // ── 8. PubSub subscribe round trip ───────────────────────────────

    #[tokio::test]
    async fn pubsub_subscribe_resolves_to_typed_subscription() {
        let mut harness = Harness::new();

        let handle = harness
            .client
            .send_request(
                PubSubModule::subscribe(
                    &jid("pubsub.shakespeare.lit"),
                    "princely_musings",
                    &jid("francisco@denmark.lit"),
                )
                .with_id("r1"),
            )
            .unwrap();

        let sent = harness.next_outbound().expect("subscribe request");
        assert_eq!(sent.id(), Some("r1"));

        let outcome = harness.inbound(
            "<iq xmlns='jabber:client' type='result' id='r1' from='pubsub.shakespeare.lit'>\
             <pubsub xmlns='http://jabber.org/protocol/pubsub'>\
             <subscription node='princely_musings' jid='francisco@denmark.lit' subscription='pending'/>\
             </pubsub></iq>",
        );
        assert_eq!(outcome, InboundOutcome::Response);

        let subscription = timeout(TIMEOUT, handle)
            .await
            .expect("timed out")
            .expect("subscription");
        assert_eq!(subscription.state, SubscriptionState::Pending);
        assert_eq!(subscription.node, "princely_musings");
    }

    #[tokio::test]
    async fn pubsub_error_result_surfaces_remote_condition() {
        let harness = Harness::new();
        let handle = harness
            .client
            .send_request(
                PubSubModule::purge_items(&jid("pubsub.shakespeare.lit"), "princely_musings")
                    .with_id("purge1"),
            )
            .unwrap();

        harness.inbound(
            "<iq xmlns='jabber:client' type='error' id='purge1' from='pubsub.shakespeare.lit'>\
             <error type='auth'><forbidden xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
        );

        let result = timeout(TIMEOUT, handle).await.expect("timed out");
        assert_matches!(
            result,
            Err(RequestError::Remote { error, .. }) if error.condition == DefinedCondition::Forbidden
        );
    }

    // ── 9. PubSub notification ───────────────────────────────────────

    #[tokio::test]
    async fn pubsub_notification_becomes_one_event_with_ordered_items() {
        let harness = Harness::new();
        let mut events = harness
            .client
            .subscribe_channel("xmpp.pubsub.event", 8)
            .unwrap();

        harness.inbound(
            "<message xmlns='jabber:client' from='pubsub.shakespeare.lit' to='francisco@denmark.lit'>\
             <event xmlns='http://jabber.org/protocol/pubsub#event'>\
             <items node='news'>\
             <item id='first'><headline xmlns='urn:example:news'>one</headline></item>\
             <item id='second'><headline xmlns='urn:example:news'>two</headline></item>\
             </items></event></message>",
        );

        let event = timeout(TIMEOUT, events.recv())
            .await
            .expect("timed out")
            .unwrap();
        let EventPayload::PubSubEventReceived { node, items, .. } = event.payload else {
            panic!("unexpected payload: {:?}", event.payload);
        };
        assert_eq!(node, "news");
        let ids: Vec<_> = items.iter().map(|item| item.id.as_deref()).collect();
        assert_eq!(ids, vec![Some("first"), Some("second")]);
        assert!(events.try_recv().is_none());
    }

    // ── Full loop ────────────────────────────────────────────────────

    #[tokio::test]
    async fn run_loop_answers_pings_and_reports_disconnect() {
        let (inbound_tx, inbound_rx) = stanza_channel(8);
        let mut harness = Harness::new();
        let mut lost = harness
            .client
            .subscribe_channel("system.connection.*", 1)
            .unwrap();

        inbound_tx
            .send(
                b"<iq xmlns='jabber:client' type='get' id='s2c1' from='denmark.lit'>\
                  <ping xmlns='urn:xmpp:ping'/></iq>"
                    .to_vec(),
            )
            .await
            .unwrap();
        inbound_tx.send(b"not xml".to_vec()).await.unwrap();
        drop(inbound_tx);

        timeout(TIMEOUT, harness.client.run(inbound_rx))
            .await
            .expect("timed out");

        let pong = harness.next_outbound().expect("pong");
        assert_eq!(pong.id(), Some("s2c1"));
        assert_eq!(pong.iq_type(), Some(IqType::Result));
        assert!(lost.try_recv().is_some());
        assert_eq!(
            harness.client.list_features(),
            vec!["urn:xmpp:ping".to_string()]
        );
    }
}
