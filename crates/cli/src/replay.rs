//! Offline replay of a captured stanza exchange.
//!
//! A script holds one stanza per line. Lines starting with `>>` are sent as
//! outbound requests, every other non-empty line is delivered as inbound
//! data. `#` starts a comment line.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use auklet_core::HandlerError;
use auklet_core::event::{Event, EventHandler, LocalEventBus};
use auklet_pubsub::PubSubModule;
use auklet_xmpp::modules::PingModule;
use auklet_xmpp::stanza::{parse_stanza, to_xml_string};
use auklet_xmpp::{
    ChannelSink, Element, Request, RequestCorrelator, RequestError, ResponseHandle, XmppClient,
};
use tracing::{debug, info, warn};

const REQUEST_PREFIX: &str = ">>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLine {
    Inbound(String),
    Request(String),
}

pub fn parse_script(script: &str) -> Vec<ScriptLine> {
    script
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.strip_prefix(REQUEST_PREFIX) {
            Some(request) => ScriptLine::Request(request.trim().to_string()),
            None => ScriptLine::Inbound(line.to_string()),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub request_timeout: Duration,
    pub sweep_interval: Duration,
    pub queue_capacity: usize,
    /// Cancel whatever is still pending once the script is exhausted.
    pub disconnect: bool,
}

#[derive(Debug, Default)]
pub struct ReplayReport {
    pub outbound: Vec<String>,
    pub events: Vec<String>,
    /// `(id, outcome)` per scripted request, in script order.
    pub requests: Vec<(String, String)>,
    pub features: Vec<String>,
    pub rejected_lines: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

pub async fn replay(script: &str, settings: &ReplaySettings) -> Result<ReplayReport> {
    let (sender, mut outbound) = auklet_xmpp::stanza_channel(settings.queue_capacity);
    let bus = Arc::new(LocalEventBus::new());
    let client = XmppClient::with_correlator(
        bus.clone(),
        Arc::new(ChannelSink::new(sender)),
        Arc::new(RequestCorrelator::new(settings.request_timeout)),
    );
    client.register_module(Arc::new(PingModule::new()))?;
    client.register_module(Arc::new(PubSubModule::new()))?;
    let sweeper = client.spawn_timeout_sweeper(settings.sweep_interval);

    let events = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&events);
    let handler: EventHandler = Arc::new(move |event: &Event| {
        let json = serde_json::to_string(event).map_err(|e| HandlerError::Failed(e.to_string()))?;
        recorder
            .lock()
            .map_err(|_| HandlerError::Failed("event log poisoned".to_string()))?
            .push(json);
        Ok(())
    });
    client
        .subscribe("**", handler)
        .context("failed to subscribe to events")?;

    let printer = tokio::spawn(async move {
        let mut lines = Vec::new();
        while let Some(bytes) = outbound.recv().await {
            lines.push(String::from_utf8_lossy(&bytes).into_owned());
        }
        lines
    });

    let mut report = ReplayReport::default();
    let mut handles: Vec<ResponseHandle<Element>> = Vec::new();
    for (number, line) in parse_script(script).into_iter().enumerate() {
        match line {
            ScriptLine::Inbound(xml) => {
                if client.handle_raw(xml.as_bytes()).is_err() {
                    report.rejected_lines += 1;
                }
            }
            ScriptLine::Request(xml) => {
                let stanza = match parse_stanza(xml.as_bytes()) {
                    Ok(stanza) => stanza,
                    Err(error) => {
                        warn!(line = number + 1, %error, "skipping unparseable request");
                        report.rejected_lines += 1;
                        continue;
                    }
                };
                match client.send_request(Request::raw(stanza)) {
                    Ok(handle) => handles.push(handle),
                    Err(error) => {
                        warn!(line = number + 1, %error, "skipping rejected request");
                        report.rejected_lines += 1;
                    }
                }
            }
        }
        // let the writer keep up with a bounded queue
        tokio::task::yield_now().await;
    }

    sweeper.abort();
    // the script may end between two ticks
    client.correlator().timeout_sweep();
    if settings.disconnect {
        report.cancelled = client.on_disconnect("replay finished");
    }

    for mut handle in handles {
        let outcome = match handle.try_take() {
            Some(Ok(response)) => format!("ok {}", to_xml_string(&response)),
            Some(Err(error)) => {
                if matches!(error, RequestError::Timeout { .. }) {
                    report.timed_out += 1;
                }
                format!("error {error}")
            }
            None => "pending".to_string(),
        };
        report.requests.push((handle.id().to_string(), outcome));
    }

    report.features = client.list_features();
    info!(
        features = report.features.len(),
        rejected = report.rejected_lines,
        timed_out = report.timed_out,
        "replay finished"
    );

    drop(client);
    report.outbound = printer.await.context("outbound printer failed")?;
    report.events = std::mem::take(
        &mut *events
            .lock()
            .map_err(|_| anyhow::anyhow!("event log poisoned"))?,
    );
    debug!(events = report.events.len(), "collected events");
    Ok(report)
}
