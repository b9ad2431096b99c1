use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EventBusError, HandlerError};

/// Event domains a channel may start with.
pub const DOMAINS: &[&str] = &["system", "xmpp", "app"];

/// Dotted event channel such as `xmpp.pubsub.event`.
///
/// Segments are non-empty runs of `a-z` and `0-9`, and the first segment is
/// one of [`DOMAINS`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, EventBusError> {
        let name = name.into();
        match Self::is_valid(&name) {
            true => Ok(Self(name)),
            false => Err(EventBusError::InvalidChannel(name)),
        }
    }

    pub fn is_valid(name: &str) -> bool {
        let domain = name.split('.').next().unwrap_or_default();
        DOMAINS.contains(&domain)
            && name.split('.').all(|segment| {
                !segment.is_empty()
                    && segment
                        .bytes()
                        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            })
    }

    /// First segment, e.g. `xmpp`.
    pub fn domain(&self) -> &str {
        self.0.split_once('.').map_or(self.0.as_str(), |(domain, _)| domain)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// Envelope delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
    /// Links events that belong to one operation.
    pub correlation_id: Option<Uuid>,
    pub source: EventSource,
    pub payload: EventPayload,
}

impl Event {
    /// Stamps a fresh id and the current time.
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            payload,
        }
    }

    pub fn correlated(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "camelCase")]
pub enum EventSource {
    /// Engine internals, e.g. the client loop.
    System(String),
    /// An XMPP module, named by its module type.
    Module(String),
    /// Code embedding the engine.
    App(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── System events ──────────────────────────────────────────────
    ModuleRegistered {
        module_type: String,
        features: Vec<String>,
    },
    ConnectionLost {
        reason: String,
        cancelled_requests: usize,
    },

    // ── XMPP ping events ──────────────────────────────────────────
    PingReceived {
        from: Option<String>,
    },

    // ── XMPP publish/subscribe events ─────────────────────────────
    PubSubEventReceived {
        service: Option<String>,
        node: String,
        items: Vec<PubSubItem>,
    },
    PubSubNodePurged {
        service: Option<String>,
        node: String,
    },
    PubSubNodeDeleted {
        service: Option<String>,
        node: String,
    },

    // ── Application events ────────────────────────────────────────
    Custom {
        data: serde_json::Value,
    },
}

/// A single item carried by a publish/subscribe notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubItem {
    /// Item id, when the publisher assigned one
    pub id: Option<String>,

    /// Serialized XML payload of the item, if any
    pub payload: Option<String>,
}

/// Opaque identifier returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl std::fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Callback invoked synchronously for every matching event.
pub type EventHandler = Arc<dyn Fn(&Event) -> std::result::Result<(), HandlerError> + Send + Sync>;

pub trait EventBus: Send + Sync + 'static {
    /// Deliver `event` to every current subscriber whose pattern matches its
    /// channel, in subscription order, before returning.
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError>;

    fn subscribe(
        &self,
        pattern: &str,
        handler: EventHandler,
    ) -> std::result::Result<SubscriptionHandle, EventBusError>;

    /// Returns `false` when the handle was not (or is no longer) subscribed.
    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool;

    /// Subscribe with a bounded queue instead of a callback, for async consumers.
    fn subscribe_channel(
        &self,
        pattern: &str,
        capacity: usize,
    ) -> std::result::Result<EventSubscription, EventBusError> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handler: EventHandler =
            Arc::new(move |event: &Event| match sender.try_send(event.clone()) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    Err(HandlerError::Failed("subscriber queue full".to_string()))
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(HandlerError::Closed),
            });
        let handle = self.subscribe(pattern, handler)?;
        Ok(EventSubscription { handle, receiver })
    }
}

/// Queue-backed subscription created by [`EventBus::subscribe_channel`].
pub struct EventSubscription {
    handle: SubscriptionHandle,
    receiver: mpsc::Receiver<Event>,
}

impl EventSubscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    pub async fn recv(&mut self) -> std::result::Result<Event, EventBusError> {
        self.receiver.recv().await.ok_or(EventBusError::ChannelClosed)
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

struct Subscriber {
    handle: SubscriptionHandle,
    pattern: String,
    matcher: GlobMatcher,
    handler: EventHandler,
}

/// In-process event bus with synchronous, ordered fan-out.
///
/// Handlers run on the publishing thread after the subscriber list lock has
/// been released, so a handler may publish, subscribe or unsubscribe.
pub struct LocalEventBus {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    next_handle: AtomicU64,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn matching(&self, channel: &Channel) -> Vec<Arc<Subscriber>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|subscriber| subscriber.matcher.is_match(channel.as_str()))
            .cloned()
            .collect()
    }

    fn remove_all(&self, handles: &[SubscriptionHandle]) {
        if handles.is_empty() {
            return;
        }
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|subscriber| !handles.contains(&subscriber.handle));
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for LocalEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError> {
        if !Channel::is_valid(event.channel.as_str()) {
            return Err(EventBusError::InvalidChannel(event.channel.to_string()));
        }

        let targets = self.matching(&event.channel);
        debug!(
            channel = %event.channel,
            event_id = %event.id,
            subscribers = targets.len(),
            "publishing event"
        );

        let mut closed = Vec::new();
        for subscriber in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(&event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(HandlerError::Closed)) => {
                    debug!(
                        subscription = %subscriber.handle,
                        "subscriber closed, dropping subscription"
                    );
                    closed.push(subscriber.handle);
                }
                Ok(Err(error)) => {
                    warn!(
                        subscription = %subscriber.handle,
                        pattern = %subscriber.pattern,
                        channel = %event.channel,
                        error = %error,
                        "event handler failed"
                    );
                }
                Err(_) => {
                    warn!(
                        subscription = %subscriber.handle,
                        pattern = %subscriber.pattern,
                        channel = %event.channel,
                        "event handler panicked"
                    );
                }
            }
        }

        self.remove_all(&closed);
        Ok(())
    }

    fn subscribe(
        &self,
        pattern: &str,
        handler: EventHandler,
    ) -> std::result::Result<SubscriptionHandle, EventBusError> {
        validate_pattern(pattern)?;
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();

        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(Subscriber {
                handle,
                pattern: pattern.to_string(),
                matcher,
                handler,
            }));

        debug!(subscription = %handle, pattern, "subscribed");
        Ok(handle)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.handle != handle);
        let removed = subscribers.len() != before;
        if removed {
            debug!(subscription = %handle, "unsubscribed");
        }
        removed
    }
}

fn validate_pattern(pattern: &str) -> std::result::Result<(), EventBusError> {
    let first_segment = pattern.split('.').next().unwrap_or_default();
    if has_glob_meta(first_segment) || DOMAINS.contains(&first_segment) {
        Ok(())
    } else {
        Err(EventBusError::InvalidPattern(pattern.to_string()))
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', ']', '{', '}', '!'])
}
