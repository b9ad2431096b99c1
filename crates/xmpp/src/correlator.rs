//! Outbound request tracking.
//!
//! Every request sent with an expectation of a reply is parked in a single
//! pending table keyed by its correlation id. The entry leaves the table in
//! exactly one way (response, timeout sweep, disconnect, or send failure)
//! and its continuation runs after removal, outside the table lock.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use xmpp_parsers::minidom::Element;

use crate::error::{ConfigurationError, DefinedCondition, ProtocolError, RequestError};
use crate::stanza::{IqType, StanzaExt};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type Transform<T> = Box<dyn FnOnce(Element) -> Result<T, BoxError> + Send>;

/// Terminal callback of a pending request. Invoked exactly once.
pub type Continuation = Box<dyn FnOnce(Result<Element, RequestError>) + Send>;

#[derive(Debug, Error)]
#[error("response transform panicked")]
pub struct TransformPanicked;

/// Lifecycle of a pending request, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Sent,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RequestState {
    fn of(outcome: &Result<Element, RequestError>) -> Self {
        match outcome {
            Ok(_) => RequestState::Completed,
            Err(RequestError::Timeout { .. }) => RequestState::TimedOut,
            Err(RequestError::Cancelled { .. }) => RequestState::Cancelled,
            Err(_) => RequestState::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Sent => "sent",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
            RequestState::TimedOut => "timed-out",
            RequestState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound stanza plus the conversion applied to its response.
pub struct Request<T> {
    stanza: Element,
    timeout: Option<Duration>,
    transform: Transform<T>,
}

impl Request<Element> {
    /// A request whose response stanza is handed back untouched.
    pub fn raw(stanza: Element) -> Self {
        Request::new(stanza, Ok::<Element, Infallible>)
    }
}

impl Request<()> {
    /// A request that only cares whether the peer answered with a result.
    pub fn unit(stanza: Element) -> Self {
        Request::new(stanza, |_| Ok::<(), Infallible>(()))
    }
}

impl<T: Send + 'static> Request<T> {
    /// `transform` turns the `type='result'` response into `T`. Its error is
    /// reported as [`RequestError::MalformedResponse`].
    pub fn new<F, E>(stanza: Element, transform: F) -> Self
    where
        F: FnOnce(Element) -> Result<T, E> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            stanza,
            timeout: None,
            transform: Box::new(move |response| {
                transform(response).map_err(|error| Box::new(error) as BoxError)
            }),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.stanza.set_attr("id", id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stanza(&self) -> &Element {
        &self.stanza
    }

    pub fn map<U, F>(self, f: F) -> Request<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let transform = self.transform;
        Request {
            stanza: self.stanza,
            timeout: self.timeout,
            transform: Box::new(move |response| transform(response).map(f)),
        }
    }
}

impl<T> std::fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("stanza", &self.stanza)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Future completed when the request reaches a terminal state.
///
/// If the continuation is dropped without firing (the correlator itself was
/// dropped) the handle resolves to [`RequestError::Cancelled`].
#[derive(Debug)]
pub struct ResponseHandle<T> {
    id: String,
    receiver: oneshot::Receiver<Result<T, RequestError>>,
}

impl<T> ResponseHandle<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Non-blocking check; `None` while the request is still pending.
    pub fn try_take(&mut self) -> Option<Result<T, RequestError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(self.dropped())),
        }
    }

    fn dropped(&self) -> RequestError {
        RequestError::Cancelled {
            id: self.id.clone(),
            reason: "request dropped".to_string(),
        }
    }
}

impl<T> Future for ResponseHandle<T> {
    type Output = Result<T, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(this.dropped())),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct PendingRequest {
    stanza: Element,
    deadline: Instant,
    continuation: Continuation,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<String, PendingRequest>,
    next_id: u64,
}

impl PendingTable {
    fn generate_id(&mut self) -> String {
        loop {
            self.next_id += 1;
            let id = format!("auklet-{}", self.next_id);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
}

pub struct RequestCorrelator {
    table: Mutex<PendingTable>,
    default_timeout: Duration,
}

impl RequestCorrelator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            table: Mutex::new(PendingTable::default()),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `stanza` until it is resolved.
    ///
    /// A non-empty `id` attribute is reused; otherwise one is generated and
    /// written onto the returned stanza.
    pub fn register(
        &self,
        stanza: Element,
        timeout: Option<Duration>,
        continuation: Continuation,
    ) -> Result<(String, Element), ConfigurationError> {
        self.insert(stanza, timeout, |_| continuation)
    }

    /// Typed variant of [`register`](Self::register) returning a future handle.
    pub fn submit<T: Send + 'static>(
        &self,
        request: Request<T>,
    ) -> Result<(Element, ResponseHandle<T>), ConfigurationError> {
        let Request {
            stanza,
            timeout,
            transform,
        } = request;
        let (sender, receiver) = oneshot::channel();

        let (id, stanza) = self.insert(stanza, timeout, move |id| {
            let id = id.to_string();
            Box::new(move |outcome: Result<Element, RequestError>| {
                let result = outcome.and_then(|response| {
                    catch_unwind(AssertUnwindSafe(|| transform(response)))
                        .unwrap_or_else(|_| Err(Box::new(TransformPanicked) as BoxError))
                        .map_err(|source| {
                            warn!(id = %id, error = %source, "malformed response");
                            RequestError::MalformedResponse { id, source }
                        })
                });
                if sender.send(result).is_err() {
                    debug!("response handle dropped before completion");
                }
            })
        })?;

        Ok((stanza, ResponseHandle { id, receiver }))
    }

    fn insert(
        &self,
        mut stanza: Element,
        timeout: Option<Duration>,
        continuation: impl FnOnce(&str) -> Continuation,
    ) -> Result<(String, Element), ConfigurationError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;

        let mut table = self.lock();
        let id = match stanza.id() {
            Some(id) if table.entries.contains_key(id) => {
                return Err(ConfigurationError::DuplicateCorrelationId(id.to_string()));
            }
            Some(id) => id.to_string(),
            None => {
                let id = table.generate_id();
                stanza.set_attr("id", id.clone());
                id
            }
        };

        table.entries.insert(
            id.clone(),
            PendingRequest {
                stanza: stanza.clone(),
                deadline,
                continuation: continuation(&id),
            },
        );
        let pending = table.entries.len();
        drop(table);

        debug!(
            id = %id,
            to = stanza.to_attr().unwrap_or_default(),
            timeout_ms = timeout.as_millis() as u64,
            pending,
            state = %RequestState::Sent,
            "request registered"
        );
        Ok((id, stanza))
    }

    /// Complete the request `id` with `outcome`.
    ///
    /// Returns `false`, doing nothing else, when no such request is pending.
    pub fn resolve(&self, id: &str, outcome: Result<Element, RequestError>) -> bool {
        let removed = self.lock().entries.remove(id);
        let Some(pending) = removed else {
            debug!(id, "no pending request, ignoring resolution");
            return false;
        };
        Self::complete(id, pending, outcome);
        true
    }

    /// Classify an inbound stanza as a response and complete its request.
    ///
    /// Only `iq` stanzas of type `result` or `error` whose id is pending are
    /// consumed; everything else returns `false` untouched.
    pub fn resolve_response(&self, stanza: &Element) -> bool {
        let Some(iq_type @ (IqType::Result | IqType::Error)) = stanza.iq_type() else {
            return false;
        };
        let Some(id) = stanza.id() else {
            return false;
        };
        let removed = self.lock().entries.remove(id);
        let Some(pending) = removed else {
            debug!(id, from = stanza.from_attr().unwrap_or_default(), "stale or unknown response");
            return false;
        };

        let outcome = if iq_type == IqType::Error {
            let error = ProtocolError::from_stanza(stanza)
                .unwrap_or_else(|| ProtocolError::new(DefinedCondition::UndefinedCondition, None));
            Err(RequestError::Remote {
                id: id.to_string(),
                error,
            })
        } else {
            Ok(stanza.clone())
        };
        Self::complete(id, pending, outcome);
        true
    }

    /// Time out every request whose deadline has passed.
    pub fn timeout_sweep(&self) -> usize {
        self.timeout_sweep_at(Instant::now())
    }

    pub fn timeout_sweep_at(&self, now: Instant) -> usize {
        let mut expired: Vec<(String, PendingRequest)> = {
            let mut table = self.lock();
            let (expired, live): (HashMap<_, _>, HashMap<_, _>) =
                std::mem::take(&mut table.entries)
                    .into_iter()
                    .partition(|(_, pending)| pending.deadline <= now);
            table.entries = live;
            expired.into_iter().collect()
        };
        expired.sort_by_key(|(_, pending)| pending.deadline);

        let count = expired.len();
        for (id, pending) in expired {
            let outcome = Err(RequestError::Timeout { id: id.clone() });
            Self::complete(&id, pending, outcome);
        }
        count
    }

    /// Cancel every pending request, e.g. because the stream went away.
    ///
    /// All continuations have run by the time this returns, even if one of
    /// them panics.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let mut drained: Vec<(String, PendingRequest)> = self.lock().entries.drain().collect();
        drained.sort_by_key(|(_, pending)| pending.deadline);

        let count = drained.len();
        if count > 0 {
            info!(count, reason, "cancelling pending requests");
        }
        for (id, pending) in drained {
            let outcome = Err(RequestError::Cancelled {
                id: id.clone(),
                reason: reason.to_string(),
            });
            Self::complete(&id, pending, outcome);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    /// Run [`timeout_sweep`](Self::timeout_sweep) every `interval` until the
    /// correlator is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let correlator = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(correlator) = correlator.upgrade() else {
                    debug!("correlator dropped, stopping timeout sweeper");
                    break;
                };
                correlator.timeout_sweep();
            }
        })
    }

    fn complete(id: &str, pending: PendingRequest, outcome: Result<Element, RequestError>) {
        let state = RequestState::of(&outcome);
        match &outcome {
            Ok(_) => debug!(id, state = %state, "request resolved"),
            Err(error) => warn!(
                id,
                state = %state,
                request = pending.stanza.name(),
                error = %error,
                "request failed"
            ),
        }
        let continuation = pending.continuation;
        if catch_unwind(AssertUnwindSafe(move || continuation(outcome))).is_err() {
            error!(id, state = %state, "request continuation panicked");
        }
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}
