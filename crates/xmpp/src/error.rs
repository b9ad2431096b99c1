//! Error taxonomy for stanza routing and request correlation.
//!
//! Only [`ConfigurationError`] signals a bug in the calling code. Everything
//! else describes the peer or the connection and is either translated to a
//! wire error ([`ProtocolError`]) or surfaced on a request handle
//! ([`RequestError`]).

use thiserror::Error;
use tracing::debug;
use xmpp_parsers::minidom::Element;
use xmpp_parsers::ns;
pub use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

/// Local API misuse. Never written to the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("module type {0} is already registered")]
    DuplicateModuleType(String),

    #[error("request id {0} is already pending")]
    DuplicateCorrelationId(String),

    #[error("module {module_type} failed to initialize: {reason}")]
    ModuleInitialization { module_type: String, reason: String },
}

/// A failure that maps onto an RFC 6120 stanza error.
///
/// Converts to and from [`StanzaError`], which does the wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolError {
    pub condition: DefinedCondition,
    pub error_type: ErrorType,
    pub text: Option<String>,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", condition_name(&self.condition), self.error_type)?;
        if let Some(text) = &self.text {
            write!(f, ": {text}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ProtocolError {}

impl ProtocolError {
    /// Build an error with the condition's default type.
    pub fn new(condition: DefinedCondition, text: Option<String>) -> Self {
        Self {
            error_type: default_type(&condition),
            condition,
            text,
        }
    }

    pub fn with_type(mut self, error_type: ErrorType) -> Self {
        self.error_type = error_type;
        self
    }

    pub fn bad_request(text: impl Into<String>) -> Self {
        Self::new(DefinedCondition::BadRequest, Some(text.into()))
    }

    pub fn not_acceptable(text: impl Into<String>) -> Self {
        Self::new(DefinedCondition::NotAcceptable, Some(text.into()))
    }

    pub fn feature_not_implemented(text: impl Into<String>) -> Self {
        Self::new(DefinedCondition::FeatureNotImplemented, Some(text.into()))
    }

    pub fn item_not_found(text: impl Into<String>) -> Self {
        Self::new(DefinedCondition::ItemNotFound, Some(text.into()))
    }

    pub fn internal_server_error(text: impl Into<String>) -> Self {
        Self::new(DefinedCondition::InternalServerError, Some(text.into()))
    }

    pub fn service_unavailable() -> Self {
        Self::new(DefinedCondition::ServiceUnavailable, None)
    }

    /// Read the `<error/>` child of an error stanza.
    ///
    /// Peers do not always send well-formed errors. An unknown condition
    /// becomes `undefined-condition` and a missing or unknown `type` falls
    /// back to the condition's default.
    pub fn from_stanza(stanza: &Element) -> Option<Self> {
        let error = stanza.children().find(|child| child.name() == "error")?;
        match StanzaError::try_from(error.clone()) {
            Ok(parsed) => Some(parsed.into()),
            Err(source) => {
                debug!(error = %source, "reading non-conforming stanza error");
                Some(Self::read_loosely(error))
            }
        }
    }

    fn read_loosely(error: &Element) -> Self {
        let stanza_children = || error.children().filter(|c| c.has_ns(ns::XMPP_STANZAS));
        let condition = stanza_children()
            .filter(|child| child.name() != "text")
            .find_map(|child| DefinedCondition::try_from(child.clone()).ok())
            .unwrap_or(DefinedCondition::UndefinedCondition);
        let text = stanza_children()
            .find(|child| child.name() == "text")
            .map(Element::text);
        let error_type = error
            .attr("type")
            .and_then(|value| value.parse().ok())
            .unwrap_or_else(|| default_type(&condition));
        Self {
            condition,
            error_type,
            text,
        }
    }

    /// Render as `<error type='..'><condition/><text/></error>`.
    pub fn to_element(&self) -> Element {
        StanzaError::from(self).into()
    }
}

impl From<StanzaError> for ProtocolError {
    fn from(error: StanzaError) -> Self {
        Self {
            condition: error.defined_condition,
            error_type: error.type_,
            text: error.texts.into_values().find(|text| !text.is_empty()),
        }
    }
}

impl From<&ProtocolError> for StanzaError {
    fn from(error: &ProtocolError) -> Self {
        let mut stanza_error = StanzaError::new(
            error.error_type.clone(),
            error.condition.clone(),
            "en",
            error.text.clone().unwrap_or_default(),
        );
        if error.text.is_none() {
            stanza_error.texts.clear();
        }
        stanza_error
    }
}

/// Element name of a condition, e.g. `item-not-found`.
pub fn condition_name(condition: &DefinedCondition) -> String {
    Element::from(condition.clone()).name().to_string()
}

/// The error type RFC 6120 §8.3.3 recommends for `condition`.
pub fn default_type(condition: &DefinedCondition) -> ErrorType {
    use DefinedCondition::*;
    match condition {
        BadRequest | JidMalformed | NotAcceptable | PolicyViolation | Redirect => ErrorType::Modify,
        Forbidden | NotAuthorized | RegistrationRequired | SubscriptionRequired => ErrorType::Auth,
        RecipientUnavailable | RemoteServerTimeout | ResourceConstraint | UnexpectedRequest => {
            ErrorType::Wait
        }
        Conflict
        | FeatureNotImplemented
        | Gone
        | InternalServerError
        | ItemNotFound
        | NotAllowed
        | RemoteServerNotFound
        | ServiceUnavailable
        | UndefinedCondition => ErrorType::Cancel,
    }
}

/// Terminal failure of an outbound request, delivered on its response handle.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request {id} timed out")]
    Timeout { id: String },

    #[error("request {id} cancelled: {reason}")]
    Cancelled { id: String, reason: String },

    #[error("malformed response to request {id}: {source}")]
    MalformedResponse {
        id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("request {id} failed remotely: {error}")]
    Remote { id: String, error: ProtocolError },

    #[error("request {id} could not be sent: {source}")]
    Transport {
        id: String,
        #[source]
        source: TransportError,
    },
}

impl RequestError {
    /// Correlation id of the request that failed.
    pub fn id(&self) -> &str {
        match self {
            Self::Timeout { id }
            | Self::Cancelled { id, .. }
            | Self::MalformedResponse { id, .. }
            | Self::Remote { id, .. }
            | Self::Transport { id, .. } => id,
        }
    }
}

/// Inbound bytes that could not be turned into a stanza.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("stanza payload is empty")]
    Empty,

    #[error("invalid UTF-8 stanza bytes: {0}")]
    InvalidUtf8(String),

    #[error("failed to parse stanza XML: {0}")]
    Xml(String),

    #[error("unsupported stanza element <{0}/>")]
    UnsupportedRoot(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport send queue is full")]
    Backpressure,

    #[error("stanza could not be written: {0}")]
    Encode(String),
}
