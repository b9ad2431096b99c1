pub mod client;
pub mod correlator;
pub mod criteria;
pub mod error;
pub mod module;
pub mod modules;
pub mod registry;
pub mod stanza;
pub mod translator;
pub mod transport;

pub use client::{InboundOutcome, XmppClient};
pub use correlator::{
    Continuation, Request, RequestCorrelator, RequestState, ResponseHandle, TransformPanicked,
};
pub use criteria::Criterion;
pub use error::{
    ConfigurationError, DefinedCondition, ErrorType, ParseError, ProtocolError, RequestError,
    StanzaError, TransportError, condition_name, default_type,
};
pub use module::{ModuleContext, XmppModule};
pub use registry::{DispatchOutcome, ModuleRegistry};
pub use stanza::{IqType, StanzaExt};
pub use translator::ErrorTranslator;
pub use transport::{ChannelSink, StanzaReceiver, StanzaSender, StanzaSink, stanza_channel};

// Re-exported so downstream crates build stanzas against the same version.
pub use xmpp_parsers::minidom::Element;
pub use xmpp_parsers::ns;
