use std::str::FromStr;

use xmpp_parsers::minidom::Element;
use xmpp_parsers::ns;

use crate::error::{ParseError, TransportError};

/// Top-level elements accepted as stanzas.
pub const STANZA_NAMES: [&str; 3] = ["message", "presence", "iq"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }
}

impl FromStr for IqType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(IqType::Get),
            "set" => Ok(IqType::Set),
            "result" => Ok(IqType::Result),
            "error" => Ok(IqType::Error),
            other => Err(ParseError::Xml(format!("invalid iq type '{other}'"))),
        }
    }
}

/// Read-only accessors shared by every stanza kind.
pub trait StanzaExt {
    fn id(&self) -> Option<&str>;
    fn stanza_type(&self) -> Option<&str>;
    fn from_attr(&self) -> Option<&str>;
    fn to_attr(&self) -> Option<&str>;
    fn iq_type(&self) -> Option<IqType>;

    /// An `iq` of type `get` or `set`, which must always be answered.
    fn is_request(&self) -> bool {
        matches!(self.iq_type(), Some(IqType::Get | IqType::Set))
    }

    /// An `iq` of type `result` or `error`.
    fn is_response(&self) -> bool {
        matches!(self.iq_type(), Some(IqType::Result | IqType::Error))
    }

    /// Stanzas of type `error` must never be answered with another error.
    fn is_error(&self) -> bool {
        self.stanza_type() == Some("error")
    }
}

impl StanzaExt for Element {
    fn id(&self) -> Option<&str> {
        self.attr("id").filter(|id| !id.is_empty())
    }

    fn stanza_type(&self) -> Option<&str> {
        self.attr("type")
    }

    fn from_attr(&self) -> Option<&str> {
        self.attr("from")
    }

    fn to_attr(&self) -> Option<&str> {
        self.attr("to")
    }

    fn iq_type(&self) -> Option<IqType> {
        if self.name() != "iq" {
            return None;
        }
        self.stanza_type().and_then(|t| t.parse().ok())
    }
}

pub fn parse_stanza(raw: &[u8]) -> Result<Element, ParseError> {
    let xml =
        std::str::from_utf8(raw).map_err(|error| ParseError::InvalidUtf8(error.to_string()))?;
    let trimmed = xml.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    let element =
        Element::from_str(trimmed).map_err(|error| ParseError::Xml(error.to_string()))?;
    if !STANZA_NAMES.contains(&element.name()) {
        return Err(ParseError::UnsupportedRoot(element.name().to_string()));
    }
    Ok(element)
}

pub fn serialize_stanza(stanza: &Element) -> Result<Vec<u8>, TransportError> {
    let mut payload = Vec::new();
    stanza.write_to(&mut payload).map_err(|error| {
        TransportError::Encode(format!(
            "failed to serialize <{}/> stanza: {error}",
            stanza.name()
        ))
    })?;
    Ok(payload)
}

/// Lossy rendering for logs and tool output.
pub fn to_xml_string(stanza: &Element) -> String {
    serialize_stanza(stanza)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_else(|_| format!("<{}/>", stanza.name()))
}

/// Build an `<iq/>` carrying `payload`. The id is left for the correlator.
pub fn build_iq(iq_type: IqType, to: Option<&str>, payload: Option<Element>) -> Element {
    let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", iq_type.as_str())
        .attr("to", to.map(str::to_string));
    if let Some(payload) = payload {
        builder = builder.append(payload);
    }
    builder.build()
}

/// Start a reply to `original`: same name, same id, `to`/`from` swapped.
pub fn reply_to(original: &Element, reply_type: &str) -> Element {
    Element::builder(original.name(), ns::JABBER_CLIENT)
        .attr("type", reply_type)
        .attr("id", original.id().map(str::to_string))
        .attr("to", original.from_attr().map(str::to_string))
        .attr("from", original.to_attr().map(str::to_string))
        .build()
}

/// Empty `type='result'` answer to an iq request.
pub fn iq_result_for(request: &Element) -> Element {
    reply_to(request, IqType::Result.as_str())
}
