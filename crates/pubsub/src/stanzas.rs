//! PubSub result types and parsing of service responses.

use std::fmt;
use std::str::FromStr;

use auklet_xmpp::Element;
use thiserror::Error;
use xmpp_parsers::jid::Jid;

/// Main PubSub namespace (XEP-0060).
pub const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";

/// PubSub event namespace for notifications.
pub const NS_PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";

/// PubSub owner namespace for node management.
pub const NS_PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";

/// A service response that does not have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PubSubError {
    #[error("response has no <{0}/> element")]
    MissingElement(&'static str),

    #[error("<{element}/> has no '{attribute}' attribute")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    #[error("unknown subscription state '{0}'")]
    UnknownSubscriptionState(String),

    #[error("unknown affiliation '{0}'")]
    UnknownAffiliation(String),

    #[error("invalid JID '{value}': {reason}")]
    InvalidJid { value: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// No notifications are delivered.
    None,
    /// Awaiting approval by a node owner.
    Pending,
    /// Subscribed, options not configured yet.
    Unconfigured,
    Subscribed,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::None => "none",
            SubscriptionState::Pending => "pending",
            SubscriptionState::Unconfigured => "unconfigured",
            SubscriptionState::Subscribed => "subscribed",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionState {
    type Err = PubSubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SubscriptionState::None),
            "pending" => Ok(SubscriptionState::Pending),
            "unconfigured" => Ok(SubscriptionState::Unconfigured),
            "subscribed" => Ok(SubscriptionState::Subscribed),
            other => Err(PubSubError::UnknownSubscriptionState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affiliation {
    Owner,
    Publisher,
    PublishOnly,
    Member,
    None,
    Outcast,
}

impl Affiliation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Affiliation::Owner => "owner",
            Affiliation::Publisher => "publisher",
            Affiliation::PublishOnly => "publish-only",
            Affiliation::Member => "member",
            Affiliation::None => "none",
            Affiliation::Outcast => "outcast",
        }
    }
}

impl fmt::Display for Affiliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Affiliation {
    type Err = PubSubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Affiliation::Owner),
            "publisher" => Ok(Affiliation::Publisher),
            "publish-only" => Ok(Affiliation::PublishOnly),
            "member" => Ok(Affiliation::Member),
            "none" => Ok(Affiliation::None),
            "outcast" => Ok(Affiliation::Outcast),
            other => Err(PubSubError::UnknownAffiliation(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub node: String,
    pub jid: Jid,
    pub state: SubscriptionState,
    pub subid: Option<String>,
}

/// An item returned by a retrieve request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedItem {
    pub id: String,
    pub content: Option<Element>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrieveResponse {
    pub service: Jid,
    pub node: String,
    pub items: Vec<RetrievedItem>,
}

/// Where a published item ended up. The id may differ from the requested one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishingInfo {
    pub service: Option<Jid>,
    pub node: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedAffiliation {
    pub node: String,
    pub affiliation: Affiliation,
}

pub(crate) fn parse_jid(value: &str) -> Result<Jid, PubSubError> {
    Jid::from_str(value).map_err(|error| PubSubError::InvalidJid {
        value: value.to_string(),
        reason: error.to_string(),
    })
}

fn required_attr<'a>(
    element: &'a Element,
    name: &'static str,
    attribute: &'static str,
) -> Result<&'a str, PubSubError> {
    element
        .attr(attribute)
        .ok_or(PubSubError::MissingAttribute {
            element: name,
            attribute,
        })
}

fn required_child<'a>(
    parent: &'a Element,
    name: &'static str,
    ns: &str,
) -> Result<&'a Element, PubSubError> {
    parent
        .get_child(name, ns)
        .ok_or(PubSubError::MissingElement(name))
}

/// Parse a `<subscription/>`, falling back to `node` from the enclosing
/// `<subscriptions/>` when the element carries none.
pub fn parse_subscription(
    element: &Element,
    node: Option<&str>,
) -> Result<Subscription, PubSubError> {
    let jid = parse_jid(required_attr(element, "subscription", "jid")?)?;
    let state = required_attr(element, "subscription", "subscription")?.parse()?;
    let node = element
        .attr("node")
        .or(node)
        .ok_or(PubSubError::MissingAttribute {
            element: "subscription",
            attribute: "node",
        })?;

    Ok(Subscription {
        node: node.to_string(),
        jid,
        state,
        subid: element.attr("subid").map(str::to_string),
    })
}

pub fn parse_subscribe_response(response: &Element) -> Result<Subscription, PubSubError> {
    let pubsub = required_child(response, "pubsub", NS_PUBSUB)?;
    parse_subscription(required_child(pubsub, "subscription", NS_PUBSUB)?, None)
}

/// `ns` is [`NS_PUBSUB`] for our own subscriptions, [`NS_PUBSUB_OWNER`] for
/// the owner's view of a node.
pub fn parse_subscriptions_response(
    response: &Element,
    ns: &str,
) -> Result<Vec<Subscription>, PubSubError> {
    let pubsub = required_child(response, "pubsub", ns)?;
    let subscriptions = required_child(pubsub, "subscriptions", ns)?;
    let node = subscriptions.attr("node");
    subscriptions
        .children()
        .filter(|child| child.name() == "subscription")
        .map(|child| parse_subscription(child, node))
        .collect()
}

pub fn parse_retrieve_response(response: &Element) -> Result<RetrieveResponse, PubSubError> {
    let service = parse_jid(required_attr(response, "iq", "from")?)?;
    let pubsub = required_child(response, "pubsub", NS_PUBSUB)?;
    let items = required_child(pubsub, "items", NS_PUBSUB)?;
    let node = required_attr(items, "items", "node")?.to_string();

    let items = items
        .children()
        .filter(|child| child.name() == "item")
        .map(|item| {
            Ok(RetrievedItem {
                id: required_attr(item, "item", "id")?.to_string(),
                content: item.children().next().cloned(),
            })
        })
        .collect::<Result<_, PubSubError>>()?;

    Ok(RetrieveResponse {
        service,
        node,
        items,
    })
}

pub fn parse_publish_response(response: &Element) -> Result<PublishingInfo, PubSubError> {
    let service = response.attr("from").map(parse_jid).transpose()?;
    let pubsub = required_child(response, "pubsub", NS_PUBSUB)?;
    let publish = required_child(pubsub, "publish", NS_PUBSUB)?;
    let item = required_child(publish, "item", NS_PUBSUB)?;

    Ok(PublishingInfo {
        service,
        node: required_attr(publish, "publish", "node")?.to_string(),
        id: required_attr(item, "item", "id")?.to_string(),
    })
}

/// An answer without an `<affiliations/>` element means no affiliations.
pub fn parse_affiliations_response(
    response: &Element,
) -> Result<Vec<RetrievedAffiliation>, PubSubError> {
    let Some(affiliations) = response
        .get_child("pubsub", NS_PUBSUB)
        .and_then(|pubsub| pubsub.get_child("affiliations", NS_PUBSUB))
    else {
        return Ok(Vec::new());
    };

    affiliations
        .children()
        .filter(|child| child.name() == "affiliation")
        .map(|child| {
            Ok(RetrievedAffiliation {
                node: required_attr(child, "affiliation", "node")?.to_string(),
                affiliation: required_attr(child, "affiliation", "affiliation")?.parse()?,
            })
        })
        .collect()
}
