//! XEP-0060 Publish-Subscribe for Auklet.
//!
//! [`PubSubModule`] turns `<event/>` notifications into bus events on the
//! `xmpp.pubsub.*` channels and builds typed requests for the subscriber,
//! publisher and owner use cases.

pub mod module;
pub mod stanzas;

pub use module::{DELETED_CHANNEL, EVENT_CHANNEL, PUBSUB_MODULE_TYPE, PURGED_CHANNEL, PubSubModule};
pub use stanzas::{
    Affiliation, NS_PUBSUB, NS_PUBSUB_EVENT, NS_PUBSUB_OWNER, PubSubError, PublishingInfo,
    RetrieveResponse, RetrievedAffiliation, RetrievedItem, Subscription, SubscriptionState,
};
pub use xmpp_parsers::jid::Jid;
