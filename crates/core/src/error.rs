use thiserror::Error;

use crate::config::ConfigError;

/// Top-level failure of engine setup.
#[derive(Error, Debug)]
pub enum AukletError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("event bus: {0}")]
    EventBus(#[from] EventBusError),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, AukletError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    #[error("{0:?} is not a valid channel name")]
    InvalidChannel(String),

    #[error("{0:?} is not a valid subscription pattern")]
    InvalidPattern(String),

    #[error("subscription channel closed")]
    ChannelClosed,
}

/// Failure reported by an event handler. Never propagated to the publisher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    /// The consumer behind this handler is gone; the bus drops the subscription.
    #[error("handler closed")]
    Closed,
}
