pub mod config;
pub mod error;
pub mod event;
pub mod logging;

pub use error::{AukletError, EventBusError, HandlerError, Result};
