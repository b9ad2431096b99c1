pub mod ping;

pub use ping::{PING_MODULE_TYPE, PingModule};
