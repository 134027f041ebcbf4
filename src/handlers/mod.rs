//! HTTP request handlers that are not health or WebSocket related.

pub mod config;
pub mod recordings;

pub use self::config::*;
pub use recordings::*;
