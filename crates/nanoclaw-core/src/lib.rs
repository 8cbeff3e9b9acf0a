//! Nanoclaw Core - Types, messages, configuration, and error handling

pub mod config;
pub mod error;
pub mod message;
pub mod protocol;
pub mod types;

pub use config::NanoclawConfig;
pub use error::{Error, Result};
pub use message::*;
pub use types::*;
