//! Shared types, error taxonomy, configuration, and tracing setup used
//! by every `relay-*` crate.

pub mod config;
pub mod error;
pub mod tracing_setup;
pub mod types;

pub use config::ServerConfig;
pub use error::{RelayError, Result};
pub use tracing_setup::init_tracing_with_level;
pub use types::*;
