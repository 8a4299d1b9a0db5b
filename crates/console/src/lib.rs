//! Headless console session: tracks background jobs and follows the
//! push channel, logging the reconciled view.

pub mod config;
pub mod session;

pub use config::{ConfigError, ConsoleConfig};
