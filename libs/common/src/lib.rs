//! Shared building blocks for the plcsrv services
//!
//! Provides the functions every service binary needs at startup:
//! - logging bootstrap with runtime level reload
//! - layered configuration value resolution
//! - shutdown signal handling

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use config_loader::{resolve, resolve_string, ValueSource};
