//! Logging initialisation for Hive processes
//!
//! Coordinator and agent binaries call one of the `init_*` functions once at
//! startup; library crates only emit `tracing` events.

pub mod init;

pub use hive_config::{LogFormat, LogLevel, LoggingConfig};
pub use init::{build_env_filter, init_logging_from_config, init_simple_tracing};
