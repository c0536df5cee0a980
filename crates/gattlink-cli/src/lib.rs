//! gattlink CLI library
//!
//! Command-line front end for the gattlink engine: scanning, connecting,
//! sending hex payloads and printing notifications.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::{parse_hex_payload, AppConfig, ScanConfig};
pub use error::{CliError, Result};
