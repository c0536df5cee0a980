//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};
use gattlink_core::Uuid;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List nearby devices
    Scan {
        /// Scan duration in seconds (overrides the configuration)
        #[arg(short, long)]
        seconds: Option<u64>,
        /// Report every device, not only those advertising the service
        #[arg(short, long)]
        all: bool,
    },
    /// Connect to a device, send payloads and print notifications
    Connect {
        /// Device address, e.g. AA:BB:CC:DD:EE:FF
        address: String,
        /// Hex payload to send once the link is ready (repeatable)
        #[arg(short, long)]
        send: Vec<String>,
        /// Characteristic to read once the link is ready (repeatable)
        #[arg(short, long)]
        read: Vec<Uuid>,
        /// Keep listening for notifications this many seconds before disconnecting
        #[arg(short, long, default_value_t = 10)]
        listen_secs: u64,
    },
    /// Print the effective configuration as TOML
    Config,
}
