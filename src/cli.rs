//! Command-line definitions for the `meshota` binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::protocol::{timeouts, DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Meshota - over-the-air firmware updates for ESP32 mesh radios"
)]
pub struct Args {
    /// Show protocol traffic (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Upload a firmware image over WiFi/TCP
    Update(UpdateOpts),
    /// Print the device's hardware/firmware versions
    Version(TargetOpts),
    /// Find devices waiting in WiFi OTA mode
    Discover {
        /// How long to wait for replies (ms)
        #[arg(long, default_value_t = timeouts::DISCOVERY_MS)]
        timeout_ms: u64,
    },
}

/// Device address options
#[derive(Clone, Debug, Parser)]
pub struct TargetOpts {
    /// Device host or IP (optionally host:port)
    pub host: String,

    /// TCP port of the OTA listener
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// TOML config overriding timeouts and pacing
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Debug, Parser)]
pub struct UpdateOpts {
    #[command(flatten)]
    pub target: TargetOpts,

    /// Firmware image (.bin)
    #[arg(short, long)]
    pub firmware: PathBuf,

    /// Expected SHA-256 (hex); computed from the image when omitted
    #[arg(long)]
    pub hash: Option<String>,

    /// Bytes per write
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Do not send REBOOT after a verified upload
    #[arg(long)]
    pub no_reboot: bool,

    /// Append JSONL update events to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}
