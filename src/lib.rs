//! Meshota library
//!
//! Over-the-air firmware update transport for ESP32 mesh radios. A link
//! session turns a device address into an ordered command/response channel;
//! the controller drives handshake, chunked upload and verification on top.

pub mod cli;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod firmware;
pub mod link;
pub mod logger;
pub mod net;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod session;
pub mod updater;
pub mod uploader;

pub use config::{AckMode, OtaConfig};
pub use controller::{HandshakeProgress, OtaController, TransferState};
pub use error::{LinkError, OtaError};
pub use firmware::FirmwarePayload;
pub use protocol_core::{Command, DeviceInfo, Response};
pub use session::{CancelHandle, LinkSession, WaitError};
pub use updater::{UpdateState, Updater};
