//! Transport configuration: timeouts, pacing and GATT ids
//!
//! Loaded from TOML; any missing key falls back to the BLE preset.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::protocol::{self, timeouts};

/// How the uploader paces chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Device answers every chunk with ACK (BLE)
    PerChunk,
    /// Stream transport with its own flow control (TCP)
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    pub service_uuid: Uuid,
    pub command_uuid: Uuid,
    pub response_uuid: Uuid,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub erase_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub verification_timeout_ms: u64,
    pub write_delay_ms: u64,
    pub chunk_size: usize,
    pub ack_mode: AckMode,
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self::ble()
    }
}

impl OtaConfig {
    pub fn ble() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID,
            command_uuid: protocol::COMMAND_UUID,
            response_uuid: protocol::RESPONSE_UUID,
            connect_timeout_ms: timeouts::CONNECT_MS,
            command_timeout_ms: timeouts::COMMAND_MS,
            erase_timeout_ms: timeouts::ERASE_MS,
            ack_timeout_ms: timeouts::ACK_MS,
            verification_timeout_ms: timeouts::VERIFICATION_MS,
            write_delay_ms: 0,
            chunk_size: protocol::BLE_CHUNK_SIZE,
            ack_mode: AckMode::PerChunk,
            connect_attempts: 5,
            retry_delay_ms: timeouts::RETRY_DELAY_MS,
        }
    }

    pub fn wifi() -> Self {
        Self {
            write_delay_ms: timeouts::WIFI_WRITE_DELAY_MS,
            chunk_size: protocol::WIFI_CHUNK_SIZE,
            ack_mode: AckMode::None,
            connect_attempts: 10,
            ..Self::ble()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_ms)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: OtaConfig =
            toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))?;
        if config.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than zero");
        }
        Ok(config)
    }

    /// Load `meshota.toml` from the user config dir, or fall back to `base`
    pub fn load_default_or(base: Self) -> Result<Self> {
        let path = config_dir().join("meshota.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(base)
        }
    }

    pub fn load_default() -> Result<Self> {
        Self::load_default_or(Self::default())
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Meshota");
        }
    }
    // Unix-like default
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("meshota");
    }
    PathBuf::from(".meshota")
}
