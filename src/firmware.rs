//! Firmware image bytes plus the content hash the device checks them against

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct FirmwarePayload {
    data: Vec<u8>,
    sha256: String,
}

impl FirmwarePayload {
    /// Hash is computed from the image
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let sha256 = sha256_hex(&data);
        Self { data, sha256 }
    }

    /// Hash supplied by the firmware repository
    pub fn with_hash(data: Vec<u8>, sha256: impl Into<String>) -> Self {
        Self {
            data,
            sha256: sha256.into(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("read firmware image {}", path.display()))?;
        if data.is_empty() {
            anyhow::bail!("firmware image {} is empty", path.display());
        }
        Ok(Self::from_bytes(data))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Lowercase hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest.iter() {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
