use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Audit hooks for update runs
pub trait UpdateLogger: Send + Sync {
    fn start(&self, _address: &str, _size: u64, _sha256: &str) {}
    fn phase(&self, _address: &str, _phase: &str) {}
    fn done(&self, _address: &str, _bytes: u64, _seconds: f64) {}
    fn error(&self, _address: &str, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl UpdateLogger for NoopLogger {}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateEvent {
    Start { size: u64, sha256: String },
    Phase { name: String },
    Done { bytes: u64, seconds: f64 },
    Error { context: String, message: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UpdateLogEntry {
    pub timestamp: String,
    pub address: String,
    #[serde(flatten)]
    pub event: UpdateEvent,
}

/// Appends one JSON object per event
pub struct JsonlLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open update log {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record(&self, address: &str, event: UpdateEvent) {
        let entry = UpdateLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            address: address.to_string(),
            event,
        };
        let mut file = self.file.lock();
        if serde_json::to_writer(&mut *file, &entry).is_ok() {
            let _ = file.write_all(b"\n");
            let _ = file.flush();
        }
    }

    pub fn read_log(path: &Path) -> Result<Vec<UpdateLogEntry>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).context("Failed to open update log for reading")?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

impl UpdateLogger for JsonlLogger {
    fn start(&self, address: &str, size: u64, sha256: &str) {
        self.record(
            address,
            UpdateEvent::Start {
                size,
                sha256: sha256.to_string(),
            },
        );
    }
    fn phase(&self, address: &str, phase: &str) {
        self.record(
            address,
            UpdateEvent::Phase {
                name: phase.to_string(),
            },
        );
    }
    fn done(&self, address: &str, bytes: u64, seconds: f64) {
        self.record(address, UpdateEvent::Done { bytes, seconds });
    }
    fn error(&self, address: &str, context: &str, msg: &str) {
        self.record(
            address,
            UpdateEvent::Error {
                context: context.to_string(),
                message: msg.to_string(),
            },
        );
    }
}
