//! Scripted in-memory device used by the integration tests.
//!
//! The device understands the OTA command set, counts streamed bytes and
//! answers each write from a script. Tests keep a `MockDevice` handle to
//! inspect what was written and to cut the link.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use meshota::error::LinkError;
use meshota::link::{
    CharacteristicProperties, ConnectOptions, ConnectionState, GattCharacteristic, GattService,
    Peripheral, Radio, WriteMode,
};
use meshota::protocol::{COMMAND_UUID, RESPONSE_UUID, SERVICE_UUID};

pub const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

#[derive(Debug, Clone)]
pub struct DeviceScript {
    /// Lines sent after the start command
    pub handshake: Vec<String>,
    /// Sent after every data chunk
    pub chunk_reply: Option<String>,
    /// Sent once every announced byte has arrived
    pub final_reply: Option<String>,
    pub version_reply: Option<String>,
    pub reboot_reply: Option<String>,
    /// Gap before each reply line; zero answers inside the write call
    pub reply_delay: Duration,
    /// Cut the link right after this many data chunks
    pub drop_after_chunks: Option<usize>,
    /// Cut the link once the last chunk is acknowledged, before any verdict
    pub drop_before_verdict: bool,
    pub expose_service: bool,
    pub mtu: usize,
}

impl Default for DeviceScript {
    fn default() -> Self {
        Self {
            handshake: lines(&["ERASING", "OK"]),
            chunk_reply: Some("ACK".into()),
            final_reply: Some("OK".into()),
            version_reply: Some("OK heltec-v3 2.7.15 42 a1b2c3d".into()),
            reboot_reply: Some("OK".into()),
            reply_delay: Duration::from_millis(5),
            drop_after_chunks: None,
            drop_before_verdict: false,
            expose_service: true,
            mtu: 512,
        }
    }
}

pub fn lines(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub data: Vec<u8>,
    pub mode: WriteMode,
}

#[derive(Default)]
struct Progress {
    expected: Option<u64>,
    received: u64,
    chunks: usize,
}

struct Inner {
    script: DeviceScript,
    state: watch::Sender<ConnectionState>,
    notify: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    commands: Mutex<Vec<String>>,
    data: Mutex<Vec<RecordedWrite>>,
    progress: Mutex<Progress>,
}

#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<Inner>,
}

impl MockDevice {
    pub fn new(script: DeviceScript) -> Self {
        Self {
            inner: Arc::new(Inner {
                script,
                state: watch::channel(ConnectionState::Disconnected).0,
                notify: Mutex::new(None),
                commands: Mutex::new(Vec::new()),
                data: Mutex::new(Vec::new()),
                progress: Mutex::new(Progress::default()),
            }),
        }
    }

    pub fn radio(&self) -> MockRadio {
        MockRadio {
            device: self.clone(),
        }
    }

    /// Command lines received, without the trailing newline
    pub fn commands(&self) -> Vec<String> {
        self.inner.commands.lock().clone()
    }

    pub fn data_writes(&self) -> Vec<RecordedWrite> {
        self.inner.data.lock().clone()
    }

    pub fn received_bytes(&self) -> Vec<u8> {
        self.inner
            .data
            .lock()
            .iter()
            .flat_map(|w| w.data.iter().copied())
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == ConnectionState::Connected
    }

    /// Push a raw notification payload
    pub fn notify(&self, payload: &str) {
        if let Some(tx) = self.inner.notify.lock().as_ref() {
            let _ = tx.send(payload.as_bytes().to_vec());
        }
    }

    /// Simulate the radio link going away
    pub fn disconnect(&self) {
        self.inner.notify.lock().take();
        self.inner.state.send_replace(ConnectionState::Disconnected);
    }

    fn reply(&self, replies: Vec<String>, then_drop: bool) {
        let delay = self.inner.script.reply_delay;
        if delay.is_zero() {
            for line in &replies {
                self.notify(&format!("{}\n", line));
            }
            if then_drop {
                self.disconnect();
            }
            return;
        }
        let device = self.clone();
        tokio::spawn(async move {
            for line in replies {
                tokio::time::sleep(delay).await;
                device.notify(&format!("{}\n", line));
            }
            if then_drop {
                tokio::time::sleep(delay).await;
                device.disconnect();
            }
        });
    }

    fn handle_command(&self, line: &str) {
        self.inner.commands.lock().push(line.to_string());
        let script = &self.inner.script;
        if line == "VERSION" {
            self.reply(script.version_reply.iter().cloned().collect(), false);
        } else if let Some(args) = line.strip_prefix("OTA ") {
            let size = args
                .split_whitespace()
                .next()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            if script.handshake.iter().any(|l| l.starts_with("OK")) {
                *self.inner.progress.lock() = Progress {
                    expected: Some(size),
                    ..Default::default()
                };
            }
            self.reply(script.handshake.clone(), false);
        } else if line == "REBOOT" {
            self.reply(script.reboot_reply.iter().cloned().collect(), false);
        } else {
            self.reply(vec![format!("ERR Unknown command: {}", line)], false);
        }
    }

    fn handle_data(&self, data: &[u8], mode: WriteMode) {
        self.inner.data.lock().push(RecordedWrite {
            data: data.to_vec(),
            mode,
        });
        let script = &self.inner.script;
        let (chunks, finished) = {
            let mut progress = self.inner.progress.lock();
            progress.received += data.len() as u64;
            progress.chunks += 1;
            let finished = progress.expected.is_some_and(|n| progress.received >= n);
            if finished {
                progress.expected = None;
            }
            (progress.chunks, finished)
        };

        if script.drop_after_chunks == Some(chunks) {
            self.disconnect();
            return;
        }

        let mut replies: Vec<String> = script.chunk_reply.iter().cloned().collect();
        let mut then_drop = false;
        if finished {
            if script.drop_before_verdict {
                then_drop = true;
            } else {
                replies.extend(script.final_reply.iter().cloned());
            }
        }
        self.reply(replies, then_drop);
    }
}

pub struct MockRadio {
    device: MockDevice,
}

impl Radio for MockRadio {
    type Peripheral = MockPeripheral;

    async fn find(&self, address: &str) -> Result<MockPeripheral, LinkError> {
        if address != ADDRESS {
            return Err(LinkError::NotFound(address.to_string()));
        }
        Ok(MockPeripheral {
            device: self.device.clone(),
        })
    }
}

pub struct MockPeripheral {
    device: MockDevice,
}

impl Peripheral for MockPeripheral {
    fn address(&self) -> &str {
        ADDRESS
    }

    async fn connect(&self, _options: ConnectOptions) -> Result<(), LinkError> {
        self.device
            .inner
            .state
            .send_replace(ConnectionState::Connected);
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.device.inner.state.subscribe()
    }

    fn mtu(&self) -> usize {
        self.device.inner.script.mtu
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, LinkError> {
        let battery = GattService {
            uuid: Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb),
            characteristics: Vec::new(),
        };
        if !self.device.inner.script.expose_service {
            return Ok(vec![battery]);
        }
        let ota = GattService {
            uuid: SERVICE_UUID,
            characteristics: vec![
                GattCharacteristic {
                    uuid: COMMAND_UUID,
                    properties: CharacteristicProperties {
                        write: true,
                        write_without_response: true,
                        notify: false,
                    },
                },
                GattCharacteristic {
                    uuid: RESPONSE_UUID,
                    properties: CharacteristicProperties {
                        notify: true,
                        ..Default::default()
                    },
                },
            ],
        };
        Ok(vec![battery, ota])
    }

    async fn write(&self, characteristic: Uuid, data: &[u8], mode: WriteMode) -> Result<(), LinkError> {
        if !self.device.is_connected() {
            return Err(LinkError::NotConnected);
        }
        if characteristic != COMMAND_UUID {
            return Err(LinkError::CharacteristicMissing(characteristic));
        }
        let streaming = self.device.inner.progress.lock().expected.is_some();
        if streaming {
            self.device.handle_data(data, mode);
        } else {
            let text = String::from_utf8_lossy(data);
            self.device.handle_command(text.trim_end());
        }
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, LinkError> {
        if characteristic != RESPONSE_UUID {
            return Err(LinkError::SubscribeFailed(characteristic));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.device.inner.notify.lock() = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, _characteristic: Uuid) {
        self.device.inner.notify.lock().take();
    }

    async fn disconnect(&self) {
        self.device.disconnect();
    }
}
