//! WiFi OTA over TCP.
//!
//! The device listens on port 3232 while in WiFi OTA mode. One TCP connection
//! carries both directions, so the socket is presented as a peripheral with a
//! single OTA service: writes to the command characteristic go to the socket,
//! every received line arrives as a notification on the response
//! characteristic. TCP provides its own flow control and the device sends no
//! per-chunk ACK; pair this link with `OtaConfig::wifi()`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::LinkError;
use crate::link::{
    CharacteristicProperties, ConnectOptions, ConnectionState, GattCharacteristic, GattService,
    Peripheral, Radio, WriteMode,
};
use crate::protocol::{self, timeouts, COMMAND_UUID, RESPONSE_UUID, SERVICE_UUID};

/// Resolves `host` or `host:port` to a TCP peripheral
#[derive(Debug, Clone)]
pub struct TcpRadio {
    port: u16,
    connect_timeout: Duration,
    mtu: usize,
}

impl Default for TcpRadio {
    fn default() -> Self {
        Self::new(protocol::DEFAULT_PORT)
    }
}

impl TcpRadio {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            connect_timeout: Duration::from_millis(timeouts::CONNECT_MS),
            mtu: protocol::WIFI_CHUNK_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(1);
        self
    }
}

impl Radio for TcpRadio {
    type Peripheral = TcpPeripheral;

    async fn find(&self, address: &str) -> Result<TcpPeripheral, LinkError> {
        let target = resolve(address, self.port).await?;
        log::debug!("WiFi OTA: {} resolved to {}", address, target);
        Ok(TcpPeripheral {
            address: address.to_string(),
            target,
            connect_timeout: self.connect_timeout,
            mtu: self.mtu,
            state: Arc::new(watch::channel(ConnectionState::Disconnected).0),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            reader_task: Mutex::new(None),
        })
    }
}

async fn resolve(address: &str, default_port: u16) -> Result<SocketAddr, LinkError> {
    if let Ok(ip) = address.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let query = if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:{}", address, default_port)
    };
    tokio::net::lookup_host(query)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| LinkError::NotFound(address.to_string()))
}

pub struct TcpPeripheral {
    address: String,
    target: SocketAddr,
    connect_timeout: Duration,
    mtu: usize,
    state: Arc<watch::Sender<ConnectionState>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<OwnedReadHalf>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpPeripheral {
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    fn ota_service() -> GattService {
        GattService {
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
        }
    }

    fn stop_reader(&self) {
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }
}

impl Peripheral for TcpPeripheral {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self, _options: ConnectOptions) -> Result<(), LinkError> {
        self.state.send_replace(ConnectionState::Connecting);
        log::info!("WiFi OTA: connecting to {}", self.target);

        let stream = match timeout(self.connect_timeout, TcpStream::connect(self.target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(LinkError::ConnectFailed(format!("{}: {}", self.target, e)));
            }
            Err(_) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(LinkError::ConnectTimeout);
            }
        };
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock() = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        self.state.send_replace(ConnectionState::Connected);
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, LinkError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(LinkError::NotConnected);
        }
        Ok(vec![Self::ota_service()])
    }

    async fn write(&self, characteristic: Uuid, data: &[u8], _mode: WriteMode) -> Result<(), LinkError> {
        if characteristic != COMMAND_UUID {
            return Err(LinkError::CharacteristicMissing(characteristic));
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(LinkError::NotConnected)?;
        let written = async {
            writer.write_all(data).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(LinkError::WriteFailed(e.to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, LinkError> {
        if characteristic != RESPONSE_UUID {
            return Err(LinkError::CharacteristicMissing(characteristic));
        }
        let read_half = self
            .reader
            .lock()
            .take()
            .ok_or(LinkError::SubscribeFailed(characteristic))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let state = self.state.clone();
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => {
                        log::info!("WiFi OTA: connection closed by device");
                        break;
                    }
                    Ok(_) => {
                        if tx.send(line.clone()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("WiFi OTA: read failed: {}", e);
                        break;
                    }
                }
            }
            state.send_replace(ConnectionState::Disconnected);
        });
        *self.reader_task.lock() = Some(task);
        Ok(rx)
    }

    async fn unsubscribe(&self, _characteristic: Uuid) {
        self.stop_reader();
    }

    async fn disconnect(&self) {
        self.stop_reader();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().take();
        self.state.send_replace(ConnectionState::Disconnected);
    }
}
