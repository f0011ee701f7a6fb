//! Link session: one connected peripheral exposed as an ordered response
//! inbox plus a command channel.
//!
//! Every decoded line is queued in arrival order and stays queued until a
//! waiter takes it, so a reply that lands before anyone waits is not lost and
//! one reply never satisfies two waits. A `watch` view of the latest line
//! backs `responses()` for observers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::OtaConfig;
use crate::error::{LinkError, OtaError};
use crate::link::{
    CharacteristicProperties, ConnectOptions, ConnectionState, Peripheral, Radio, WriteMode,
};
use crate::protocol_core::{self, Command, Response};

#[derive(Default)]
struct Inbox {
    queue: Mutex<VecDeque<Response>>,
    arrived: Notify,
}

impl Inbox {
    fn push(&self, response: Response) {
        self.queue.lock().push_back(response);
        self.arrived.notify_waiters();
    }

    fn pop_if(&self, pred: impl Fn(&Response) -> bool) -> Option<Response> {
        let mut queue = self.queue.lock();
        if pred(queue.front()?) {
            return queue.pop_front();
        }
        None
    }
}

/// Why a response wait ended without a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Disconnected,
    Cancelled,
}

/// Cloneable trigger that aborts whatever the session is waiting on
#[derive(Clone)]
pub struct CancelHandle {
    alive: Arc<watch::Sender<bool>>,
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.alive.send_replace(false);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub struct LinkSession<P: Peripheral> {
    peripheral: P,
    command_uuid: Uuid,
    response_uuid: Uuid,
    data_write_mode: WriteMode,
    mtu: usize,
    latest: watch::Receiver<Option<Response>>,
    inbox: Arc<Inbox>,
    alive: Arc<watch::Sender<bool>>,
    cancelled: Arc<AtomicBool>,
    closed: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Peripheral> LinkSession<P> {
    /// Resolve `address`, connect, locate the OTA characteristics and subscribe.
    /// On failure the peripheral is disconnected again; no half-open session escapes.
    pub async fn connect<R>(radio: &R, address: &str, config: &OtaConfig) -> Result<Self, OtaError>
    where
        R: Radio<Peripheral = P>,
    {
        log::info!("OTA: looking up {}", address);
        let peripheral = radio.find(address).await?;

        match establish(&peripheral, config).await {
            Ok((data_write_mode, notifications)) => {
                let mtu = peripheral.mtu().max(1);
                log::info!(
                    "OTA: connected to {} (mtu {}, data writes {:?})",
                    address,
                    mtu,
                    data_write_mode
                );
                Ok(Self::start(peripheral, config, data_write_mode, mtu, notifications))
            }
            Err(e) => {
                log::error!("OTA: connection to {} failed: {}", address, e);
                peripheral.disconnect().await;
                Err(OtaError::Connection(e))
            }
        }
    }

    fn start(
        peripheral: P,
        config: &OtaConfig,
        data_write_mode: WriteMode,
        mtu: usize,
        notifications: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        let (latest_tx, latest) = watch::channel(None);
        let inbox = Arc::new(Inbox::default());
        let (alive, _) = watch::channel(true);
        let alive = Arc::new(alive);
        let listener = tokio::spawn(listen(
            notifications,
            peripheral.connection_state(),
            latest_tx,
            inbox.clone(),
            alive.clone(),
        ));
        Self {
            peripheral,
            command_uuid: config.command_uuid,
            response_uuid: config.response_uuid,
            data_write_mode,
            mtu,
            latest,
            inbox,
            alive,
            cancelled: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            listener: Mutex::new(Some(listener)),
        }
    }

    pub fn address(&self) -> &str {
        self.peripheral.address()
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Chunk size bounded by what one write can carry
    pub fn recommended_chunk_size(&self, preferred: usize) -> usize {
        preferred.min(self.mtu).max(1)
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Liveness events; flips to `false` on link loss, close or cancel
    pub fn liveness(&self) -> watch::Receiver<bool> {
        self.alive.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            alive: self.alive.clone(),
            cancelled: self.cancelled.clone(),
        }
    }

    pub async fn send_command(&self, command: &Command) -> Result<(), LinkError> {
        let wire = protocol_core::encode(command);
        log::debug!("OTA: sending command: {}", wire.trim_end());
        self.write_with(wire.as_bytes(), WriteMode::WithResponse).await
    }

    /// Raw data write; uses write-without-response when the characteristic allows it
    pub async fn write(&self, data: &[u8]) -> Result<(), LinkError> {
        self.write_with(data, self.data_write_mode).await
    }

    async fn write_with(&self, data: &[u8], mode: WriteMode) -> Result<(), LinkError> {
        if !self.is_alive() {
            return Err(LinkError::NotConnected);
        }
        self.peripheral.write(self.command_uuid, data, mode).await
    }

    /// Multicast view of decoded responses. A new stream first yields the
    /// latest response (if any), then later ones; lines arriving in a burst
    /// may be skipped. Observing does not consume.
    pub fn responses(&self) -> impl Stream<Item = Response> + Send + 'static {
        let mut rx = self.latest.clone();
        rx.mark_changed();
        futures::stream::unfold(rx, |mut rx| async move {
            loop {
                rx.changed().await.ok()?;
                let latest = rx.borrow_and_update().clone();
                if let Some(response) = latest {
                    return Some((response, rx));
                }
            }
        })
    }

    /// Take the oldest unconsumed response, waiting up to `wait` for one.
    pub async fn next_response(&self, wait: Duration) -> Result<Response, WaitError> {
        let mut alive = self.alive.subscribe();
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);

        loop {
            // Register before checking the queue so a push in between still wakes us
            let arrived = self.inbox.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if self.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            if let Some(response) = self.inbox.pop_if(|_| true) {
                return Ok(response);
            }
            if !*alive.borrow_and_update() {
                return Err(self.lost());
            }
            tokio::select! {
                _ = &mut arrived => {}
                _ = alive.changed() => {}
                _ = &mut deadline => return Err(WaitError::Timeout),
            }
        }
    }

    /// Take the oldest unconsumed response without waiting, if it matches `pred`
    pub fn take_response_if(&self, pred: impl Fn(&Response) -> bool) -> Option<Response> {
        self.inbox.pop_if(pred)
    }

    fn lost(&self) -> WaitError {
        if self.is_cancelled() {
            WaitError::Cancelled
        } else {
            WaitError::Disconnected
        }
    }

    /// Release the subscription and the connection. Safe to call repeatedly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.send_replace(false);
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.peripheral.unsubscribe(self.response_uuid).await;
        self.peripheral.disconnect().await;
        log::info!("OTA: session with {} closed", self.peripheral.address());
    }
}

impl<P: Peripheral> Drop for LinkSession<P> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }
}

async fn establish<P: Peripheral>(
    peripheral: &P,
    config: &OtaConfig,
) -> Result<(WriteMode, mpsc::UnboundedReceiver<Vec<u8>>), LinkError> {
    let state = peripheral.connection_state();
    peripheral.connect(ConnectOptions { auto_mtu: true }).await?;
    wait_until_connected(state, config.connect_timeout()).await?;

    let services = peripheral.discover_services().await?;
    let service = services
        .iter()
        .find(|s| s.uuid == config.service_uuid)
        .ok_or(LinkError::ServiceMissing(config.service_uuid))?;

    let command = service
        .characteristic(config.command_uuid)
        .ok_or(LinkError::CharacteristicMissing(config.command_uuid))?;
    if !can_write(&command.properties) {
        return Err(LinkError::CharacteristicRole {
            uuid: command.uuid,
            role: "command (write)",
        });
    }

    let response = service
        .characteristic(config.response_uuid)
        .ok_or(LinkError::CharacteristicMissing(config.response_uuid))?;
    if !response.properties.notify {
        return Err(LinkError::CharacteristicRole {
            uuid: response.uuid,
            role: "response (notify)",
        });
    }

    let notifications = peripheral.subscribe(response.uuid).await?;

    let mode = if command.properties.write_without_response {
        WriteMode::WithoutResponse
    } else {
        WriteMode::WithResponse
    };
    Ok((mode, notifications))
}

fn can_write(props: &CharacteristicProperties) -> bool {
    props.write || props.write_without_response
}

async fn wait_until_connected(
    mut state: watch::Receiver<ConnectionState>,
    limit: Duration,
) -> Result<(), LinkError> {
    let ready = async {
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {
                    return Err(LinkError::ConnectFailed("peripheral disconnected".into()))
                }
                ConnectionState::Connecting => {}
            }
            if state.changed().await.is_err() {
                return Err(LinkError::NotConnected);
            }
        }
    };
    tokio::time::timeout(limit, ready)
        .await
        .map_err(|_| LinkError::ConnectTimeout)?
}

// Background listener: decodes notifications and tracks link state
async fn listen(
    mut notifications: mpsc::UnboundedReceiver<Vec<u8>>,
    mut state: watch::Receiver<ConnectionState>,
    latest: watch::Sender<Option<Response>>,
    inbox: Arc<Inbox>,
    alive: Arc<watch::Sender<bool>>,
) {
    loop {
        tokio::select! {
            biased;
            payload = notifications.recv() => match payload {
                Some(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    for line in text.split('\n').filter(|l| !l.trim().is_empty()) {
                        let response = protocol_core::decode(line);
                        log::debug!("OTA: received response: {}", response);
                        inbox.push(response.clone());
                        latest.send_replace(Some(response));
                    }
                }
                None => {
                    log::info!("OTA: notification stream ended");
                    break;
                }
            },
            changed = state.changed() => {
                let disconnected =
                    changed.is_err() || *state.borrow_and_update() == ConnectionState::Disconnected;
                if disconnected {
                    log::info!("OTA: link disconnected");
                    break;
                }
            }
        }
    }
    alive.send_replace(false);
}
