//! Downward dependency: the platform radio stack.
//!
//! The transport only needs to resolve an address to a peripheral, connect
//! to it, find the OTA service and write to / subscribe on two
//! characteristics. Platform BLE stacks implement these traits; `net`
//! implements them over a TCP socket for WiFi OTA.

use std::fmt;
use std::future::Future;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Ask the stack to negotiate the largest workable MTU
    pub auto_mtu: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { auto_mtu: true }
    }
}

/// Resolves device addresses to connectable peripherals
pub trait Radio: Send + Sync {
    type Peripheral: Peripheral;

    fn find(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Self::Peripheral, LinkError>> + Send;
}

/// One remote device reachable over the radio stack
pub trait Peripheral: Send + Sync + 'static {
    fn address(&self) -> &str;

    /// Request a connection; readiness is reported through `connection_state`
    fn connect(&self, options: ConnectOptions) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Largest payload accepted by a single write after negotiation
    fn mtu(&self) -> usize;

    fn discover_services(&self) -> impl Future<Output = Result<Vec<GattService>, LinkError>> + Send;

    fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Enable notifications; every notification payload arrives on the receiver
    fn subscribe(
        &self,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<mpsc::UnboundedReceiver<Vec<u8>>, LinkError>> + Send;

    fn unsubscribe(&self, characteristic: Uuid) -> impl Future<Output = ()> + Send;

    fn disconnect(&self) -> impl Future<Output = ()> + Send;
}
