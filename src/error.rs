//! Failure taxonomy for the OTA transport
//!
//! Every variant is terminal for the transfer it belongs to. Retrying is a
//! decision for the caller (see `updater` for the connect retry loop).

use thiserror::Error;
use uuid::Uuid;

/// Failures raised by the low-level link (radio stack or socket)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("peripheral {0} not found")]
    NotFound(String),

    #[error("connection refused: {0}")]
    ConnectFailed(String),

    #[error("timed out waiting for the link to become ready")]
    ConnectTimeout,

    #[error("service {0} not found")]
    ServiceMissing(Uuid),

    #[error("characteristic {0} not found")]
    CharacteristicMissing(Uuid),

    #[error("characteristic {uuid} cannot be used as {role}")]
    CharacteristicRole { uuid: Uuid, role: &'static str },

    #[error("subscription to {0} rejected")]
    SubscribeFailed(Uuid),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Io(e.to_string())
    }
}

/// Classified result of a failed OTA operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtaError {
    #[error("connection failed: {0}")]
    Connection(#[from] LinkError),

    #[error("device rejected firmware hash {hash}")]
    HashRejected { hash: String },

    #[error("device rejected the update: {0}")]
    HandshakeRejected(String),

    #[error("timeout waiting for response after {0}ms")]
    Timeout(u64),

    #[error("connection lost")]
    ConnectionLost,

    #[error("{0}")]
    TransferFailed(String),

    #[error("firmware hash mismatch after transfer")]
    VerificationFailed,

    #[error("{command} failed: {message}")]
    CommandFailed {
        command: &'static str,
        message: String,
    },

    #[error("failed to send command: {0}")]
    WriteFailed(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("operation requires {expected} state, session is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

impl OtaError {
    /// Message suitable for showing to a user
    pub fn user_message(&self) -> String {
        match self {
            OtaError::HashRejected { .. } => {
                "Firmware hash rejected. Device may require hash provisioning or bootloader update."
                    .to_string()
            }
            other => format!("OTA update failed: {}", other),
        }
    }

    pub(crate) fn connection_lost_during_transfer() -> Self {
        OtaError::TransferFailed("Connection lost during transfer".to_string())
    }
}
