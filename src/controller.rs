//! OTA session controller: handshake, stream, verify.
//!
//! ```text
//! Idle -> Handshaking -> Streaming -> Verifying -> Complete
//!            \______________\____________\________> Failed(reason)
//! ```
//!
//! `Complete` and `Failed` are terminal; no transfer command is sent once
//! either is reached.

use std::fmt;
use std::time::Duration;

use crate::config::OtaConfig;
use crate::error::{LinkError, OtaError};
use crate::firmware::FirmwarePayload;
use crate::link::{Peripheral, Radio};
use crate::protocol::{HASH_MISMATCH_MARKER, HASH_REJECTED_MARKER};
use crate::protocol_core::{Command, DeviceInfo, Response};
use crate::session::{CancelHandle, LinkSession, WaitError};
use crate::uploader::ChunkedUploader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Handshaking,
    Streaming,
    Verifying,
    Complete,
    Failed(OtaError),
}

impl TransferState {
    pub fn name(&self) -> &'static str {
        match self {
            TransferState::Idle => "idle",
            TransferState::Handshaking => "handshaking",
            TransferState::Streaming => "streaming",
            TransferState::Verifying => "verifying",
            TransferState::Complete => "complete",
            TransferState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Failed(_))
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Informational events during the start handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProgress {
    CommandSent,
    Erasing,
}

pub struct OtaController<P: Peripheral> {
    session: LinkSession<P>,
    config: OtaConfig,
    state: TransferState,
}

impl<P: Peripheral> OtaController<P> {
    pub async fn connect<R>(radio: &R, address: &str, config: OtaConfig) -> Result<Self, OtaError>
    where
        R: Radio<Peripheral = P>,
    {
        let session = LinkSession::connect(radio, address, &config).await?;
        Ok(Self::new(session, config))
    }

    pub fn new(session: LinkSession<P>, config: OtaConfig) -> Self {
        Self {
            session,
            config,
            state: TransferState::Idle,
        }
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn session(&self) -> &LinkSession<P> {
        &self.session
    }

    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.session.cancel_handle()
    }

    /// Configured chunk size clamped to the negotiated MTU
    pub fn recommended_chunk_size(&self) -> usize {
        self.session.recommended_chunk_size(self.config.chunk_size)
    }

    /// Move a non-terminal transfer to `Failed` if the link is gone
    pub fn refresh_state(&mut self) -> &TransferState {
        if !self.state.is_terminal() && !self.session.is_alive() {
            let reason = if self.session.is_cancelled() {
                OtaError::Cancelled
            } else {
                match self.state {
                    TransferState::Streaming => OtaError::connection_lost_during_transfer(),
                    TransferState::Verifying => {
                        OtaError::TransferFailed("Connection lost".to_string())
                    }
                    _ => OtaError::ConnectionLost,
                }
            };
            self.fail(reason);
        }
        &self.state
    }

    /// Query the device's diagnostic quartet; only valid before a transfer
    pub async fn version(&mut self) -> Result<Option<DeviceInfo>, OtaError> {
        self.require(&[TransferState::Idle], "idle")?;
        let response = self
            .command_round_trip(&Command::Version, self.config.command_timeout_ms)
            .await;
        match response {
            Ok(Response::Ok(info)) => {
                if let Some(info) = &info {
                    log::info!(
                        "OTA: device version - HW: {}, FW: {}, reboots: {}, build: {}",
                        info.hw_version,
                        info.fw_version,
                        info.reboot_count,
                        info.git_hash
                    );
                }
                Ok(info)
            }
            Ok(other) => Err(unexpected(&Command::Version, other)),
            Err(e) => Err(self.fail_if_link_gone(e)),
        }
    }

    /// Send the start command and wait for the device to accept it
    pub async fn start_transfer(
        &mut self,
        size: u64,
        hash: &str,
        on_progress: impl FnMut(HandshakeProgress),
    ) -> Result<(), OtaError> {
        self.require(&[TransferState::Idle], "idle")?;
        self.state = TransferState::Handshaking;
        log::info!("OTA: starting transfer of {} bytes (sha256 {})", size, hash);

        let result = self.handshake(size, hash, on_progress).await;
        match result {
            Ok(()) => {
                self.state = TransferState::Streaming;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Upload the image and wait for the device's verification verdict
    pub async fn stream_firmware(
        &mut self,
        data: &[u8],
        chunk_size: usize,
        on_progress: impl FnMut(u64, u64),
    ) -> Result<(), OtaError> {
        self.require(&[TransferState::Streaming], "streaming")?;

        let uploader = ChunkedUploader::new(&self.session, &self.config);
        let streamed = uploader.stream(data, chunk_size, on_progress).await;
        if let Err(e) = streamed {
            return Err(self.fail(e));
        }
        log::info!("OTA: firmware streaming complete ({} bytes)", data.len());

        self.state = TransferState::Verifying;
        let verified = self.verify().await;
        match verified {
            Ok(()) => {
                log::info!("OTA: device verified the image");
                self.state = TransferState::Complete;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Handshake then stream, using the recommended chunk size
    pub async fn update(
        &mut self,
        firmware: &FirmwarePayload,
        on_progress: impl FnMut(u64, u64),
    ) -> Result<(), OtaError> {
        self.start_transfer(firmware.len(), firmware.sha256(), |_| {})
            .await?;
        let chunk_size = self.recommended_chunk_size();
        self.stream_firmware(firmware.data(), chunk_size, on_progress)
            .await
    }

    /// Ask the device to boot the new image. Allowed before any transfer or
    /// after a completed one.
    pub async fn reboot(&mut self) -> Result<(), OtaError> {
        self.require(&[TransferState::Idle, TransferState::Complete], "idle or complete")?;
        let response = self
            .command_round_trip(&Command::Reboot, self.config.command_timeout_ms)
            .await;
        match response {
            Ok(Response::Ok(_)) => Ok(()),
            Ok(other) => Err(unexpected(&Command::Reboot, other)),
            // The device may drop the link as it goes down
            Err(OtaError::ConnectionLost) => {
                log::info!("OTA: link dropped after REBOOT, assuming device is restarting");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn close(&self) {
        self.session.close().await;
    }

    async fn handshake(
        &self,
        size: u64,
        hash: &str,
        mut on_progress: impl FnMut(HandshakeProgress),
    ) -> Result<(), OtaError> {
        let command = Command::start_transfer(size, hash);
        if let Err(e) = self.session.send_command(&command).await {
            return Err(self.write_error(e));
        }
        on_progress(HandshakeProgress::CommandSent);

        let wait_ms = self.config.erase_timeout_ms;
        loop {
            match self.session.next_response(Duration::from_millis(wait_ms)).await {
                Ok(Response::Ok(_)) => return Ok(()),
                Ok(Response::Erasing) => {
                    log::info!("OTA: device erasing flash...");
                    on_progress(HandshakeProgress::Erasing);
                }
                Ok(Response::Ack) => log::debug!("OTA: ignoring ACK during handshake"),
                Ok(Response::Error(message)) => {
                    if contains_marker(&message, HASH_REJECTED_MARKER) {
                        return Err(OtaError::HashRejected {
                            hash: hash.to_string(),
                        });
                    }
                    return Err(OtaError::HandshakeRejected(message));
                }
                Err(WaitError::Timeout) => return Err(OtaError::Timeout(wait_ms)),
                Err(WaitError::Disconnected) => return Err(OtaError::ConnectionLost),
                Err(WaitError::Cancelled) => return Err(OtaError::Cancelled),
            }
        }
    }

    async fn verify(&self) -> Result<(), OtaError> {
        let wait_ms = self.config.verification_timeout_ms;
        loop {
            match self.session.next_response(Duration::from_millis(wait_ms)).await {
                Ok(Response::Ok(_)) => return Ok(()),
                Ok(Response::Error(message)) => {
                    if contains_marker(&message, HASH_MISMATCH_MARKER) {
                        return Err(OtaError::VerificationFailed);
                    }
                    return Err(OtaError::TransferFailed(format!(
                        "Verification failed: {}",
                        message
                    )));
                }
                Ok(other) => log::debug!("OTA: ignoring {} while verifying", other),
                Err(WaitError::Timeout) => return Err(OtaError::Timeout(wait_ms)),
                Err(WaitError::Disconnected) => {
                    return Err(OtaError::TransferFailed("Connection lost".to_string()))
                }
                Err(WaitError::Cancelled) => return Err(OtaError::Cancelled),
            }
        }
    }

    // Single command, single response
    async fn command_round_trip(
        &self,
        command: &Command,
        wait_ms: u64,
    ) -> Result<Response, OtaError> {
        if let Err(e) = self.session.send_command(command).await {
            return Err(self.write_error(e));
        }
        match self.session.next_response(Duration::from_millis(wait_ms)).await {
            Ok(Response::Error(message)) => Err(OtaError::CommandFailed {
                command: command.name(),
                message,
            }),
            Ok(response) => Ok(response),
            Err(WaitError::Timeout) => Err(OtaError::Timeout(wait_ms)),
            Err(WaitError::Disconnected) => Err(OtaError::ConnectionLost),
            Err(WaitError::Cancelled) => Err(OtaError::Cancelled),
        }
    }

    fn write_error(&self, e: LinkError) -> OtaError {
        if self.session.is_cancelled() {
            OtaError::Cancelled
        } else if !self.session.is_alive() {
            OtaError::ConnectionLost
        } else {
            OtaError::WriteFailed(e.to_string())
        }
    }

    fn require(&self, allowed: &[TransferState], expected: &'static str) -> Result<(), OtaError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(OtaError::InvalidState {
                expected,
                actual: self.state.name(),
            })
        }
    }

    fn fail(&mut self, reason: OtaError) -> OtaError {
        log::error!("OTA: transfer failed: {}", reason);
        self.state = TransferState::Failed(reason.clone());
        reason
    }

    // Auxiliary commands leave the state alone unless the link is gone
    fn fail_if_link_gone(&mut self, e: OtaError) -> OtaError {
        match e {
            OtaError::ConnectionLost | OtaError::Cancelled => self.fail(e),
            other => other,
        }
    }
}

fn contains_marker(message: &str, marker: &str) -> bool {
    message.to_ascii_lowercase().contains(marker)
}

fn unexpected(command: &Command, response: Response) -> OtaError {
    OtaError::CommandFailed {
        command: command.name(),
        message: format!("Unexpected response: {}", response),
    }
}
