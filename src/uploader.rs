//! Chunked firmware upload with ACK-paced flow control

use std::time::Duration;

use crate::config::{AckMode, OtaConfig};
use crate::error::OtaError;
use crate::link::Peripheral;
use crate::protocol_core::Response;
use crate::session::{LinkSession, WaitError};

/// Splits an image into write-sized slices and paces them against the device.
///
/// The uploader only answers "did every byte go out and get acknowledged";
/// whether the device accepts the image is decided by the controller's
/// verification step.
pub struct ChunkedUploader<'a, P: Peripheral> {
    session: &'a LinkSession<P>,
    ack_mode: AckMode,
    ack_timeout_ms: u64,
    write_delay: Duration,
}

impl<'a, P: Peripheral> ChunkedUploader<'a, P> {
    pub fn new(session: &'a LinkSession<P>, config: &OtaConfig) -> Self {
        Self {
            session,
            ack_mode: config.ack_mode,
            ack_timeout_ms: config.ack_timeout_ms,
            write_delay: config.write_delay(),
        }
    }

    /// Write `payload` in slices of at most `chunk_size` bytes, strictly in order.
    /// `on_progress(sent, total)` runs once per acknowledged slice.
    pub async fn stream(
        &self,
        payload: &[u8],
        chunk_size: usize,
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<(), OtaError> {
        if chunk_size == 0 {
            return Err(OtaError::TransferFailed(
                "chunk size must be greater than zero".to_string(),
            ));
        }

        let total = payload.len() as u64;
        let mut sent = 0u64;

        for chunk in payload.chunks(chunk_size) {
            if !self.session.is_alive() {
                return Err(self.lost());
            }

            // No ACKs on stream links, but an early ERR still aborts. The
            // reply to the final chunk belongs to verification.
            if self.ack_mode == AckMode::None {
                if let Some(Response::Error(message)) = self
                    .session
                    .take_response_if(|r| matches!(r, Response::Error(_)))
                {
                    return Err(transfer_error(&message));
                }
            }

            if let Err(e) = self.session.write(chunk).await {
                if !self.session.is_alive() {
                    return Err(self.lost());
                }
                return Err(OtaError::TransferFailed(format!("Failed to write data: {}", e)));
            }

            if !self.write_delay.is_zero() {
                tokio::time::sleep(self.write_delay).await;
            }

            if self.ack_mode == AckMode::PerChunk {
                self.wait_for_ack().await?;
            }

            sent += chunk.len() as u64;
            on_progress(sent, total);
        }

        Ok(())
    }

    async fn wait_for_ack(&self) -> Result<(), OtaError> {
        let wait = Duration::from_millis(self.ack_timeout_ms);
        loop {
            match self.session.next_response(wait).await {
                Ok(response) if response.is_ack_class() => return Ok(()),
                Ok(Response::Error(message)) => return Err(transfer_error(&message)),
                Ok(other) => log::debug!("OTA: ignoring {} while waiting for ACK", other),
                Err(WaitError::Timeout) => return Err(OtaError::Timeout(self.ack_timeout_ms)),
                Err(WaitError::Disconnected) => return Err(self.lost()),
                Err(WaitError::Cancelled) => return Err(OtaError::Cancelled),
            }
        }
    }

    fn lost(&self) -> OtaError {
        if self.session.is_cancelled() {
            OtaError::Cancelled
        } else {
            OtaError::connection_lost_during_transfer()
        }
    }
}

fn transfer_error(message: &str) -> OtaError {
    OtaError::TransferFailed(format!("Transfer failed: {}", message))
}
