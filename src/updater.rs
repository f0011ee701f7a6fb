//! End-to-end update flow: connect (with retries), version check, transfer,
//! reboot. Progress is reported as [`UpdateState`] values for a UI or CLI.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::OtaConfig;
use crate::controller::{HandshakeProgress, OtaController};
use crate::error::OtaError;
use crate::firmware::FirmwarePayload;
use crate::link::Radio;
use crate::logger::{NoopLogger, UpdateLogger};
use crate::session::CancelHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateState {
    Processing(String),
    Updating {
        sent: u64,
        total: u64,
        message: String,
    },
    Success,
    Error(String),
}

impl UpdateState {
    /// Upload fraction in `0.0..=1.0`, for `Updating` only
    pub fn fraction(&self) -> Option<f64> {
        match self {
            UpdateState::Updating { total: 0, .. } => Some(1.0),
            UpdateState::Updating { sent, total, .. } => Some(*sent as f64 / *total as f64),
            _ => None,
        }
    }
}

type StateSink<'a> = &'a mut (dyn FnMut(UpdateState) + Send);

pub struct Updater<R: Radio> {
    radio: R,
    config: OtaConfig,
    logger: Arc<dyn UpdateLogger>,
    reboot: bool,
}

impl<R: Radio> Updater<R> {
    pub fn new(radio: R, config: OtaConfig) -> Self {
        Self {
            radio,
            config,
            logger: Arc::new(NoopLogger),
            reboot: true,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn UpdateLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn reboot_after_update(mut self, reboot: bool) -> Self {
        self.reboot = reboot;
        self
    }

    /// Run a full update against `address`. Setting `cancel` to `true`
    /// aborts the run with [`OtaError::Cancelled`].
    pub async fn run(
        &self,
        address: &str,
        firmware: &FirmwarePayload,
        mut update_state: impl FnMut(UpdateState) + Send,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<(), OtaError> {
        let started = Instant::now();
        log::info!("OTA: firmware hash: {}", firmware.sha256());
        self.logger.start(address, firmware.len(), firmware.sha256());

        let result = self
            .run_inner(address, firmware, &mut update_state, cancel)
            .await;
        match &result {
            Ok(()) => {
                update_state(UpdateState::Success);
                self.logger
                    .done(address, firmware.len(), started.elapsed().as_secs_f64());
            }
            Err(e) => {
                log::error!("OTA: update of {} failed: {}", address, e);
                update_state(UpdateState::Error(e.user_message()));
                self.logger.error(address, "update", &e.to_string());
            }
        }
        result
    }

    async fn run_inner(
        &self,
        address: &str,
        firmware: &FirmwarePayload,
        update_state: StateSink<'_>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<(), OtaError> {
        let mut controller = self
            .connect_with_retries(address, update_state, cancel.as_ref())
            .await?;

        let forwarder = cancel.map(|rx| forward_cancel(rx, controller.cancel_handle()));
        let result = self.drive(&mut controller, address, firmware, update_state).await;
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        controller.close().await;
        result
    }

    async fn connect_with_retries(
        &self,
        address: &str,
        update_state: StateSink<'_>,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<OtaController<R::Peripheral>, OtaError> {
        let attempts = self.config.connect_attempts.max(1);
        self.logger.phase(address, "connect");
        let mut attempt = 1;
        loop {
            if cancel.map(|rx| *rx.borrow()).unwrap_or(false) {
                return Err(OtaError::Cancelled);
            }
            update_state(UpdateState::Processing(format!(
                "Connecting to device (attempt {}/{})...",
                attempt, attempts
            )));
            match OtaController::connect(&self.radio, address, self.config.clone()).await {
                Ok(controller) => return Ok(controller),
                Err(e) if attempt >= attempts => {
                    log::warn!("OTA: giving up after {} connection attempts", attempts);
                    return Err(e);
                }
                Err(e) => {
                    log::warn!("OTA: connection attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(self.config.retry_delay()).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn drive(
        &self,
        controller: &mut OtaController<R::Peripheral>,
        address: &str,
        firmware: &FirmwarePayload,
        update_state: StateSink<'_>,
    ) -> Result<(), OtaError> {
        update_state(UpdateState::Processing("Checking device version...".into()));
        self.logger.phase(address, "version");
        controller.version().await?;

        update_state(UpdateState::Processing("Starting OTA update...".into()));
        self.logger.phase(address, "handshake");
        controller
            .start_transfer(firmware.len(), firmware.sha256(), |progress| {
                if progress == HandshakeProgress::Erasing {
                    update_state(UpdateState::Processing("Erasing flash...".into()));
                }
            })
            .await?;

        update_state(UpdateState::Updating {
            sent: 0,
            total: firmware.len(),
            message: "Uploading firmware...".into(),
        });
        self.logger.phase(address, "stream");
        let chunk_size = controller.recommended_chunk_size();
        controller
            .stream_firmware(firmware.data(), chunk_size, |sent, total| {
                let percent = if total == 0 { 100 } else { sent * 100 / total };
                update_state(UpdateState::Updating {
                    sent,
                    total,
                    message: format!("Uploading firmware... {}%", percent),
                });
            })
            .await?;

        if self.reboot {
            update_state(UpdateState::Processing("Rebooting device...".into()));
            self.logger.phase(address, "reboot");
            controller.reboot().await?;
        }
        Ok(())
    }
}

fn forward_cancel(mut cancel: watch::Receiver<bool>, handle: CancelHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *cancel.borrow_and_update() {
                log::warn!("OTA: cancellation requested");
                handle.cancel();
                return;
            }
            if cancel.changed().await.is_err() {
                return;
            }
        }
    })
}
