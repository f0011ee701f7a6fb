//! meshota - push firmware to ESP32 mesh radios over WiFi OTA

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use meshota::cli::{Args, Cmd, TargetOpts, UpdateOpts};
use meshota::discovery;
use meshota::logger::{JsonlLogger, NoopLogger, UpdateLogger};
use meshota::net::TcpRadio;
use meshota::progress::UploadProgress;
use meshota::{FirmwarePayload, OtaConfig, OtaController, Updater};

fn main() {
    let args = Args::parse();

    let level = if args.verbose {
        log::LevelFilter::Debug
    } else if args.quiet {
        log::LevelFilter::Warn
    } else {
        log::LevelFilter::Info
    };
    let mut builder = colog::default_builder();
    builder.filter_level(level);
    builder.init();

    if let Err(error) = application(args) {
        log::error!("{:#}", error);
        std::process::exit(1);
    }
}

fn application(args: Args) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match args.command {
        Cmd::Update(opts) => rt.block_on(update(opts)),
        Cmd::Version(opts) => rt.block_on(version(opts)),
        Cmd::Discover { timeout_ms } => rt.block_on(discover(timeout_ms)),
    }
}

fn load_config(target: &TargetOpts) -> Result<OtaConfig> {
    match &target.config {
        Some(path) => OtaConfig::load(path),
        None => OtaConfig::load_default_or(OtaConfig::wifi()),
    }
}

fn radio_for(target: &TargetOpts, config: &OtaConfig) -> TcpRadio {
    TcpRadio::new(target.port).with_connect_timeout(config.connect_timeout())
}

async fn update(opts: UpdateOpts) -> Result<()> {
    let mut config = load_config(&opts.target)?;
    if let Some(chunk_size) = opts.chunk_size {
        if chunk_size == 0 {
            anyhow::bail!("--chunk-size must be greater than zero");
        }
        config.chunk_size = chunk_size;
    }

    let firmware = match &opts.hash {
        Some(hash) => {
            let image = FirmwarePayload::from_file(&opts.firmware)?;
            FirmwarePayload::with_hash(image.data().to_vec(), hash.to_ascii_lowercase())
        }
        None => FirmwarePayload::from_file(&opts.firmware)?,
    };
    log::info!(
        "Firmware {} ({} bytes, sha256 {})",
        opts.firmware.display(),
        firmware.len(),
        firmware.sha256()
    );

    let logger: Arc<dyn UpdateLogger> = match &opts.log_file {
        Some(path) => Arc::new(JsonlLogger::new(path)?),
        None => Arc::new(NoopLogger),
    };

    // Ctrl-C cancels the transfer; the session is closed before exiting
    let (cancel_tx, cancel_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user, cancelling update...");
        let _ = cancel_tx.send(true);
    })
    .context("Error setting Ctrl-C handler")?;

    let radio = radio_for(&opts.target, &config);
    let updater = Updater::new(radio, config)
        .with_logger(logger)
        .reboot_after_update(!opts.no_reboot);

    let progress = UploadProgress::new(firmware.len());
    updater
        .run(
            &opts.target.host,
            &firmware,
            |state| progress.apply(&state),
            Some(cancel_rx),
        )
        .await
        .with_context(|| format!("update of {} failed", opts.target.host))?;
    Ok(())
}

async fn version(opts: TargetOpts) -> Result<()> {
    let config = load_config(&opts)?;
    let radio = radio_for(&opts, &config);
    let mut controller = OtaController::connect(&radio, &opts.host, config).await?;
    let result = controller.version().await;
    controller.close().await;

    match result? {
        Some(info) => {
            println!("Hardware:     {}", info.hw_version);
            println!("Firmware:     {}", info.fw_version);
            println!("Reboot count: {}", info.reboot_count);
            println!("Build:        {}", info.git_hash);
        }
        None => println!("Device answered OK without version details"),
    }
    Ok(())
}

async fn discover(timeout_ms: u64) -> Result<()> {
    let devices = discovery::discover_devices(Duration::from_millis(timeout_ms)).await;
    if devices.is_empty() {
        println!("No devices found");
    }
    for ip in devices {
        println!("{}", ip);
    }
    Ok(())
}
