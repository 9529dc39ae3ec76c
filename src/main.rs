use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::Context;
use canflash::backend::{self, BackendKind};
use canflash::{FirmwareImage, FlashConfig, FlashError, flash_image_with_progress, probe_application};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;

/// Flash firmware images through a CAN bus bootloader
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Log level: off, error, warn, info, debug, trace
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transfer a binary image to the target and start it
    Flash(FlashArgs),
    /// Check that an application is running and answers on the bus
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
struct BusArgs {
    /// CAN adapter kind
    #[arg(long, value_enum, default_value_t = Backend::Socketcan)]
    backend: Backend,

    /// Network interface (socketcan) or serial port (slcan)
    #[arg(long, default_value = "can0")]
    channel: String,

    /// CAN bit rate in bit/s. SocketCAN interfaces are left untouched when omitted
    #[arg(long)]
    bitrate: Option<u32>,
}

#[derive(Args, Debug)]
struct FlashArgs {
    /// Path to the .bin image
    file: PathBuf,

    #[command(flatten)]
    bus: BusArgs,

    /// Size of the application flash region in KiB
    #[arg(long, default_value_t = 96)]
    max_size_kib: usize,

    /// Wait for the enter bootloader acknowledgment, in milliseconds
    #[arg(long, default_value_t = 5000)]
    entry_timeout_ms: u64,

    /// Wait for each chunk acknowledgment, in milliseconds
    #[arg(long, default_value_t = 5000)]
    chunk_timeout_ms: u64,

    /// Wait for the final acknowledgment, in milliseconds
    #[arg(long, default_value_t = 2000)]
    finalize_timeout_ms: u64,

    /// Transmissions of one chunk before giving up
    #[arg(long, default_value_t = 5)]
    max_retries: u32,
}

#[derive(Args, Debug)]
struct ProbeArgs {
    #[command(flatten)]
    bus: BusArgs,

    /// Wait for the application answer, in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    /// Linux SocketCAN interface
    Socketcan,
    /// Serial-line CAN adapter (Lawicel protocol)
    Slcan,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Socketcan => BackendKind::SocketCan,
            Backend::Slcan => BackendKind::Slcan,
        }
    }
}

impl FlashArgs {
    fn config(&self) -> FlashConfig {
        FlashConfig {
            entry_timeout: Duration::from_millis(self.entry_timeout_ms),
            chunk_timeout: Duration::from_millis(self.chunk_timeout_ms),
            finalize_timeout: Duration::from_millis(self.finalize_timeout_ms),
            max_retries: self.max_retries,
            max_image_size: self.max_size_kib << 10,
            ..FlashConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(cli.log_level)
        .format_timestamp_millis()
        .init();

    match cli.command {
        Command::Flash(args) => flash(args).await,
        Command::Probe(args) => probe(args).await,
    }
}

async fn flash(args: FlashArgs) -> anyhow::Result<ExitCode> {
    let config = args.config();
    config.validate()?;

    let image = FirmwareImage::load(&args.file, config.max_image_size)?;
    let chunk_count = image.chunk_count(config.chunk_size);
    println!("--- CAN Flash Tool ---");
    println!("Firmware size: {} bytes", image.len());
    println!("CRC32: 0x{:08X}", image.crc32());
    println!("Chunks: {chunk_count}");

    let transport = backend::open(args.bus.backend.into(), &args.bus.channel, args.bus.bitrate)?;

    let progress = ProgressBar::new(chunk_count as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} chunks [{elapsed_precise}] {msg}")
            .context("invalid progress bar template")?,
    );

    let start = Instant::now();
    let result = flash_image_with_progress(
        transport,
        &image,
        &config,
        Some(|acknowledged: usize, _total: usize| progress.set_position(acknowledged as u64)),
    )
    .await;
    progress.finish_and_clear();

    match result {
        Ok(report) => {
            println!(
                "SUCCESS: Application started ({} chunks, {} retries, {:.1}s)",
                report.chunk_count,
                report.retries,
                start.elapsed().as_secs_f32()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(FlashError::FinalAckMissing { report }) => {
            println!(
                "WARNING: all {} chunks accepted but no final ACK, the application has probably started",
                report.chunk_count
            );
            Ok(ExitCode::from(2))
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn probe(args: ProbeArgs) -> anyhow::Result<ExitCode> {
    let transport = backend::open(args.bus.backend.into(), &args.bus.channel, args.bus.bitrate)?;
    let answered = probe_application(transport, Duration::from_millis(args.timeout_ms)).await?;

    if answered {
        println!("SUCCESS: application answered");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("FAILED: no response from the application");
        println!("Possible causes:");
        println!("  1. Jump to the application failed");
        println!("  2. Application vector table invalid");
        println!("  3. Application CAN peripheral not started");
        println!("  4. Wrong bit rate or filters");
        Ok(ExitCode::FAILURE)
    }
}
