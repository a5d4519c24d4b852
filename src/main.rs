//! Command-line front end for the MAR-CCD acquisition driver.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use marccd_daq::config::{DetectorConfig, LoggingConfig};
use marccd_daq::core::{DecodedImage, FrameType, ImageDims, ShutterMode};
use marccd_daq::detector::{DetectorHandle, DiscardSink, SettingsStore};
use marccd_daq::hardware::marccd::TaskKind;
use marccd_daq::hardware::mock::MockMarServer;
use marccd_daq::hardware::transport::LineTransport;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[clap(short, long, value_hint = clap::ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Run against an in-process simulated detector server
    #[clap(long)]
    simulate: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read and decode the server state
    Status,
    /// Acquire frames and print each published image
    Acquire(AcquireArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct AcquireArgs {
    /// Exposure time in seconds
    #[clap(short, long)]
    exposure: Option<f64>,
    /// normal, background, raw or double-correlation
    #[clap(short, long)]
    frame_type: Option<FrameType>,
    /// Number of frames to acquire
    #[clap(short = 'n', long, default_value = "1")]
    count: u32,
    /// Save every frame (required to read images back)
    #[clap(long)]
    auto_save: bool,
    /// Open and close the shutter around each exposure
    #[clap(long)]
    shutter: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DetectorConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DetectorConfig::load_defaults()?,
    };
    init_tracing(&config.logging);

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let transport = if cli.simulate {
        config.files.path = std::env::temp_dir().join("marccd-sim");
        let server = MockMarServer::new(ImageDims::new(
            config.detector.max_size_x,
            config.detector.max_size_y,
        ));
        info!("Using simulated detector server");
        LineTransport::new(
            server.connect(),
            config.server.read_timeout(),
            config.server.terminator.clone(),
        )
    } else {
        LineTransport::connect(
            &config.server.address,
            config.server.read_timeout(),
            config.server.terminator.clone(),
        )
        .await
        .with_context(|| format!("connecting to {}", config.server.address))?
    };

    match cli.command {
        Commands::Status => {
            let (detector, worker) =
                DetectorHandle::spawn(&config, transport, Arc::new(DiscardSink));
            let result = status(&detector).await;
            detector.shutdown().await?;
            worker.await?;
            result
        }
        Commands::Acquire(args) => {
            let (image_tx, image_rx) = mpsc::channel(4);
            let (detector, worker) =
                DetectorHandle::spawn(&config, transport, Arc::new(image_tx));
            let result = acquire(&detector, image_rx, args).await;
            detector.shutdown().await?;
            worker.await?;
            result
        }
        Commands::Config => Ok(()),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn status(detector: &DetectorHandle) -> Result<()> {
    let word = detector.refresh_state().await?;
    println!("Status word: {}", word);
    for task in TaskKind::ALL {
        println!("  {:<9} {:?}", format!("{:?}", task), word.task(task));
    }
    println!("{}", detector.report());
    Ok(())
}

async fn acquire(
    detector: &DetectorHandle,
    mut images: mpsc::Receiver<DecodedImage>,
    args: AcquireArgs,
) -> Result<()> {
    let settings = detector.settings();
    if let Some(seconds) = args.exposure {
        let exposure = Duration::try_from_secs_f64(seconds)
            .with_context(|| format!("invalid exposure time {}", seconds))?;
        settings.set_exposure_time(exposure);
    }
    if let Some(frame_type) = args.frame_type {
        settings.set_frame_type(frame_type);
    }
    if args.auto_save {
        settings.set_auto_save(true);
    }
    if args.shutter {
        settings.set_shutter_mode(ShutterMode::Detector);
    }

    let stopper = detector.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping acquisition");
            stopper.stop();
        }
    });

    for frame in 1..=args.count {
        if !detector.start().await? {
            bail!("detector is already acquiring");
        }
        detector.wait_idle().await?;

        match images.try_recv() {
            Ok(image) => println!(
                "image {:>4}  {}  {}",
                image.id,
                image.dims,
                image.timestamp.to_rfc3339()
            ),
            Err(_) => {
                let report = detector.report();
                println!("frame {:>4}  no image: {}", frame, report.message);
                if report.message.contains("aborted") {
                    break;
                }
            }
        }
    }
    Ok(())
}
