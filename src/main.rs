//! # Haptic Link - Command Line Entry Point
//!
//! Connects to the haptic controller, decodes every signal file given on the
//! command line, sends each one as a PCM frame, then keeps the connection (and
//! its reconnect loop) running and logs controller messages until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use haptic_link::audio::AudioDecoder;
use haptic_link::config::AppConfig;
use haptic_link::signal::SignalLoader;
use haptic_link::websocket::{ConnectionState, DeviceLink};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for haptic-link
#[derive(Parser, Debug)]
#[command(name = "haptic-link")]
#[command(about = "Stream mono PCM signals to a haptic-actuator controller")]
#[command(version)]
struct Args {
    /// Signal files (mono WAV, FLAC, MP3, ...) to decode and send once connected
    signals: Vec<PathBuf>,

    /// Controller endpoint, overrides the configured one
    #[arg(short, long, env = "HAPTIC_ENDPOINT")]
    endpoint: Option<String>,

    /// Configuration file name (extension optional)
    #[arg(short, long, default_value = "config")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    dotenv::dotenv().ok();

    init_tracing()?;

    let args = Args::parse();

    let mut config = AppConfig::load_from(&args.config).context("Failed to load configuration")?;
    if let Some(endpoint) = args.endpoint {
        config.link.endpoint = endpoint;
    }
    config.validate()?;

    info!("Starting haptic-link v{}", env!("CARGO_PKG_VERSION"));
    info!("Controller endpoint: {}", config.link.endpoint);

    let decoder = AudioDecoder::init_shared(config.audio.clone()).clone();
    let link = DeviceLink::connect(config.link.clone());
    link.register_listener(|msg| {
        info!("Controller message: {}", msg);
    });

    let loader = SignalLoader::new(decoder, link.clone());

    if !args.signals.is_empty() {
        let mut status = link.status();
        status
            .wait_for(|s| s.state == ConnectionState::Open)
            .await
            .context("Link supervisor stopped")?;

        for path in &args.signals {
            let result = loader.load_and_send_path(path).await;
            if result.is_loaded() {
                info!("{}: {}", path.display(), result.message());
            } else {
                warn!("{}: {}", path.display(), result.message());
            }
        }
    }

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    Ok(())
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` controls filtering; the default is `haptic_link=debug`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "haptic_link=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
