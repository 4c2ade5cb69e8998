use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loqa_live::{Config, DeviceFactory, GeminiLiveConnector, Phase, SessionController};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "loqa-live", version, about = "Real-time voice conversation with a Live model")]
struct Cli {
    /// Configuration file (extension optional)
    #[arg(long, default_value = "config/loqa-live")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Talk through the system microphone and speaker until Ctrl-C
    Talk,
    /// Serve the HTTP control API
    Serve {
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loqa_live=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::load(&cli.config)?;

    info!("Loqa Live v{}", env!("CARGO_PKG_VERSION"));
    info!("Model: {} (voice {})", cfg.live.model, cfg.live.voice);
    if cfg.live.api_key.is_none() {
        warn!("No API key configured; set GEMINI_API_KEY or live.api_key");
    }

    match cli.command {
        Command::Talk => talk(&cfg).await,
        Command::Serve { port } => {
            if let Some(port) = port {
                cfg.http.port = port;
            }
            serve(&cfg).await
        }
    }
}

#[cfg(feature = "cpal-audio")]
fn system_devices() -> Result<Arc<dyn DeviceFactory>> {
    Ok(Arc::new(loqa_live::CpalDeviceFactory::new()))
}

#[cfg(not(feature = "cpal-audio"))]
fn system_devices() -> Result<Arc<dyn DeviceFactory>> {
    anyhow::bail!("built without the cpal-audio feature; no system audio devices available")
}

fn controller(cfg: &Config) -> Result<SessionController> {
    Ok(SessionController::new(
        cfg.session_config(),
        Arc::new(GeminiLiveConnector::new()),
        system_devices()?,
    ))
}

async fn talk(cfg: &Config) -> Result<()> {
    let mut controller = controller(cfg)?;
    let mut status = controller.subscribe();

    tokio::select! {
        result = controller.connect() => result.context("Failed to start live session")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted while connecting");
            return Ok(());
        }
    }

    info!("Live session running, press Ctrl-C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
        _ = status.wait_for(|s| s.phase == Phase::Idle) => {
            warn!("Live session ended by the remote side");
        }
    }

    if let Some(stats) = controller.disconnect().await {
        info!(
            "Session {} lasted {:.1}s: {} frames sent, {} chunks played, {} interruptions",
            stats.session_id,
            stats.duration_secs,
            stats.counters.frames_sent,
            stats.counters.chunks_scheduled,
            stats.counters.interruptions
        );
    }

    if let Some(error) = controller.snapshot().last_error {
        warn!("Last error: {}", error);
    }

    Ok(())
}

async fn serve(cfg: &Config) -> Result<()> {
    let state = loqa_live::AppState::new(controller(cfg)?);
    let controller = Arc::clone(&state.controller);
    let app = loqa_live::create_router(state);

    let addr = cfg.http_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP control API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down HTTP server");
        })
        .await
        .context("HTTP server failed")?;

    // Release the microphone and speaker before exiting
    controller.lock().await.disconnect().await;
    Ok(())
}
