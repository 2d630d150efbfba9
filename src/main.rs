use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qrcast::config::ConfigStore;
use qrcast::events::{EventBus, SessionEvent};
use qrcast::session::{SessionController, SessionHost, SessionState};
use qrcast::video::{CapturePreset, IvfFileSource};
use qrcast::webrtc::WebRtcEngineFactory;
use qrcast::AppError;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// qrcast command line arguments
#[derive(Parser, Debug)]
#[command(name = "qrcast")]
#[command(version, about = "Stream video to a LAN peer with QR/clipboard signaling", long_about = None)]
struct CliArgs {
    /// IVF file with pre-encoded VP8/VP9/AV1 frames
    #[arg(short = 'i', long, value_name = "FILE")]
    input: PathBuf,

    /// Restart the file when it ends
    #[arg(long = "loop")]
    looping: bool,

    /// Capture preset (hd720, hd1080); saved to the config
    #[arg(long, value_name = "PRESET")]
    preset: Option<CapturePreset>,

    /// Frame rate override for this run
    #[arg(long, value_name = "FPS")]
    fps: Option<u32>,

    /// Data directory path (default: ~/.config/qrcast)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting qrcast v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.clone().unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());

    let config_store = ConfigStore::open(&data_dir)
        .await
        .context("failed to open configuration")?;
    if let Some(preset) = args.preset {
        if config_store.get().capture.preset != preset {
            config_store.update(|c| c.capture.preset = preset).await?;
            tracing::info!("Saved capture preset {}", preset);
        }
    }
    let config = config_store.get();

    let events = Arc::new(EventBus::new());
    let factory = Arc::new(WebRtcEngineFactory::new(config.webrtc.clone()));
    let controller =
        SessionController::new(factory, events.clone(), config.session.event_queue_capacity);

    let host = SessionHost::new(events);
    host.bind(controller);
    host.apply_settings(&config.capture);
    if args.fps.is_some() {
        host.set_framerate(args.fps);
    }

    let source = IvfFileSource::open(&args.input, args.looping)
        .await
        .with_context(|| format!("failed to open {}", args.input.display()))?;

    let mut status = host.subscribe_status();
    let mut states = host.observe_state();
    let session_id = host.start(Box::new(source))?;
    tracing::info!(
        "Session {} started ({})",
        session_id,
        host.capture_config()?
    );

    let result = run(&host, &mut states, &mut status).await;

    host.shutdown().await;
    tracing::info!("qrcast stopped");
    result
}

/// Print the offer, feed pasted answers to the host and render status
/// until the session ends or Ctrl+C
async fn run(
    host: &SessionHost,
    states: &mut tokio::sync::watch::Receiver<qrcast::session::Session>,
    status: &mut broadcast::Receiver<SessionEvent>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut offer_printed = false;
    // Answers copied from a terminal may arrive wrapped over several lines
    let mut pending = String::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let session = states.borrow_and_update().clone();
                match session.state {
                    SessionState::WaitingAnswer if !offer_printed => {
                        if let Some(offer) = session.local_offer {
                            print_offer(&offer);
                            offer_printed = true;
                        }
                    }
                    SessionState::Error => {
                        let reason = session
                            .last_error
                            .unwrap_or_else(|| "unknown error".to_string());
                        return Err(anyhow!("session {} failed: {}", session.id, reason));
                    }
                    SessionState::Stopped => return Ok(()),
                    _ => {}
                }
            }
            event = status.recv() => match event {
                Ok(event) => render_status(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} status events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        if !pending.is_empty() {
                            tracing::warn!("Discarding incomplete answer");
                            pending.clear();
                        }
                        continue;
                    }
                    pending.push_str(line);
                    match host.apply_answer(&pending) {
                        Ok(()) => pending.clear(),
                        Err(AppError::DecodeError(_)) => {
                            eprintln!("Answer incomplete or invalid: paste the rest, or an empty line to start over");
                        }
                        Err(e) => {
                            eprintln!("Answer rejected: {}", e);
                            pending.clear();
                        }
                    }
                }
                Ok(None) => {
                    tracing::info!("stdin closed, press Ctrl+C to stop");
                    stdin_open = false;
                }
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            _ = &mut ctrl_c => {
                tracing::info!("Shutdown signal received");
                return Ok(());
            }
        }
    }
}

fn print_offer(offer: &str) {
    println!();
    println!("=== OFFER: show as QR code or copy to the receiver ===");
    println!("{}", offer);
    println!("=== Paste the receiver's ANSWER and press Enter ===");
}

fn render_status(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged {
            session_id,
            state,
            status,
        } => tracing::info!(target: "qrcast::status", "[{}] {} ({})", session_id, status, state),
        SessionEvent::Notice {
            session_id,
            message,
        } => tracing::info!(target: "qrcast::status", "[{}] {}", session_id, message),
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "qrcast=error,webrtc=error",
        LogLevel::Warn => "qrcast=warn,webrtc=warn",
        LogLevel::Info => "qrcast=info,webrtc=warn",
        LogLevel::Verbose => "qrcast=debug,webrtc=warn",
        LogLevel::Debug => "qrcast=debug,webrtc=info",
        LogLevel::Trace => "qrcast=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("QRCAST_DATA_DIR") {
        return PathBuf::from(path);
    }

    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".config").join("qrcast"),
        Err(_) => PathBuf::from(".qrcast"),
    }
}
