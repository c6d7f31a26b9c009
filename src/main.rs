//! Music Assistant session client - Main Entry Point

use clap::{Parser, Subcommand};
use ma_session::observability::init_default_logging;
use ma_session::protocol::{MediaEvent, ServerEvent};
use ma_session::session::{ConnectionState, ControlHandle, MediaHandle};
use ma_session::transport::WebSocketConnector;
use ma_session::{ControlProtocol, MediaProtocol, SessionConfig, SessionEngine, SessionError};
use serde_json::Value;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, trace, warn, Instrument};

/// Resilient session client for Music Assistant servers
#[derive(Parser)]
#[command(name = "ma-session")]
#[command(about = "Keep control and media sessions to a Music Assistant server alive")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MA_SESSION_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and stay connected, logging server events
    Run,
    /// Send one command and print its result as JSON
    Call {
        /// Command name, e.g. `players/all`
        command: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    debug!("Starting ma-session v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_sessions(config).await,
        Commands::Call { command, args } => call_command(config, &command, &args).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(SessionConfig::load_from_file(path)?);
    }

    for path_str in ["ma-session.toml", "config/ma-session.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(SessionConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create ma-session.toml".into())
}

async fn run_sessions(config: SessionConfig) -> Result<(), Box<dyn std::error::Error>> {
    let engine_config = config.engine_config();
    let target = config.target()?;

    let control = SessionEngine::spawn(
        ControlProtocol::new(),
        WebSocketConnector::new(),
        engine_config.clone(),
    );
    let media = config.client_hello().map(|hello| {
        SessionEngine::spawn(
            MediaProtocol::new(hello),
            WebSocketConnector::new(),
            engine_config.clone(),
        )
    });

    tokio::spawn(log_control_events(control.subscribe()));
    if let Some(media) = &media {
        tokio::spawn(log_media_events(media.subscribe()));
    }

    async {
        control.connect(target.clone()).await?;
        if let Some(media) = &media {
            media.connect(target).await?;
        }
        Ok::<_, SessionError>(())
    }
    .instrument(ma_session::lifecycle_span!(event = "startup"))
    .await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sigusr1 = signal::unix::signal(signal::unix::SignalKind::user_defined1())?;

    info!("Session client running");

    let outcome = loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break Ok(());
            }
            _ = sigusr1.recv() => {
                info!("Received SIGUSR1, checking sessions");
                reconnect_all(&control, media.as_ref()).await;
            }
            error = wait_for_terminal(&control) => {
                error!(error = %error, "Control session stopped permanently");
                break Err(error);
            }
        }
    };

    async {
        log_metrics(&control, media.as_ref());
        if let Some(media) = &media {
            media.shutdown().await?;
        }
        control.shutdown().await?;
        info!("Session client stopped");
        Ok::<_, SessionError>(())
    }
    .instrument(ma_session::lifecycle_span!(event = "shutdown"))
    .await?;

    outcome.map_err(Into::into)
}

async fn reconnect_all(control: &ControlHandle, media: Option<&MediaHandle>) {
    match control.reconnect_if_needed().await {
        Ok(started) => debug!(started, "Control reconnect check"),
        Err(e) => warn!(error = %e, "Control reconnect check failed"),
    }
    if let Some(media) = media {
        match media.reconnect_if_needed().await {
            Ok(started) => debug!(started, "Media reconnect check"),
            Err(e) => warn!(error = %e, "Media reconnect check failed"),
        }
    }
}

/// Resolves once the engine gave up on its own
async fn wait_for_terminal(handle: &ControlHandle) -> SessionError {
    let mut state = handle.watch_state();
    loop {
        let is_error = matches!(*state.borrow_and_update(), ConnectionState::Error(_));
        if is_error {
            if let Some(error) = handle.terminal_error() {
                return error;
            }
        }
        if state.changed().await.is_err() {
            return SessionError::EngineStopped;
        }
    }
}

async fn call_command(
    config: SessionConfig,
    command: &str,
    args: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let args: Value = serde_json::from_str(args)?;
    let engine_config = config.engine_config();
    let wait = engine_config.hello_timeout + engine_config.request_timeout;

    let control = SessionEngine::spawn(
        ControlProtocol::new(),
        WebSocketConnector::new(),
        engine_config,
    );
    control.connect(config.target()?).await?;

    let result = async {
        control.wait_connected(wait).await?;
        control.call(command, args).await
    }
    .await;

    control.shutdown().await?;
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

fn handle_config_command(
    config: &SessionConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn log_control_events(mut events: broadcast::Receiver<ServerEvent>) {
    loop {
        match events.recv().await {
            Ok(ServerEvent::Error { code, details }) => {
                warn!(code, details = %details, "Server error event")
            }
            Ok(event) => info!(event = event.name(), "Server event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Control event subscriber lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_media_events(mut events: broadcast::Receiver<MediaEvent>) {
    loop {
        match events.recv().await {
            Ok(MediaEvent::Connected(server)) => {
                info!(server_id = %server.server_id, "Media session connected")
            }
            Ok(MediaEvent::StreamStart(format)) => info!(
                codec = %format.format.codec,
                sample_rate = format.format.sample_rate,
                "Stream started"
            ),
            Ok(MediaEvent::StreamEnd) => info!("Stream ended"),
            Ok(MediaEvent::AudioChunk { timestamp_us, data }) => {
                trace!(timestamp_us, bytes = data.len(), "Audio chunk")
            }
            Ok(MediaEvent::Error { message }) => warn!(message = %message, "Media error event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Media event subscriber lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_metrics(control: &ControlHandle, media: Option<&MediaHandle>) {
    let snapshots = std::iter::once(control.metrics()).chain(media.map(|m| m.metrics()));
    for snapshot in snapshots {
        match serde_json::to_string(&snapshot) {
            Ok(json) => info!(channel = %snapshot.channel, metrics = %json, "Session metrics"),
            Err(e) => warn!(error = %e, "Failed to serialize metrics"),
        }
    }
}
