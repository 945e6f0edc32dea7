use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webcall::call::{invite_url, CallCoordinator, CallState, CoordinatorConfig};
use webcall::config::{AppConfig, ConfigStore};
use webcall::events::EventBus;
use webcall::store::{CallId, MemorySessionStore, SessionStore, SqliteSessionStore};
use webcall::webrtc::{RtcEngine, StaticMediaSource};
use webcall::AppError;

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

/// webcall command line arguments
#[derive(Parser, Debug)]
#[command(name = "webcall")]
#[command(version, about = "Two-party WebRTC calls over a shared signaling store", long_about = None)]
struct CliArgs {
    /// Data directory path (default: ~/.local/share/webcall)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Invitation origin (overrides database config)
    #[arg(long, value_name = "URL")]
    origin: Option<String>,

    /// STUN server URL, repeatable (overrides database config)
    #[arg(long = "stun", value_name = "URL")]
    stun_servers: Vec<String>,

    /// Persist --origin and --stun to the database config
    #[arg(long)]
    save: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a call and wait for a responder
    Create,
    /// Join an existing call
    Join {
        /// Call identifier from the invitation link
        call_id: String,
    },
    /// Run both peers in-process against an in-memory store
    Loopback {
        /// Seconds to wait for both peers to connect
        #[arg(long, default_value_t = 15)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting webcall v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    // One database file holds configuration and signaling state
    let db_path = data_dir.join("webcall.db");
    let config_store = ConfigStore::new(&db_path).await?;
    let origin = args.origin;
    let stun_servers = args.stun_servers;
    let apply_overrides = |config: &mut AppConfig| {
        if let Some(origin) = &origin {
            config.invite.origin = origin.clone();
        }
        if !stun_servers.is_empty() {
            config.webrtc.stun_servers = stun_servers.clone();
        }
    };

    let config = if args.save {
        config_store.update(apply_overrides).await?;
        tracing::info!("CLI overrides saved to {}", db_path.display());
        (*config_store.get()).clone()
    } else {
        let mut config = (*config_store.get()).clone();
        apply_overrides(&mut config);
        config
    };

    let events = Arc::new(EventBus::new());
    spawn_event_logger(&events);

    let engine = Arc::new(RtcEngine::new()?);
    let media = Arc::new(StaticMediaSource::default());
    let coordinator_config = CoordinatorConfig::from(&config);

    match args.command {
        Command::Create => {
            let store = SqliteSessionStore::new(
                config_store.pool().clone(),
                config.store.poll_interval(),
            )
            .await?;
            let coordinator = CallCoordinator::new(
                Arc::new(store),
                engine,
                media,
                coordinator_config,
                events,
            );

            let call_id = coordinator.create_call().await?;
            println!("Call ID: {}", call_id);
            println!("Invite:  {}", invite_url(&config.invite.origin, &call_id));
            run_until_closed(&coordinator).await?;
        }
        Command::Join { call_id } => {
            let store = SqliteSessionStore::new(
                config_store.pool().clone(),
                config.store.poll_interval(),
            )
            .await?;
            let coordinator = CallCoordinator::new(
                Arc::new(store),
                engine,
                media,
                coordinator_config,
                events,
            );

            coordinator.join_call(&CallId::from(call_id)).await?;
            run_until_closed(&coordinator).await?;
        }
        Command::Loopback { timeout } => {
            let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
            let initiator = CallCoordinator::new(
                store.clone(),
                engine.clone(),
                media.clone(),
                coordinator_config.clone(),
                events.clone(),
            );
            let responder =
                CallCoordinator::new(store, engine, media, coordinator_config, events);

            let call_id = initiator.create_call().await?;
            tracing::info!("Loopback call {} created", call_id);
            responder.join_call(&call_id).await?;

            let connected = tokio::time::timeout(Duration::from_secs(timeout), async {
                wait_for_state(&initiator, CallState::Connected).await;
                wait_for_state(&responder, CallState::Connected).await;
            })
            .await;
            match connected {
                Ok(()) => tracing::info!("Loopback call {} connected", call_id),
                Err(_) => tracing::warn!("Loopback call {} did not connect in {}s", call_id, timeout),
            }

            hang_up(&responder).await;
            hang_up(&initiator).await;
        }
    }

    tracing::info!("webcall shutdown complete");
    Ok(())
}

/// Wait for the call to close or for Ctrl+C, then hang up
async fn run_until_closed(coordinator: &CallCoordinator) -> anyhow::Result<()> {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received, hanging up");
        }
        _ = wait_for_state(coordinator, CallState::Closed) => {
            tracing::info!("Call ended");
        }
    }

    hang_up(coordinator).await;
    Ok(())
}

async fn wait_for_state(coordinator: &CallCoordinator, target: CallState) {
    let mut state = coordinator.state_watch();
    loop {
        if *state.borrow_and_update() == target {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

async fn hang_up(coordinator: &CallCoordinator) {
    match coordinator.hang_up().await {
        Ok(()) => {}
        Err(AppError::Teardown { failed, attempted }) => {
            tracing::warn!("Call state left behind: {} of {} deletions failed", failed, attempted)
        }
        Err(e) => tracing::error!("Hang up failed: {}", e),
    }
}

fn spawn_event_logger(events: &Arc<EventBus>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::debug!("event {}: {}", event.event_name(), json),
                    Err(e) => tracing::warn!("Failed to serialize event: {}", e),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event logger lagged by {} events", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Initialize logging with CLI arguments
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "webcall=error,webrtc=error",
        LogLevel::Warn => "webcall=warn,webrtc=warn",
        LogLevel::Info => "webcall=info,webrtc=warn",
        LogLevel::Verbose => "webcall=debug,webrtc=warn",
        LogLevel::Debug => "webcall=debug,webrtc=info",
        LogLevel::Trace => "webcall=trace,webrtc=debug",
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
    if let Ok(path) = std::env::var("WEBCALL_DATA_DIR") {
        return PathBuf::from(path);
    }

    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local/share/webcall"),
        Err(_) => PathBuf::from("webcall-data"),
    }
}
