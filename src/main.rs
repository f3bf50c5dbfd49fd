//! canaryd daemon entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Parse CLI flags
//!   3. Load config (file or environment)
//!   4. Init logger
//!   5. Open the store, start the notifier and (unless --web) the engine
//!   6. Serve HTTP (unless --background)

use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use canaryd::config;
use canaryd::engine::{DeadlineEngine, EngineHandle};
use canaryd::error::AppError;
use canaryd::lifecycle::CanaryService;
use canaryd::logger;
use canaryd::notify::{EmailNotifier, Notifier, SmtpSettings};
use canaryd::server::{self, ApiState};
use canaryd::store::Store;
use canaryd::store::sqlite::SqliteStore;

#[derive(Parser)]
#[command(name = "canaryd", about = "Dead-man's-switch monitor daemon", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<String>,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Serve HTTP requests but do no background tasks such as
    /// notifications of late canaries.
    #[arg(long, conflicts_with = "background")]
    web: bool,

    /// Do background tasks but do not serve HTTP requests.
    #[arg(long)]
    background: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<(), AppError> {
    // .env is optional; ignore a missing file.
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    let mut config = config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }

    let _log_guard = logger::init(&config.log_level, &config.logging)?;
    info!(db = %config.db_path.display(), "starting canaryd");

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.db_path)?);
    let notifier: Arc<dyn Notifier> = Arc::new(EmailNotifier::start(SmtpSettings {
        sender: config.email.sender.clone(),
        host: config.email.host.clone(),
        port: config.email.port,
        username: config.email.username.clone(),
        password: config.email.password.clone(),
    }));

    let shutdown = CancellationToken::new();

    // The engine arms itself from persisted deadlines as soon as it spawns.
    let engine = if args.web {
        EngineHandle::disconnected()
    } else {
        DeadlineEngine::spawn(store.clone(), notifier.clone(), shutdown.clone())
    };
    let service = Arc::new(CanaryService::new(store, notifier, engine));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    if args.background {
        shutdown.cancelled().await;
        return Ok(());
    }

    match &config.auth_key {
        Some(_) => info!("server authentication enabled"),
        None => warn!("server authentication DISABLED"),
    }

    let app = server::router(ApiState { service, auth_key: config.auth_key.clone() });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
