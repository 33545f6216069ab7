use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

use chatpace::chat::loopback::LoopbackTransport;
use chatpace::chat::ChatTransport;
use chatpace::config::Config;
use chatpace::connection::ConnectionManager;
use chatpace::delivery::DeliveryListener;
use chatpace::dispatch::Dispatcher;
use chatpace::events::EventBus;
use chatpace::gateway::{self, AppState};
use chatpace::jobs::JobRuntime;
use chatpace::ratelimit::{ist_day_bounds, RateLimiter};
use chatpace::retention;
use chatpace::service::SchedulingService;
use chatpace::store::Store;
use chatpace::vault::CredentialVault;

/// chatpace — conservative chat scheduling and dispatch for a single
/// account.
#[derive(Parser, Debug)]
#[command(name = "chatpace")]
#[command(version)]
#[command(about = "Schedule and pace outgoing chat messages", long_about = None)]
struct Cli {
    /// Path to config.toml (its directory doubles as the data directory).
    #[arg(long, default_value = "chatpace.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the service: job runtime, dispatcher, socket manager, gateway.
    Serve {
        /// Override the configured bind host.
        #[arg(long)]
        host: Option<String>,
        /// Override the configured bind port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print a snapshot of today's capacity and queue depth.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Status => status(&config),
    }
}

async fn serve(config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    let store = Store::open(&config.db_path())?;
    let vault = CredentialVault::load_or_create(&config.vault_key_path())?;

    // The bus exists before any producer so nothing is wired up late.
    let bus = EventBus::new();
    let limiter = RateLimiter::new(
        store.clone(),
        bus.clone(),
        config.rate_limit.daily_cap,
        config.rate_limit.warn_pct,
    );
    let runtime = JobRuntime::new(store.clone());

    let transport = build_transport(&config.transport.kind)?;
    let connection = ConnectionManager::new(
        transport,
        store.clone(),
        vault,
        bus.clone(),
        config.connection.clone(),
    );
    DeliveryListener::new(store.clone(), bus.clone()).install(&connection);

    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(store.clone()),
        limiter.clone(),
        connection.clone(),
        runtime.clone(),
        bus.clone(),
        config.pacing.clone(),
        config.retention.retention_days,
    );
    retention::register(&runtime, config.retention.retention_days)?;

    let service = SchedulingService::new(
        store.clone(),
        Arc::new(store.clone()),
        limiter.clone(),
        runtime.clone(),
        config.recurrence.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = tokio::spawn({
        let runtime = runtime.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { runtime.run(dispatcher, shutdown_rx).await }
    });
    let socket_loop = tokio::spawn(connection.clone().run(shutdown_rx.clone()));

    let state = AppState {
        service,
        limiter,
        bus,
        connection,
    };
    let bind_host = host.unwrap_or_else(|| config.gateway.host.clone());
    let bind_port = port.unwrap_or(config.gateway.port);

    tokio::select! {
        result = gateway::run(&bind_host, bind_port, state) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    // Drain the consumer before anything it depends on goes away.
    shutdown_tx.send(true).ok();
    consumer.await.ok();
    socket_loop.await.ok();
    Ok(())
}

fn build_transport(kind: &str) -> Result<Arc<dyn ChatTransport>> {
    match kind {
        "loopback" => Ok(Arc::new(LoopbackTransport::new())),
        other => anyhow::bail!(
            "Unknown transport '{other}'. The built-in transport is 'loopback'; \
             wire adapters register their own kind."
        ),
    }
}

fn status(config: &Config) -> Result<()> {
    let store = Store::open(&config.db_path()).context("Is the data directory initialized?")?;
    let (start, end) = ist_day_bounds(chrono::Utc::now());
    let sent_today = store.count_terminal_success_in(start, end)?;
    let cap = config.rate_limit.daily_cap;

    let pending: u32 = store.with_conn(|conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM intents WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?)
    })?;
    let queued_jobs: u32 = store.with_conn(|conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'queued'",
            [],
            |row| row.get(0),
        )?)
    })?;

    println!("chatpace status");
    println!("  sent today : {sent_today}/{cap}");
    println!("  remaining  : {}", cap.saturating_sub(sent_today));
    println!("  resets at  : {}", end.to_rfc3339());
    println!("  pending    : {pending} intent(s)");
    println!("  queued jobs: {queued_jobs}");
    Ok(())
}
