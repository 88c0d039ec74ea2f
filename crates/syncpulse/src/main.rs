mod cli;
mod error;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use syncpulse_api::{DuplexSession, TransportConfig};
use syncpulse_config::RunConfig;
use syncpulse_core::{
    AccessToken, AdminSession, DuplexWorkerFactory, HttpPushTransport, PushWorkerFactory,
    RetryBudget, TestOrchestrator, TickSettings, WorkerFactory, WorkerPool, WsDuplexTransport,
};

use crate::cli::Cli;
use crate::error::CliError;

type DuplexPool = WorkerPool<DuplexWorkerFactory<WsDuplexTransport>>;
type PushPool = WorkerPool<PushWorkerFactory<HttpPushTransport>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    // The report lines are the product; they log at info.
    let filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    tracing::info!(config = %cli.config.display(), "reading config file");
    let mut config = syncpulse_config::load_config(&cli.config)?;

    // CLI flags override the document.
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(secs) = cli.test_interval {
        config.test_interval_secs = secs;
    }
    if let Some(millis) = cli.check_interval {
        config.check_interval_ms = millis;
    }
    if let Some(count) = cli.check_times {
        config.check_times = count;
    }

    let run_config = config.resolve()?;
    let transport = TransportConfig::default();

    // ── Worker pools ─────────────────────────────────────────────────

    tracing::info!(
        mode = %run_config.mode,
        tenants = run_config.user_tokens.len(),
        "starting sync workers"
    );

    let duplex_pool: Option<DuplexPool> = if run_config.mode.duplex_enabled() {
        let store = WsDuplexTransport::new(run_config.store_url.clone(), transport.clone());
        Some(WorkerPool::new(DuplexWorkerFactory::new(store)))
    } else {
        None
    };

    let push_pool: Option<PushPool> = if run_config.mode.stream_enabled() {
        let base = push_base_url(&run_config.store_url)?;
        let store = HttpPushTransport::new(base, &transport)?;
        Some(WorkerPool::new(PushWorkerFactory::new(store)))
    } else {
        None
    };

    if let Err(err) = start_fleet(&duplex_pool, &push_pool, &run_config).await {
        tracing::error!(error = %err, "an error occurred during test set up");
        shutdown_pools(&duplex_pool, &push_pool).await;
        return Err(err);
    }

    // ── Orchestrator ─────────────────────────────────────────────────

    // The privileged session connects now and authenticates lazily on
    // the first tick.
    let session = DuplexSession::connect(&run_config.store_url, &transport).await?;
    let admin = AdminSession::new(session, run_config.master_token.clone());

    let mut views = Vec::new();
    if let Some(pool) = &duplex_pool {
        views.push(pool.view());
    }
    if let Some(pool) = &push_pool {
        views.push(pool.view());
    }

    let settings = TickSettings {
        interval: run_config.test_interval,
        retry: RetryBudget::new(run_config.check_times, run_config.check_interval),
        ..TickSettings::default()
    };

    tracing::info!(
        interval_secs = run_config.test_interval.as_secs(),
        "scheduling updates"
    );
    tracing::info!("------ start test ------");

    let orchestrator = Arc::new(TestOrchestrator::new(admin.clone(), views, settings));
    let cancel = CancellationToken::new();
    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.run(cancel).await })
    };

    wait_for_shutdown_signal().await;
    tracing::info!("shutting down test");

    // Stop every worker (idempotent), cancel the tick scheduler, then
    // release the privileged session.
    shutdown_pools(&duplex_pool, &push_pool).await;
    cancel.cancel();
    let _ = runner.await;
    admin.shutdown().await;

    tracing::info!("test stopped");
    Ok(())
}

// ── Fleet management ────────────────────────────────────────────────

async fn start_fleet(
    duplex_pool: &Option<DuplexPool>,
    push_pool: &Option<PushPool>,
    config: &RunConfig,
) -> Result<(), CliError> {
    if let Some(pool) = duplex_pool {
        start_pool_workers(pool, &config.user_tokens).await?;
    }
    if let Some(pool) = push_pool {
        start_pool_workers(pool, &config.user_tokens).await?;
    }
    Ok(())
}

async fn start_pool_workers<F: WorkerFactory>(
    pool: &WorkerPool<F>,
    tokens: &[AccessToken],
) -> Result<(), CliError> {
    for token in tokens {
        if let Err(err) = pool.start_worker(token.clone()).await {
            tracing::error!(token = %token, transport = %pool.transport(), error = %err, "worker failed to start");
            return Err(err.into());
        }
    }
    Ok(())
}

async fn shutdown_pools(duplex_pool: &Option<DuplexPool>, push_pool: &Option<PushPool>) {
    if let Some(pool) = duplex_pool {
        pool.shutdown().await;
    }
    if let Some(pool) = push_pool {
        pool.shutdown().await;
    }
}

// ── Push endpoint derivation ────────────────────────────────────────

/// The push transport speaks HTTPS against the same host as the duplex
/// session: `wss://…` becomes `https://…`, `ws://…` becomes `http://…`.
fn push_base_url(store_url: &Url) -> Result<Url, CliError> {
    let mut url = store_url.clone();
    let scheme = match url.scheme() {
        "wss" => "https",
        "ws" => "http",
        "http" | "https" => return Ok(url),
        other => {
            return Err(syncpulse_config::ConfigError::Validation {
                field: "store_url".into(),
                reason: format!("unsupported scheme '{other}'"),
            }
            .into());
        }
    };
    if url.set_scheme(scheme).is_err() {
        return Err(syncpulse_config::ConfigError::Validation {
            field: "store_url".into(),
            reason: "cannot derive the push endpoint".into(),
        }
        .into());
    }
    Ok(url)
}

// ── Signals ─────────────────────────────────────────────────────────

/// SIGINT and SIGTERM both trigger a graceful stop.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("process got SIGINT"),
                _ = terminate.recv() => tracing::info!("process got SIGTERM"),
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ── Tests ───────────────────────────────────────────────────────────
