use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use qm_domain::config::{Config, ConfigSeverity};
use qm_orchestrator::cli::{Cli, Command};
use qm_orchestrator::dispatcher::Dispatcher;
use qm_orchestrator::launcher::{self, TaskLauncher};
use qm_orchestrator::state::AppState;
use qm_orchestrator::worker;
use qm_store::MemoryStore;
use qm_webhooks::DeliveryWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error)
    {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }
    let config = Arc::new(config);

    match cli.command {
        Command::ServeApi => serve_api(config).await,
        Command::RunDispatcher => run_dispatcher(config).await,
        Command::RunWorker { bot_id } => {
            let state = AppState::build(config)?;
            worker::run_worker(state, &bot_id)
                .await
                .context("running worker")
        }
        Command::RunWebhookDelivery => run_webhook_delivery(config).await,
        Command::Migrate => migrate(config),
    }
}

/// Structured JSON logs; `RUST_LOG` overrides the default filter.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

async fn serve_api(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("quorum API starting");
    let state = AppState::build(config.clone())?;
    let cancel = CancellationToken::new();

    // ── Embedded dispatcher (dev mode) ───────────────────────────────
    if config.server.embedded_dispatcher {
        let dispatcher = Arc::new(Dispatcher::new(
            state.clone(),
            Arc::new(TaskLauncher::new(state.clone())),
        ));
        tokio::spawn(dispatcher.run(cancel.clone()));
        tracing::info!("embedded dispatcher running (in-process workers)");
    }

    // ── Delivery workers ─────────────────────────────────────────────
    for _ in 0..config.webhooks.workers {
        let worker = DeliveryWorker::new(state.store.clone(), config.webhooks.clone())?;
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await });
    }
    tracing::info!(workers = config.webhooks.workers, "webhook delivery workers running");

    // ── HTTP ─────────────────────────────────────────────────────────
    let app = qm_orchestrator::api::router(state);
    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    tracing::info!(address = %address, "API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
        .context("serving API")
}

async fn run_dispatcher(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("quorum dispatcher starting");
    let state = AppState::build(config.clone())?;
    let launcher = launcher::from_config(&config.dispatcher.launcher);
    let dispatcher = Arc::new(Dispatcher::new(state, launcher));

    let cancel = CancellationToken::new();
    let run = tokio::spawn(dispatcher.run(cancel.clone()));
    shutdown_signal(cancel).await;
    run.await.context("dispatcher task")?;
    Ok(())
}

async fn run_webhook_delivery(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!(workers = config.webhooks.workers, "webhook delivery starting");
    let state = AppState::build(config.clone())?;
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();
    for _ in 0..config.webhooks.workers.max(1) {
        let worker = DeliveryWorker::new(state.store.clone(), config.webhooks.clone())?;
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { worker.run(cancel).await }));
    }
    shutdown_signal(cancel).await;
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// Validate configuration and prepare the on-disk layout.
fn migrate(config: Arc<Config>) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.worker.scratch_dir)
        .with_context(|| format!("creating {}", config.worker.scratch_dir.display()))?;
    let event_dir = config.worker.scratch_dir.join("events");
    let _ = MemoryStore::with_event_log(&event_dir).context("preparing event log")?;
    tracing::info!(
        scratch = %config.worker.scratch_dir.display(),
        "configuration valid, store layout prepared"
    );
    println!("ok: configuration valid");
    println!("ok: scratch dir {}", config.worker.scratch_dir.display());
    println!("ok: event log dir {}", event_dir.display());
    Ok(())
}

/// Resolves on ctrl-c (or SIGTERM where available) and cancels `cancel`.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
    cancel.cancel();
}
