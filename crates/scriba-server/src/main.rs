// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The scriba server binary: composition root and HTTP entry point.

use anyhow::{Context, Result};
use clap::Parser;
use scriba_catalog::Catalog;
use scriba_config::{QueueBackend, load_config};
use scriba_engine::{EngineCache, StubFactory};
use scriba_live::{LiveConfig, LiveSessionManager};
use scriba_server::auth::AuthKeys;
use scriba_server::{ApiMetrics, AppState, build_app};
use scriba_worker::{TranscribeRunner, WorkerContext, run_broker_worker};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scriba-server", version, about = "Transcription job service")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the bind address from the config.
    #[arg(long)]
    bind: Option<String>,

    /// Also run a broker worker loop inside this process.
    #[arg(long)]
    embedded_worker: bool,

    /// Enable request/decode debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref()).context("load configuration")?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let filter = if args.debug {
        EnvFilter::new("scriba=debug")
    } else {
        EnvFilter::new(format!("scriba={}", config.log_level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let warnings = config.validate().context("validate configuration")?;
    for warning in &warnings {
        warn!(%warning, "configuration warning");
    }

    let config = Arc::new(config);
    let catalog = Catalog::connect(&config.database_url)
        .await
        .context("connect catalog")?;
    let store = scriba_store::from_config(&config);
    let engines = Arc::new(EngineCache::new(Arc::new(StubFactory)));

    let worker_ctx = WorkerContext {
        catalog: catalog.clone(),
        store: store.clone(),
        engines: engines.clone(),
        config: config.clone(),
    };
    let runner = Arc::new(TranscribeRunner::new(worker_ctx.clone()));
    let queue = scriba_queue::select_queue(&config, runner)
        .await
        .context("select queue backend")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if args.embedded_worker && config.queue_backend != QueueBackend::Memory {
        match scriba_queue::BrokerQueue::connect(&config.broker_url).await {
            Ok(broker) => {
                tokio::spawn(run_broker_worker(
                    worker_ctx.clone(),
                    Arc::new(broker),
                    shutdown_rx.clone(),
                ));
            }
            Err(err) => warn!(error = %err, "embedded worker skipped, broker unreachable"),
        }
    }

    let live = Arc::new(LiveSessionManager::new(
        LiveConfig::from_config(&config),
        config.clone(),
        catalog.clone(),
        store.clone(),
        engines.clone(),
    ));

    let state = Arc::new(AppState {
        auth: AuthKeys::new(&config.jwt_secret, config.jwt_expiration_minutes),
        config: config.clone(),
        catalog,
        store,
        queue,
        engines,
        live,
        metrics: Arc::new(ApiMetrics::new()),
    });

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    info!(bind = %config.bind, "scriba-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("serve")
}
