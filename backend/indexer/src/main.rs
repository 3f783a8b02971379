//! Impact project indexer: entry point.
//!
//! Backfills `ProjectRegistry` and `DMRVManager` contract logs from a
//! configured start block, then follows new logs over WebSocket
//! subscriptions, projecting both into SQLite. A small Axum REST API exposes
//! the projection for frontend / admin consumption.

mod abi;
mod api;
mod backfill;
mod chunker;
mod config;
mod db;
mod errors;
mod events;
mod metadata;
mod projector;
mod rpc;
mod status;
mod watcher;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use backfill::{Backfill, BackfillPlan, BackfillReport};
use config::{Config, IndexerMode};
use metadata::HttpMetadataResolver;
use projector::Projector;
use rpc::{JsonRpcSource, LogSource};
use watcher::Watcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    info!(
        mode = ?config.mode,
        registry = %config.contracts.project_registry,
        dmrv = %config.contracts.dmrv_manager,
        "Impact indexer starting"
    );

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // Shared by the RPC source and the metadata resolver.
    let client = Client::builder().timeout(config.rpc_timeout).build()?;

    let source: Arc<dyn LogSource> = Arc::new(JsonRpcSource::new(
        client.clone(),
        config.rpc_url.clone(),
        config.ws_url.clone(),
        config.rpc_max_retries,
    ));
    let resolver = Arc::new(HttpMetadataResolver::new(client, config.ipfs_gateway.clone()));
    let projector = Arc::new(Projector::new(pool.clone(), resolver));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown requested"),
                Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
            }
            cancel.cancel();
        }
    });

    // ─── Backfill ─────────────────────────────────────────
    if config.mode != IndexerMode::Watch {
        let plan = BackfillPlan::new(config.start_block, config.chunk_size, config.contracts);
        let backfill = Backfill::new(source.clone(), projector.clone(), plan, cancel.clone());
        run_backfill(&backfill, config.mode).await?;

        if config.mode == IndexerMode::Backfill || cancel.is_cancelled() {
            return Ok(());
        }
    }

    // ─── Live watcher ─────────────────────────────────────
    let watcher = Watcher::new(source, projector, config.contracts, cancel.clone());
    let watcher_task = tokio::spawn(watcher.run());

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(api::ApiState { pool }));

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await;

    // The server only returns on shutdown or error; stop the watcher either way.
    cancel.cancel();
    let delivered = watcher_task.await?;
    info!(?delivered, "Indexer stopped");
    Ok(served?)
}

/// Run the backfill and log its report.
///
/// Losing the chain head is only fatal when the backfill is all this process
/// does; otherwise the live stages still start.
async fn run_backfill(
    backfill: &Backfill,
    mode: IndexerMode,
) -> anyhow::Result<Option<BackfillReport>> {
    match backfill.run().await {
        Ok(report) => {
            let gaps = report.gaps().count();
            if gaps > 0 {
                warn!(gaps, "Backfill finished with unfetched chunks");
            }
            info!(head = report.head, cancelled = report.cancelled, "Backfill done");
            Ok(Some(report))
        }
        Err(e) if mode == IndexerMode::Backfill => Err(e.into()),
        Err(e) => {
            error!("Backfill aborted, continuing with live indexing: {e}");
            Ok(None)
        }
    }
}
