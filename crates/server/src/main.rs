//! Arbor Server
//!
//! Worktree status for every project, pushed live over WebSocket.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use arbor::config::Args;
use arbor::distributor::{router, spawn_refresh_timer};
use arbor::engine::SnapshotEngine;
use arbor::git::{GitInspector, RepositoryInspector};
use arbor::github::GhClient;
use arbor::persistence::{create_persistence_channel, load_pr_cache, PersistenceWriter};
use arbor::pr_cache::PrCache;
use arbor::tmux::TmuxMultiplexer;
use arbor::watcher::run_watcher;
use arbor::{logging, paths};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let data_dir = paths::init_data_dir(args.data_dir.as_deref())?;
    paths::ensure_dirs()?;
    let logging = logging::init_logging(&paths::log_dir())?;

    let git_config = args.git_config()?;
    let engine_config = args.engine_config();
    let distributor_config = args.distributor_config(&git_config);

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %data_dir.display(),
        projects_root = %git_config.projects_root.display(),
        worktrees_root = %git_config.worktrees_root.display(),
        "Starting Arbor server"
    );

    let inspector: Arc<dyn RepositoryInspector> = Arc::new(GitInspector::new(git_config));
    let multiplexer = Arc::new(TmuxMultiplexer::new(args.command_timeout()));
    let review = Arc::new(GhClient::new(args.network_timeout()));

    // Create persistence channel and spawn writer
    let db_path = paths::db_path();
    let cached = match load_pr_cache(&db_path) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(
                component = "server",
                event = "server.pr_cache.load_failed",
                db_path = %db_path.display(),
                error = %err,
                "Starting with an empty PR cache"
            );
            Vec::new()
        }
    };
    let (persist_tx, persist_rx) = create_persistence_channel();
    tokio::spawn(PersistenceWriter::new(persist_rx, db_path).run());

    let pr_cache = PrCache::new(inspector.clone()).with_persistence(persist_tx);
    info!(
        component = "server",
        event = "server.pr_cache.loaded",
        entries = cached.len(),
    );
    pr_cache.load(cached);

    let engine = Arc::new(
        SnapshotEngine::new(inspector, multiplexer, review, engine_config).with_pr_cache(pr_cache),
    );

    spawn_refresh_timer(engine.clone(), distributor_config.refresh_interval);

    let watcher_engine = engine.clone();
    let watch_roots = distributor_config.watch_roots.clone();
    let debounce = distributor_config.debounce;
    tokio::spawn(async move {
        if let Err(err) = run_watcher(watcher_engine, watch_roots, debounce).await {
            warn!(
                component = "watcher",
                event = "watcher.failed",
                error = %err,
                "Filesystem watcher stopped; timer refreshes continue"
            );
        }
    });

    let app = router(engine, &distributor_config.ws_path);
    let addr = distributor_config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        component = "server",
        event = "server.listening",
        addr = %addr,
        ws_path = %distributor_config.ws_path,
        "Listening on {}",
        addr
    );
    eprintln!(
        "arbor listening on ws://{addr}{} (logs: {})",
        distributor_config.ws_path,
        paths::log_dir().display()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(component = "server", event = "server.stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
