#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
//! Store maintenance tool.
//!
//! Opens (or creates) the store described by the `BPLUS_*` environment
//! variables, checks both files, optionally repairs leaked space and damaged
//! subtrees, and commits the result.

use bplus::config::StoreConfig;
use bplus::storage::{KeyedChunkStore, StoreError, StoreRecovery};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bplus=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match StoreConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: data_directory={}, fix_errors={}",
        config.data_directory.display(),
        config.fix_errors
    );

    if let Err(e) = std::fs::create_dir_all(&config.data_directory) {
        tracing::error!("Failed to create data directory: {e}");
        std::process::exit(1);
    }

    match check_store(&config) {
        Ok(report) => {
            tracing::info!(
                keys = report.keys,
                tree_nodes = report.tree.nodes_visited,
                tree_free = report.tree.free_buffers,
                tree_reclaimed = report.tree.reclaimed,
                tree_pruned = report.tree.pruned_subtrees,
                heap_chunks = report.heap.chunks,
                heap_released = report.heap.released_chunks.len(),
                "store is consistent"
            );
        }
        Err(e) => {
            tracing::error!("Store check failed: {e}");
            std::process::exit(1);
        }
    }
}

fn check_store(config: &StoreConfig) -> Result<StoreRecovery, StoreError> {
    let index_path = config.index_path();
    let heap_path = config.heap_path();
    let mut store = KeyedChunkStore::open_or_create(&index_path, &heap_path, &config.options())?;
    store.set_footprint_limit(config.footprint_limit)?;

    let report = store.recover(config.fix_errors)?;
    store.commit()?;
    store.shutdown()?;
    Ok(report)
}
