pub mod cli;
pub mod config;
pub mod index;
pub mod storage;

use std::sync::Arc;

use anyhow::Context;
use dimse::{AssociationListener, EchoHandler, FindHandler, ServiceRegistry, StoreHandler};
use tracing_subscriber::{self, prelude::*, EnvFilter};

use crate::config::{Config, LoggingConfig};
use crate::index::FolderIndex;
use crate::storage::FilesystemStorage;

/// Install the global subscriber; `RUST_LOG` overrides the configured level
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.log_to_file {
        let stdout_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true);
        let file = std::fs::File::create(&config.log_file_path)
            .with_context(|| format!("creating log file '{}'", config.log_file_path))?;
        let file_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_writer(Arc::new(file));

        tracing_subscriber::registry()
            .with(filter)
            .with(file_appender)
            .with(stdout_appender)
            .try_init()?;
    } else {
        let stdout_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_appender)
            .try_init()?;
    }
    Ok(())
}

/// Services a node offers: verification, query over the archive and storage into it
pub fn build_registry(storage: &FilesystemStorage) -> dimse::Result<ServiceRegistry> {
    let index = FolderIndex::new(storage.base_path());
    Ok(ServiceRegistry::builder()
        .register(EchoHandler)?
        .register(FindHandler::new(Arc::new(index)))?
        .register(StoreHandler::new(Arc::new(storage.clone())))?
        .build())
}

/// Run the listener until Ctrl-C or a peer-requested shutdown
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let storage = FilesystemStorage::new(&config.storage.path)?;
    let registry = build_registry(&storage)?;
    let listener = AssociationListener::new(config.node, registry)?;

    let addr = listener.start().await?;
    tracing::info!("🚀 DICOM node listening on {} (archive: {})", addr, storage.base_path().display());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for Ctrl-C")?;
            tracing::info!("Interrupted, shutting down");
        }
        _ = listener.stopped() => {
            if listener.shutdown_requested() {
                tracing::info!("Shutdown requested by a peer");
            }
        }
    }

    listener.stop();
    listener.join().await;
    Ok(())
}
