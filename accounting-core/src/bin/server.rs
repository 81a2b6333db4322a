//! Accounting server binary
//!
//! Usage: `accounting-server [config.toml]`. Without a path the defaults are
//! used; `ACCOUNTING_*` environment variables override either.

use accounting_core::catalog::StaticCatalog;
use accounting_core::{spawn_accounting_actor, Collaborators, Config, Storage};
use anyhow::Context;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("reading config {}", path))?
            .with_env_overrides()?,
        None => Config::from_env()?,
    };

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        "Starting accounting server"
    );

    let catalog = match &config.catalog_path {
        Some(path) => StaticCatalog::from_file(path)
            .with_context(|| format!("reading catalog {}", path.display()))?,
        None => {
            tracing::warn!("No catalog configured, every product lookup will miss");
            StaticCatalog::new()
        }
    };

    let storage = Arc::new(Storage::open(&config)?);
    let (handle, mut task) =
        spawn_accounting_actor(&config, storage, Collaborators::from_catalog(Arc::new(catalog)))?;
    tracing::info!("Accounting actor started");

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down accounting server");
            handle.shutdown().await?;
            None
        }
        result = &mut task => Some(result?),
    };

    let outcome = match finished {
        Some(outcome) => outcome,
        None => task.await?,
    };

    if let Err(e) = outcome {
        // The ledger can no longer be trusted
        tracing::error!(error = %e, "Accounting actor failed");
        std::process::exit(1);
    }

    Ok(())
}
