//! Process start-up: directories, pool, schema and consistency repair.

use crate::{
    config::AppConfig,
    db,
    services::{
        image_repository::ImageRepository,
        reconcile::{ReconcileReport, reconcile},
        storage_service::ImageStorage,
    },
};
use anyhow::{Context, Result};
use std::fs;

/// Storage and repository handles for one process.
#[derive(Clone, Debug)]
pub struct Services {
    pub storage: ImageStorage,
    pub repository: ImageRepository,
}

/// Create the storage directory, open this process's pool and build the
/// services on top of it. Does not touch the schema.
pub async fn open_services(cfg: &AppConfig) -> Result<Services> {
    if !cfg.storage_dir.exists() {
        fs::create_dir_all(&cfg.storage_dir).with_context(|| {
            format!("creating storage directory {}", cfg.storage_dir.display())
        })?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir.display());
    }

    let pool = db::connect(&cfg.database_settings())
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;

    Ok(Services {
        storage: ImageStorage::new(cfg.storage_dir.clone()),
        repository: ImageRepository::new(pool),
    })
}

/// Bring the schema up to date.
pub async fn run_migrations(services: &Services) -> Result<()> {
    db::migrate(services.repository.pool())
        .await
        .context("running database migrations")?;
    tracing::info!("Database migration complete.");
    Ok(())
}

/// Repair any drift between the storage directory and the metadata table.
/// Only safe while no worker is serving.
pub async fn run_reconcile(services: &Services) -> Result<ReconcileReport> {
    reconcile(&services.storage, &services.repository)
        .await
        .context("reconciling storage with metadata")
}

/// Everything the supervisor does before the first worker starts.
pub async fn prepare(cfg: &AppConfig) -> Result<Services> {
    let services = open_services(cfg).await?;
    run_migrations(&services).await?;
    run_reconcile(&services).await?;
    Ok(services)
}
