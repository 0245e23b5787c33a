//! Storage/metadata reconciliation.
//!
//! A file exists in the storage directory iff its row exists in the
//! `images` table. A crash between the file write and the row insert (or
//! between the row delete and the file removal) breaks that; this pass
//! repairs it. It must run while no worker is serving, so the supervisor
//! calls it before launching workers, and `--reconcile` runs it on demand.

use crate::services::{
    image_repository::{ImageRepository, RepositoryError},
    storage_service::{ImageStorage, StorageError},
};
use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// What one reconciliation pass changed.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub temp_files_removed: usize,
    /// Files on disk that had no metadata row.
    pub orphan_files_removed: Vec<String>,
    /// Metadata rows whose file was missing.
    pub dangling_records_removed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.temp_files_removed == 0
            && self.orphan_files_removed.is_empty()
            && self.dangling_records_removed.is_empty()
    }
}

pub async fn reconcile(
    storage: &ImageStorage,
    repository: &ImageRepository,
) -> Result<ReconcileReport, ReconcileError> {
    let mut report = ReconcileReport {
        temp_files_removed: storage.purge_temp_files().await?,
        ..Default::default()
    };

    let on_disk = storage.list().await?;
    let recorded: BTreeSet<String> = repository
        .list_all()
        .await?
        .into_iter()
        .map(|record| record.filename)
        .collect();

    for name in on_disk.difference(&recorded) {
        warn!(filename = %name, "removing file without metadata row");
        match storage.delete(name).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        report.orphan_files_removed.push(name.clone());
    }

    for name in recorded.difference(&on_disk) {
        warn!(filename = %name, "removing metadata row without file");
        match repository.delete(name).await {
            Ok(()) | Err(RepositoryError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        report.dangling_records_removed.push(name.clone());
    }

    if report.is_clean() {
        info!(images = on_disk.len(), "storage and metadata are consistent");
    } else {
        info!(
            temp_files = report.temp_files_removed,
            orphan_files = report.orphan_files_removed.len(),
            dangling_records = report.dangling_records_removed.len(),
            "reconciliation repaired divergence"
        );
    }
    Ok(report)
}
