//! Shared per-process application state handed to every handler.

use crate::{
    handlers::validation::UploadPolicy,
    services::{
        image_repository::ImageRepository, pagination::Paginator, storage_service::ImageStorage,
    },
};

/// Collaborators a request handler works with.
///
/// Built once per worker process from an explicitly constructed pool; cloned
/// into each request (every field is a cheap handle).
#[derive(Clone, Debug)]
pub struct AppState {
    pub storage: ImageStorage,
    pub repository: ImageRepository,
    pub paginator: Paginator,
    pub upload_policy: UploadPolicy,
}

impl AppState {
    pub fn new(storage: ImageStorage, repository: ImageRepository) -> Self {
        Self {
            storage,
            repository,
            paginator: Paginator::default(),
            upload_policy: UploadPolicy::default(),
        }
    }

    pub fn with_upload_policy(mut self, upload_policy: UploadPolicy) -> Self {
        self.upload_policy = upload_policy;
        self
    }
}
