//! Storage, metadata and listing services used by the HTTP handlers.

pub mod image_repository;
pub mod pagination;
pub mod reconcile;
pub mod storage_service;
