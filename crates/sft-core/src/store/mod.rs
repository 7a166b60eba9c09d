//! Persistence seams: SFT definitions, job rows and downtime windows.

pub mod import;
pub mod sqlite;

pub use import::DefinitionBundle;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    ClusterGroup, DowntimeWindow, Job, JobId, SftDefinition, TestSuite, User, VoGroup,
};

/// Errors produced by the stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Read access to SFT definitions and the entities they reference.
///
/// Lists are returned ordered by name so that runs are reproducible.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn list_sfts(&self) -> Result<Vec<SftDefinition>, StoreError>;

    async fn get_sft(&self, name: &str) -> Result<Option<SftDefinition>, StoreError>;

    async fn get_cluster_group(&self, name: &str) -> Result<Option<ClusterGroup>, StoreError>;

    /// VO group with each VO's member users populated.
    async fn get_vo_group(&self, name: &str) -> Result<Option<VoGroup>, StoreError>;

    async fn get_test_suite(&self, name: &str) -> Result<Option<TestSuite>, StoreError>;

    async fn get_user(&self, dn: &str) -> Result<Option<User>, StoreError>;
}

/// Persistent job rows.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Overwrite the mutable fields of an existing row.
    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Newest first, optionally restricted to one SFT.
    async fn list_jobs(&self, sft: Option<&str>, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Rows that carry a remote id and are not yet terminal.
    async fn list_pollable_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Rows in a grid-terminal state whose output should be retrieved.
    async fn list_fetchable_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Delete every row with `last_modified <= cutoff`, returning the deleted rows.
    async fn purge_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;
}

/// Source of scheduled downtime windows.
#[async_trait]
pub trait DowntimeSource: Send + Sync {
    async fn downtime_windows(&self) -> Result<Vec<DowntimeWindow>, StoreError>;
}
