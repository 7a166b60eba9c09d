//! Submission, status and retrieval of jobs on remote clusters.

pub mod arc;

pub use arc::ArcClient;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::credentials::Credential;
use crate::types::{Cluster, RemoteToolError, Test};

/// Remote job lifecycle operations, each bounded by its own time limit.
#[async_trait]
pub trait RemoteJobControl: Send + Sync {
    /// Submit `test` to `cluster`, returning the remote job id.
    async fn submit(
        &self,
        cluster: &Cluster,
        test: &Test,
        credential: &Credential,
    ) -> Result<String, RemoteToolError>;

    /// Current remote state string of a job.
    async fn status(&self, remote_id: &str, credential: &Credential)
        -> Result<String, RemoteToolError>;

    /// Download the job's output below `destination`, returning the output directory.
    async fn fetch(
        &self,
        remote_id: &str,
        destination: &Path,
        credential: &Credential,
    ) -> Result<PathBuf, RemoteToolError>;
}
