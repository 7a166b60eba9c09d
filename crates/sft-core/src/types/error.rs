use std::fmt;
use thiserror::Error;

use crate::scheduler::cron::CronError;
use crate::store::StoreError;

/// Raised when an SFT definition cannot be resolved into runnable lists.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("SFT '{0}' does not exist")]
    MissingSft(String),

    #[error("cluster group '{group}' referenced by SFT '{sft}' does not exist")]
    MissingClusterGroup { sft: String, group: String },

    #[error("VO group '{group}' referenced by SFT '{sft}' does not exist")]
    MissingVoGroup { sft: String, group: String },

    #[error("test suite '{suite}' referenced by SFT '{sft}' does not exist")]
    MissingTestSuite { sft: String, suite: String },

    #[error("no clusters associated with SFT '{0}'")]
    EmptyClusterGroup(String),

    #[error("no VOs associated with SFT '{0}'")]
    EmptyVoGroup(String),

    #[error("no tests associated with SFT '{0}'")]
    EmptyTestSuite(String),

    #[error("invalid execution time for SFT '{sft}': {source}")]
    InvalidSchedule {
        sft: String,
        #[source]
        source: CronError,
    },

    #[error("definition store unavailable: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialErrorKind {
    /// Temporary outage of the credential service or tooling.
    Transient,
    /// The daemon or the user record is misconfigured.
    Config,
    /// The credential service refused the request.
    Denied,
}

impl fmt::Display for CredentialErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CredentialErrorKind::Transient => "transient",
            CredentialErrorKind::Config => "configuration",
            CredentialErrorKind::Denied => "denied",
        };
        f.write_str(s)
    }
}

/// Failure to obtain a usable credential for a (user, VO) pair.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} credential error: {message}")]
pub struct CredentialError {
    pub kind: CredentialErrorKind,
    pub message: String,
}

impl CredentialError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: CredentialErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self {
            kind: CredentialErrorKind::Config,
            message: message.into(),
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            kind: CredentialErrorKind::Denied,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteToolErrorKind {
    /// The tool could not be started or exited non-zero.
    Invocation,
    /// The tool exceeded its time limit and was killed.
    Timeout,
    /// The tool exited zero but reported failure in its output.
    LogicalFailure,
    /// The remote system does not know the job.
    JobUnknown,
    /// The tool output could not be understood.
    Parse,
}

impl fmt::Display for RemoteToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteToolErrorKind::Invocation => "invocation",
            RemoteToolErrorKind::Timeout => "timeout",
            RemoteToolErrorKind::LogicalFailure => "logical failure",
            RemoteToolErrorKind::JobUnknown => "job unknown",
            RemoteToolErrorKind::Parse => "parse",
        };
        f.write_str(s)
    }
}

/// Failure of a remote submission, status or retrieval tool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct RemoteToolError {
    pub kind: RemoteToolErrorKind,
    pub message: String,
}

impl RemoteToolError {
    pub fn new(kind: RemoteToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invocation(message: impl Into<String>) -> Self {
        Self::new(RemoteToolErrorKind::Invocation, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteToolErrorKind::Timeout, message)
    }

    pub fn logical(message: impl Into<String>) -> Self {
        Self::new(RemoteToolErrorKind::LogicalFailure, message)
    }

    pub fn job_unknown(message: impl Into<String>) -> Self {
        Self::new(RemoteToolErrorKind::JobUnknown, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(RemoteToolErrorKind::Parse, message)
    }
}
