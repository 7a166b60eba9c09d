//! Delegated credentials for submitting and managing jobs on behalf of users.

pub mod voms;

pub use voms::VomsProxyProvider;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

use crate::types::{CredentialError, User};

/// A usable, short-lived credential bound to one user and one VO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// DN of the user the credential was issued for.
    pub identity: String,
    pub vo: String,
    /// Proxy file handed to the remote tools.
    pub proxy_path: PathBuf,
}

/// Obtains credentials for a (user, VO) pair, renewing them when necessary.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn acquire(&self, user: &User, vo: &str) -> Result<Credential, CredentialError>;
}

/// Chooses which of several verified credentials submits an SFT occurrence.
pub trait UserSelector: Send + Sync {
    /// Index into `candidates`, or `None` when the slice is empty.
    fn select(&self, candidates: &[Credential]) -> Option<usize>;
}

/// Uniform random choice. Seedable for reproducible runs.
pub struct RandomSelector {
    rng: Mutex<StdRng>,
}

impl RandomSelector {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl UserSelector for RandomSelector {
    fn select(&self, candidates: &[Credential]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(self.rng.lock().gen_range(0..candidates.len()))
    }
}

/// Always picks the first candidate (lowest DN, since users are name-ordered).
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstSelector;

impl UserSelector for FirstSelector {
    fn select(&self, candidates: &[Credential]) -> Option<usize> {
        if candidates.is_empty() {
            None
        } else {
            Some(0)
        }
    }
}
