//! Site functional test scheduling engine
//!
//! Periodically submits synthetic test jobs to grid clusters, follows them
//! through their remote lifecycle, classifies the fetched output and
//! reports every outcome to a Nagios-compatible monitoring sink.

pub mod config;
pub mod credentials;
pub mod indexer;
pub mod notifier;
pub mod process;
pub mod remote;
pub mod scheduler;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use credentials::{CredentialProvider, RandomSelector, UserSelector, VomsProxyProvider};
pub use indexer::{HtmlIndexer, OutputIndexer};
pub use notifier::{DefaultNotifier, Notifier};
pub use remote::{ArcClient, RemoteJobControl};
pub use scheduler::{EventContext, Housekeeper, Publisher, Scheduler, SchedulerMetrics, SftEvent};
pub use store::{DefinitionStore, DowntimeSource, JobStore, SqliteStore, StoreError};
pub use types::*;

use std::sync::Arc;

/// Errors raised while assembling the engine.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cannot prepare {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A fully wired engine: the scheduler and the store behind it.
pub struct SftRuntime {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<SqliteStore>,
    pub notifier: Arc<DefaultNotifier>,
}

impl SftRuntime {
    /// Build every production collaborator from `config`.
    pub fn new(config: &Config) -> Result<Self, RuntimeError> {
        config.validate()?;
        for dir in [&config.paths.jobs_dir, &config.paths.proxy_dir] {
            std::fs::create_dir_all(dir).map_err(|source| RuntimeError::Io {
                path: dir.clone(),
                source,
            })?;
        }

        let store = Arc::new(SqliteStore::open(&config.database_path())?);
        let notifier = Arc::new(DefaultNotifier::new(config.notifier.clone()));
        let ctx = Arc::new(EventContext {
            definitions: store.clone(),
            jobs: store.clone(),
            credentials: Arc::new(VomsProxyProvider::new(
                config.credentials.clone(),
                config.paths.proxy_dir.clone(),
            )),
            remote: Arc::new(ArcClient::from_config(config)),
            notifier: notifier.clone(),
            selector: Arc::new(RandomSelector::new()),
            localhost: config.localhost(),
        });

        let housekeeper = Housekeeper::new(
            ctx.clone(),
            store.clone(),
            config.scheduler.refresh_period,
            config.housekeeping.max_job_age,
        );
        let publisher = Arc::new(Publisher::new(
            ctx,
            Arc::new(HtmlIndexer::new(config.paths.url_root.clone())),
            scheduler::OutputClassifier::new(config.classification.clone()),
            config.paths.jobs_dir.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            housekeeper,
            publisher,
            notifier.clone(),
        ));

        Ok(Self {
            scheduler,
            store,
            notifier,
        })
    }
}
