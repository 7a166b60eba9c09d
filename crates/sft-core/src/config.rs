//! Daemon configuration.
//!
//! Loaded from a TOML file; every section and key is optional. A small set
//! of `SFTD_*` environment variables overrides the file.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },
}

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub housekeeping: HousekeepingConfig,
    pub paths: PathsConfig,
    pub credentials: CredentialsConfig,
    pub remote: RemoteConfig,
    pub notifier: NotifierConfig,
    pub classification: ClassificationConfig,
    pub logging: LoggingConfig,
    pub daemon: DaemonConfig,
}

/// Control loop and worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Target length of one control cycle.
    #[serde(with = "humantime_serde")]
    pub cycle: Duration,
    /// Number of worker tasks running SFT events.
    pub workers: usize,
    /// Run the publisher every N cycles.
    pub publish_every: u32,
    /// Reload SFT definitions and purge old jobs every N cycles.
    pub refresh_period: u32,
    /// How long an idle worker waits on the queue before re-checking shutdown.
    #[serde(with = "humantime_serde")]
    pub dequeue_wait: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. Defaults to `$XDG_DATA_HOME/sftd/sft.db`.
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    /// Job rows untouched for this long are purged with their output.
    #[serde(with = "humantime_serde")]
    pub max_job_age: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Where fetched job output is stored. Should live below `url_root`.
    pub jobs_dir: PathBuf,
    /// Root of the web-served tree; artifacts are reported relative to it.
    pub url_root: PathBuf,
    /// Where proxy certificates are cached.
    pub proxy_dir: PathBuf,
    /// Directory holding the ARC client tools. `PATH` lookup when unset.
    pub arc_client_tools: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Old,
    Rfc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub myproxy_server: String,
    pub myproxy_port: u16,
    /// Lifetime requested for a freshly retrieved MyProxy credential.
    pub myproxy_lifetime_hours: u32,
    /// Renew the MyProxy credential below this remaining lifetime.
    pub min_myproxy_valid_hours: u32,
    /// Renew a VOMS proxy below this remaining lifetime.
    pub min_vomsproxy_valid_hours: u32,
    /// Lifetime requested for a fresh VOMS proxy.
    pub vomsproxy_hours: u32,
    pub proxy_type: ProxyType,
    pub myproxy_logon: PathBuf,
    pub voms_proxy_init: PathBuf,
    pub voms_proxy_info: PathBuf,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    #[serde(with = "humantime_serde")]
    pub submit_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub status_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Output fragments that turn an exit-zero submission into a failure.
    pub submit_failure_markers: Vec<String>,
    /// Output fragments meaning the remote system no longer knows a job.
    pub unknown_job_markers: Vec<String>,
    /// ARC job list file. Defaults to `<jobs_dir>/jobs.xml`.
    pub job_list: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierBackend {
    /// Forward through `send_nsca` to a Nagios server.
    Nsca,
    /// Append JSON lines to a file.
    LogFile,
    /// Emit tracing events only.
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// The newest notification per (host, service) wins.
    MostRecent,
    /// All notifications per (host, service) are merged, worst severity wins.
    Chronological,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub backend: NotifierBackend,
    pub nagios_server: Option<String>,
    pub send_nsca: PathBuf,
    pub send_nsca_config: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub dedup: DedupPolicy,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Host name used for reports not tied to a cluster. Defaults to this host.
    pub localhost: Option<String>,
}

/// How fetched output is judged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    /// File whose non-empty presence marks a failure.
    pub error_log: String,
    /// Directory searched for the failure marker.
    pub log_dir: String,
    pub failure_marker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub pid_file: PathBuf,
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sftd")
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle: Duration::from_secs(60),
            workers: 10,
            publish_every: 1,
            refresh_period: 10,
            dequeue_wait: Duration::from_secs(5),
        }
    }
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            max_job_age: Duration::from_secs(2880 * 60),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let root = data_dir().join("www");
        Self {
            jobs_dir: root.join("jobs"),
            url_root: root,
            proxy_dir: data_dir().join("proxies"),
            arc_client_tools: None,
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            myproxy_server: String::new(),
            myproxy_port: 7512,
            myproxy_lifetime_hours: 12,
            min_myproxy_valid_hours: 10,
            min_vomsproxy_valid_hours: 2,
            vomsproxy_hours: 10,
            proxy_type: ProxyType::Rfc,
            myproxy_logon: PathBuf::from("myproxy-logon"),
            voms_proxy_init: PathBuf::from("voms-proxy-init"),
            voms_proxy_info: PathBuf::from("voms-proxy-info"),
            timeout: Duration::from_secs(120),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(120),
            status_timeout: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(300),
            submit_failure_markers: vec!["Job submission failed".to_string()],
            unknown_job_markers: vec![
                "Job not found".to_string(),
                "job information not found".to_string(),
                "No jobs".to_string(),
            ],
            job_list: None,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            backend: NotifierBackend::Log,
            nagios_server: None,
            send_nsca: PathBuf::from("send_nsca"),
            send_nsca_config: None,
            log_path: None,
            dedup: DedupPolicy::MostRecent,
            timeout: Duration::from_secs(30),
            localhost: None,
        }
    }
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            error_log: "stderr.txt".to_string(),
            log_dir: "gmlog".to_string(),
            failure_marker: "failed".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: data_dir().join("sftd.pid"),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// Apply `SFTD_DATABASE`, `SFTD_LOG_LEVEL` and `SFTD_NAGIOS_SERVER`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = env::var("SFTD_DATABASE") {
            self.storage.database = Some(PathBuf::from(path));
        }
        if let Ok(level) = env::var("SFTD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(server) = env::var("SFTD_NAGIOS_SERVER") {
            self.notifier.nagios_server = Some(server);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.workers".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.scheduler.cycle.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.cycle".to_string(),
                reason: "cycle length must be positive".to_string(),
            });
        }
        if self.scheduler.publish_every == 0 {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.publish_every".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.scheduler.refresh_period == 0 {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.refresh_period".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.scheduler.dequeue_wait.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.dequeue_wait".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        match self.notifier.backend {
            NotifierBackend::Nsca => {
                if self.notifier.nagios_server.is_none() {
                    return Err(ConfigError::MissingRequired {
                        key: "notifier.nagios_server".to_string(),
                    });
                }
            }
            NotifierBackend::LogFile => {
                if self.notifier.log_path.is_none() {
                    return Err(ConfigError::MissingRequired {
                        key: "notifier.log_path".to_string(),
                    });
                }
            }
            NotifierBackend::Log => {}
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database
            .clone()
            .unwrap_or_else(|| data_dir().join("sft.db"))
    }

    pub fn job_list_path(&self) -> PathBuf {
        self.remote
            .job_list
            .clone()
            .unwrap_or_else(|| self.paths.jobs_dir.join("jobs.xml"))
    }

    /// Host name for reports not tied to a cluster.
    pub fn localhost(&self) -> String {
        self.notifier
            .localhost
            .clone()
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Resolve an ARC client tool, honouring `paths.arc_client_tools`.
    pub fn arc_tool(&self, name: &str) -> PathBuf {
        match &self.paths.arc_client_tools {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }
}
