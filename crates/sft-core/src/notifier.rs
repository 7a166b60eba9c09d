//! Notification queue and delivery to the monitoring system.
//!
//! Components add notifications at any time; once per control cycle the
//! scheduler flushes the queue. Duplicates for the same (target, service)
//! pair are collapsed at flush time according to the configured policy.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::{DedupPolicy, NotifierBackend, NotifierConfig};
use crate::process::{self, ToolCommand};
use crate::types::Notification;

/// Separator between NSCA blocks on `send_nsca` stdin.
const NSCA_BLOCK_END: char = '\u{17}';

/// Outcome of one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub channel: String,
    /// Notifications handed to the sink after deduplication.
    pub delivered: usize,
    /// Notifications collapsed into another one for the same key.
    pub collapsed: usize,
    pub success: bool,
    pub error: Option<String>,
}

impl FlushReport {
    fn empty(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            delivered: 0,
            collapsed: 0,
            success: true,
            error: None,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Queue a notification for the next flush.
    fn add(&self, notification: Notification);

    /// Deliver everything queued since the last flush.
    async fn flush(&self) -> FlushReport;
}

/// Collapse duplicates for the same (target, service) pair.
///
/// `notifications` must be in the order they were added.
pub fn deduplicate(notifications: Vec<Notification>, policy: DedupPolicy) -> Vec<Notification> {
    let mut by_key: BTreeMap<(String, String), Notification> = BTreeMap::new();
    for n in notifications {
        match by_key.entry(n.key()) {
            Entry::Vacant(slot) => {
                slot.insert(n);
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                match policy {
                    DedupPolicy::MostRecent => *existing = n,
                    DedupPolicy::Chronological => {
                        if n.severity.rank() > existing.severity.rank() {
                            existing.severity = n.severity;
                        }
                        existing.message = format!("{} | {}", existing.message, n.message);
                        if n.perf_data.is_some() {
                            existing.perf_data = n.perf_data;
                        }
                        existing.created_at = n.created_at;
                    }
                }
            }
        }
    }
    by_key.into_values().collect()
}

/// One NSCA line: `host;service;code;message|perfdata`.
pub fn nsca_line(n: &Notification) -> String {
    let clean = |s: &str| s.replace(';', ",").replace('\n', "\\n");
    let mut line = format!(
        "{};{};{};{}",
        clean(&n.target),
        clean(&n.service),
        n.severity.code(),
        clean(&n.message)
    );
    if let Some(perf) = &n.perf_data {
        line.push('|');
        line.push_str(&clean(perf));
    }
    line
}

/// Queue plus a configured delivery backend.
pub struct DefaultNotifier {
    config: NotifierConfig,
    pending: Mutex<Vec<Notification>>,
}

impl DefaultNotifier {
    pub fn new(config: NotifierConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn deliver_log(&self, batch: &[Notification]) -> FlushReport {
        for n in batch {
            tracing::info!(
                target_host = %n.target,
                service = %n.service,
                severity = %n.severity,
                perf_data = n.perf_data.as_deref().unwrap_or(""),
                "{}",
                n.message
            );
        }
        FlushReport {
            delivered: batch.len(),
            ..FlushReport::empty("log")
        }
    }

    async fn deliver_log_file(&self, batch: &[Notification], path: &Path) -> FlushReport {
        let channel = format!("log_file:{}", path.display());
        let mut payload = String::new();
        for n in batch {
            match serde_json::to_string(n) {
                Ok(line) => {
                    payload.push_str(&line);
                    payload.push('\n');
                }
                Err(e) => tracing::warn!("could not serialise notification: {}", e),
            }
        }
        let result = async {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(payload.as_bytes()).await?;
            file.flush().await
        }
        .await;
        match result {
            Ok(()) => FlushReport {
                delivered: batch.len(),
                ..FlushReport::empty(&channel)
            },
            Err(e) => FlushReport {
                success: false,
                error: Some(format!("write failed: {e}")),
                ..FlushReport::empty(&channel)
            },
        }
    }

    async fn deliver_nsca(&self, batch: &[Notification]) -> FlushReport {
        let Some(server) = self.config.nagios_server.as_deref() else {
            return FlushReport {
                success: false,
                error: Some("no Nagios server configured".to_string()),
                ..FlushReport::empty("nsca")
            };
        };
        let channel = format!("nsca:{server}");
        let payload = batch
            .iter()
            .map(nsca_line)
            .collect::<Vec<_>>()
            .join(&NSCA_BLOCK_END.to_string());

        let mut cmd = ToolCommand::new(&self.config.send_nsca, self.config.timeout)
            .arg("-H")
            .arg(server)
            .arg("-d")
            .arg(";");
        if let Some(cfg) = &self.config.send_nsca_config {
            cmd = cmd.arg("-c").arg(cfg.display().to_string());
        }
        let cmd = cmd.stdin(payload);

        match process::run(&cmd).await {
            Ok(out) if out.success() => FlushReport {
                delivered: batch.len(),
                ..FlushReport::empty(&channel)
            },
            Ok(out) => FlushReport {
                success: false,
                error: Some(format!(
                    "send_nsca exited with {}: {}",
                    out.exit_code,
                    out.combined()
                )),
                ..FlushReport::empty(&channel)
            },
            Err(e) => FlushReport {
                success: false,
                error: Some(e.to_string()),
                ..FlushReport::empty(&channel)
            },
        }
    }
}

#[async_trait]
impl Notifier for DefaultNotifier {
    fn add(&self, notification: Notification) {
        tracing::debug!(
            target_host = %notification.target,
            service = %notification.service,
            severity = %notification.severity,
            "queued notification"
        );
        self.pending.lock().push(notification);
    }

    async fn flush(&self) -> FlushReport {
        let queued = std::mem::take(&mut *self.pending.lock());
        let total = queued.len();
        let batch = deduplicate(queued, self.config.dedup);
        let collapsed = total - batch.len();
        if batch.is_empty() {
            return FlushReport::empty("none");
        }

        let started = Utc::now();
        let mut report = match self.config.backend {
            NotifierBackend::Log => self.deliver_log(&batch),
            NotifierBackend::LogFile => match &self.config.log_path {
                Some(path) => self.deliver_log_file(&batch, path).await,
                None => FlushReport {
                    success: false,
                    error: Some("no log_path configured".to_string()),
                    ..FlushReport::empty("log_file")
                },
            },
            NotifierBackend::Nsca => self.deliver_nsca(&batch).await,
        };
        report.collapsed = collapsed;

        if report.success {
            tracing::debug!(
                channel = %report.channel,
                delivered = report.delivered,
                collapsed,
                elapsed_ms = (Utc::now() - started).num_milliseconds(),
                "flushed notifications"
            );
        } else {
            tracing::error!(
                channel = %report.channel,
                dropped = batch.len(),
                "notification flush failed: {}",
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
        report
    }
}
