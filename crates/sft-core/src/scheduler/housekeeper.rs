//! Periodic refresh of the scheduler's working state.
//!
//! Every cycle the set of clusters in scheduled downtime is recomputed.
//! Every `refresh_period` cycles the SFT events are rebuilt from the
//! definition store and job rows older than `max_job_age` are purged
//! together with their fetched output.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::event::{resolve, EventContext, SftEvent};
use crate::store::{DowntimeSource, StoreError};
use crate::types::Notification;

/// What one housekeeping tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub clusters_down: usize,
    /// Set when definitions were reloaded this tick.
    pub events: Option<usize>,
    pub dropped_definitions: usize,
    pub purged_jobs: usize,
}

pub struct Housekeeper {
    ctx: Arc<EventContext>,
    downtime: Arc<dyn DowntimeSource>,
    refresh_period: u32,
    max_job_age: Duration,
    events: Vec<Arc<SftEvent>>,
    clusters_down: Arc<HashSet<String>>,
    /// Ticks left until the next definition reload; zero reloads on the next tick.
    cycles_until_refresh: u32,
}

impl Housekeeper {
    pub fn new(
        ctx: Arc<EventContext>,
        downtime: Arc<dyn DowntimeSource>,
        refresh_period: u32,
        max_job_age: Duration,
    ) -> Self {
        Self {
            ctx,
            downtime,
            refresh_period: refresh_period.max(1),
            max_job_age,
            events: Vec::new(),
            clusters_down: Arc::new(HashSet::new()),
            cycles_until_refresh: 0,
        }
    }

    pub fn events(&self) -> &[Arc<SftEvent>] {
        &self.events
    }

    pub fn clusters_down(&self) -> Arc<HashSet<String>> {
        self.clusters_down.clone()
    }

    /// One housekeeping step. `local_now` is wall-clock local time, used for
    /// downtime windows; `utc_now` drives job retention.
    pub async fn tick(&mut self, local_now: NaiveDateTime, utc_now: DateTime<Utc>) -> HousekeepingReport {
        let mut report = HousekeepingReport::default();

        if self.cycles_until_refresh == 0 {
            match self.refresh_events().await {
                Ok(dropped) => {
                    report.events = Some(self.events.len());
                    report.dropped_definitions = dropped;
                }
                Err(e) => {
                    tracing::error!("Housekeeper: cannot list SFT definitions, keeping {} events: {}", self.events.len(), e);
                }
            }
            report.purged_jobs = self.purge_jobs_at(utc_now).await;
            self.cycles_until_refresh = self.refresh_period;
        }
        self.cycles_until_refresh -= 1;

        report.clusters_down = self.refresh_downtime_at(local_now).await;
        report
    }

    /// Recompute the hosts whose downtime window contains `now` and hand the
    /// snapshot to every event. On a source error the previous snapshot stays.
    pub async fn refresh_downtime_at(&mut self, now: NaiveDateTime) -> usize {
        match self.downtime.downtime_windows().await {
            Ok(windows) => {
                let down: HashSet<String> = windows
                    .into_iter()
                    .filter(|w| w.contains(now))
                    .map(|w| w.host)
                    .collect();
                if down != *self.clusters_down {
                    tracing::info!(hosts = ?down, "clusters in scheduled downtime changed");
                }
                self.clusters_down = Arc::new(down);
            }
            Err(e) => {
                tracing::warn!("Housekeeper: downtime source unavailable, keeping previous list: {}", e);
            }
        }
        for event in &self.events {
            event.set_clusters_down(self.clusters_down.clone());
        }
        self.clusters_down.len()
    }

    /// Rebuild every event from the definition store. Definitions that fail
    /// to resolve are reported and left out. Returns how many were dropped.
    pub async fn refresh_events(&mut self) -> Result<usize, StoreError> {
        let definitions = self.ctx.definitions.list_sfts().await?;
        let mut events = Vec::with_capacity(definitions.len());
        let mut dropped = 0;

        for definition in definitions {
            let name = definition.name.clone();
            let built = match resolve(self.ctx.definitions.as_ref(), definition).await {
                Ok(resolved) => SftEvent::new(resolved, self.ctx.clone()),
                Err(e) => Err(e),
            };
            match built {
                Ok(event) => {
                    event.set_clusters_down(self.clusters_down.clone());
                    events.push(Arc::new(event));
                }
                Err(e) => {
                    tracing::error!(sft = %name, "dropping SFT: {}", e);
                    self.ctx.notifier.add(Notification::critical(
                        &self.ctx.localhost,
                        &name,
                        format!("SFT {name} disabled: {e}"),
                    ));
                    dropped += 1;
                }
            }
        }

        tracing::info!(events = events.len(), dropped, "SFT events refreshed");
        self.events = events;
        Ok(dropped)
    }

    /// Delete job rows with `last_modified <= now - max_job_age` and their
    /// output directories. Returns the number of rows removed.
    pub async fn purge_jobs_at(&self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(self.max_job_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            tracing::warn!(max_job_age = ?self.max_job_age, "retention period out of range, skipping purge");
            return 0;
        };

        let purged = match self.ctx.jobs.purge_jobs(cutoff).await {
            Ok(purged) => purged,
            Err(e) => {
                tracing::error!("Housekeeper: failed to purge jobs: {}", e);
                return 0;
            }
        };

        for job in &purged {
            if let Some(dir) = &job.output_dir {
                remove_output(Path::new(dir)).await;
            }
        }
        if !purged.is_empty() {
            tracing::info!(count = purged.len(), cutoff = %cutoff, "purged old jobs");
        }
        purged.len()
    }
}

async fn remove_output(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(dir = %dir.display(), "removed job output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), "could not remove job output: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobStore;
    use crate::testing::{seed_sft, Harness};
    use crate::types::{DowntimeWindow, Job, JobStatus, Severity, SftDefinition};
    use chrono::{NaiveDate, TimeZone};

    fn local(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 12)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn downtime_window_is_inclusive_local_time() {
        let h = Harness::new().unwrap();
        h.downtime.set(vec![
            DowntimeWindow {
                host: "ce1".into(),
                start: local(10, 0),
                end: local(12, 0),
            },
            DowntimeWindow {
                host: "ce2".into(),
                start: local(13, 0),
                end: local(14, 0),
            },
        ]);
        let mut hk = h.housekeeper(10, Duration::from_secs(3600));

        assert_eq!(hk.refresh_downtime_at(local(12, 0)).await, 1);
        assert!(hk.clusters_down().contains("ce1"));
        assert_eq!(hk.refresh_downtime_at(local(12, 1)).await, 0);
    }

    #[tokio::test]
    async fn downtime_source_failure_keeps_previous_snapshot() {
        let h = Harness::new().unwrap();
        h.downtime.set(vec![DowntimeWindow {
            host: "ce1".into(),
            start: local(0, 0),
            end: local(23, 0),
        }]);
        let mut hk = h.housekeeper(10, Duration::from_secs(3600));
        hk.refresh_downtime_at(local(9, 0)).await;
        h.downtime.fail(true);
        assert_eq!(hk.refresh_downtime_at(local(9, 1)).await, 1);
    }

    #[tokio::test]
    async fn broken_definitions_are_dropped_and_reported() {
        let h = Harness::new().unwrap();
        let good = SftDefinition::new("good", "ce-all", "vos", "basic");
        seed_sft(&h.store, &good, &["ce1"], &[("smscg", &["/CN=alice"])], &["env"])
            .await
            .unwrap();
        h.store
            .upsert_sft(&SftDefinition::new("orphan", "missing", "vos", "basic"))
            .await
            .unwrap();
        h.store
            .upsert_sft(
                &SftDefinition::new("badcron", "ce-all", "vos", "basic")
                    .with_schedule("x", "*", "*", "*", "*"),
            )
            .await
            .unwrap();

        let mut hk = h.housekeeper(10, Duration::from_secs(3600));
        assert_eq!(hk.refresh_events().await.unwrap(), 2);
        let names: Vec<_> = hk.events().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["good".to_string()]);

        let critical: Vec<_> = h
            .notifier
            .notifications()
            .into_iter()
            .filter(|n| n.severity == Severity::Critical)
            .collect();
        assert_eq!(critical.len(), 2);
        assert!(critical.iter().all(|n| n.target == h.ctx.localhost));
    }

    #[tokio::test]
    async fn events_reload_every_refresh_period() {
        let h = Harness::new().unwrap();
        let first = SftDefinition::new("first", "ce-all", "vos", "basic");
        seed_sft(&h.store, &first, &["ce1"], &[("smscg", &["/CN=alice"])], &["env"])
            .await
            .unwrap();
        let mut hk = h.housekeeper(3, Duration::from_secs(3600));
        let now = Utc::now();

        assert_eq!(hk.tick(local(1, 0), now).await.events, Some(1));
        h.store
            .upsert_sft(&SftDefinition::new("second", "ce-all", "vos", "basic"))
            .await
            .unwrap();
        assert_eq!(hk.tick(local(1, 1), now).await.events, None);
        assert_eq!(hk.tick(local(1, 2), now).await.events, None);
        assert_eq!(hk.tick(local(1, 3), now).await.events, Some(2));
    }

    #[tokio::test]
    async fn new_snapshot_reaches_events() {
        let h = Harness::new().unwrap();
        let def = SftDefinition::new("nightly", "ce-all", "vos", "basic");
        seed_sft(&h.store, &def, &["ce1", "ce2"], &[("smscg", &["/CN=alice"])], &["env"])
            .await
            .unwrap();
        h.downtime.set(vec![DowntimeWindow {
            host: "ce2".into(),
            start: local(0, 0),
            end: local(23, 59),
        }]);
        let mut hk = h.housekeeper(10, Duration::from_secs(3600));
        hk.tick(local(2, 0), Utc::now()).await;
        assert!(hk.events()[0].clusters_down().contains("ce2"));
    }

    #[tokio::test]
    async fn purge_boundary_is_inclusive_and_removes_output() {
        let h = Harness::new().unwrap();
        let out = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 12, 12, 0, 0).unwrap();
        let age = Duration::from_secs(2880 * 60);
        let boundary = now - chrono::Duration::minutes(2880);

        let mut old = Job::submitted("s", "ce1", "smscg", "env", "/CN=a", "id-1".into());
        let dir = out.path().join("id-1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stderr.txt.html"), "").unwrap();
        old.output_dir = Some(dir.display().to_string());
        old.transition(JobStatus::Fetched, boundary);

        let mut gone = Job::submitted("s", "ce1", "smscg", "env", "/CN=a", "id-2".into());
        gone.output_dir = Some(out.path().join("never-created").display().to_string());
        gone.transition(JobStatus::Fetched, boundary - chrono::Duration::minutes(1));

        let mut young = Job::submitted("s", "ce1", "smscg", "env", "/CN=a", "id-3".into());
        young.transition(JobStatus::Fetched, boundary + chrono::Duration::seconds(1));

        for job in [&old, &gone, &young] {
            h.store.insert_job(job).await.unwrap();
        }

        let hk = h.housekeeper(10, age);
        assert_eq!(hk.purge_jobs_at(now).await, 2);
        assert!(!dir.exists());
        let left = h.store.list_jobs(None, 10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, young.id);
    }
}
