//! Runtime representation of one schedulable SFT.
//!
//! An [`SftEvent`] is built by the housekeeper from an [`SftDefinition`]. It
//! owns the parsed schedule and, on every due minute, submits one job per
//! (cluster, test) pair for each VO that yields a usable credential.

use arc_swap::ArcSwap;
use chrono::{Datelike, Timelike};
use std::collections::HashSet;
use std::sync::Arc;

use super::cron::Schedule;
use crate::credentials::{Credential, CredentialProvider, UserSelector};
use crate::notifier::Notifier;
use crate::remote::RemoteJobControl;
use crate::store::{DefinitionStore, JobStore};
use crate::types::{
    Cluster, DefinitionError, Job, Notification, SftDefinition, Test, Vo,
};

/// Collaborators shared by events, the publisher and the housekeeper.
pub struct EventContext {
    pub definitions: Arc<dyn DefinitionStore>,
    pub jobs: Arc<dyn JobStore>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub remote: Arc<dyn RemoteJobControl>,
    pub notifier: Arc<dyn Notifier>,
    pub selector: Arc<dyn UserSelector>,
    /// Target host for reports that concern the daemon rather than a cluster.
    pub localhost: String,
}

/// An SFT definition with its groups expanded into concrete lists.
#[derive(Debug, Clone)]
pub struct ResolvedSft {
    pub definition: SftDefinition,
    pub clusters: Vec<Cluster>,
    pub vos: Vec<Vo>,
    pub tests: Vec<Test>,
}

/// Expand the groups referenced by `definition`.
///
/// A VO without users is kept; it simply produces no jobs.
pub async fn resolve(
    store: &dyn DefinitionStore,
    definition: SftDefinition,
) -> Result<ResolvedSft, DefinitionError> {
    let sft = definition.name.clone();

    let clusters = store
        .get_cluster_group(&definition.cluster_group)
        .await?
        .ok_or_else(|| DefinitionError::MissingClusterGroup {
            sft: sft.clone(),
            group: definition.cluster_group.clone(),
        })?
        .clusters;
    if clusters.is_empty() {
        return Err(DefinitionError::EmptyClusterGroup(sft));
    }

    let vos = store
        .get_vo_group(&definition.vo_group)
        .await?
        .ok_or_else(|| DefinitionError::MissingVoGroup {
            sft: sft.clone(),
            group: definition.vo_group.clone(),
        })?
        .vos;
    if vos.is_empty() {
        return Err(DefinitionError::EmptyVoGroup(sft));
    }

    let tests = store
        .get_test_suite(&definition.test_suite)
        .await?
        .ok_or_else(|| DefinitionError::MissingTestSuite {
            sft: sft.clone(),
            suite: definition.test_suite.clone(),
        })?
        .tests;
    if tests.is_empty() {
        return Err(DefinitionError::EmptyTestSuite(sft));
    }

    Ok(ResolvedSft {
        definition,
        clusters,
        vos,
        tests,
    })
}

/// Look up an SFT by name and resolve it.
pub async fn resolve_named(
    store: &dyn DefinitionStore,
    name: &str,
) -> Result<ResolvedSft, DefinitionError> {
    let definition = store
        .get_sft(name)
        .await?
        .ok_or_else(|| DefinitionError::MissingSft(name.to_string()))?;
    resolve(store, definition).await
}

/// Summary of one execution of an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub sft: String,
    pub submitted: usize,
    pub failed: usize,
    /// (cluster, test) pairs not attempted because the cluster is down.
    pub skipped_down: usize,
    /// VOs for which no user produced a credential.
    pub degraded_vos: Vec<String>,
    /// Set when the definition no longer resolves; no jobs were created.
    pub definition_error: Option<String>,
    pub store_errors: usize,
}

impl RunReport {
    fn new(sft: &str) -> Self {
        Self {
            sft: sft.to_string(),
            ..Self::default()
        }
    }
}

pub struct SftEvent {
    resolved: ResolvedSft,
    schedule: Schedule,
    clusters_down: ArcSwap<HashSet<String>>,
    ctx: Arc<EventContext>,
}

impl std::fmt::Debug for SftEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftEvent")
            .field("name", &self.name())
            .field("schedule", &self.schedule)
            .finish()
    }
}

impl SftEvent {
    pub fn new(resolved: ResolvedSft, ctx: Arc<EventContext>) -> Result<Self, DefinitionError> {
        let d = &resolved.definition;
        let schedule = Schedule::parse(&d.minute, &d.hour, &d.day, &d.month, &d.day_of_week)
            .map_err(|source| DefinitionError::InvalidSchedule {
                sft: d.name.clone(),
                source,
            })?;
        Ok(Self {
            resolved,
            schedule,
            clusters_down: ArcSwap::from_pointee(HashSet::new()),
            ctx,
        })
    }

    pub fn name(&self) -> &str {
        &self.resolved.definition.name
    }

    pub fn definition(&self) -> &SftDefinition {
        &self.resolved.definition
    }

    /// Lists as resolved when the event was built.
    pub fn resolved(&self) -> &ResolvedSft {
        &self.resolved
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Replace the downtime snapshot consulted by the next run.
    pub fn set_clusters_down(&self, down: Arc<HashSet<String>>) {
        self.clusters_down.store(down);
    }

    pub fn clusters_down(&self) -> Arc<HashSet<String>> {
        self.clusters_down.load_full()
    }

    pub fn is_due<T: Datelike + Timelike>(&self, now: &T) -> bool {
        self.schedule.matches(now)
    }

    /// Run the event if its schedule matches `now`.
    pub async fn check_exec<T: Datelike + Timelike + Sync>(&self, now: &T) -> Option<RunReport> {
        if !self.is_due(now) {
            return None;
        }
        Some(self.run().await)
    }

    /// Execute one scheduled occurrence unconditionally.
    pub async fn run(&self) -> RunReport {
        let name = self.name().to_string();
        let mut report = RunReport::new(&name);

        let resolved = match resolve_named(self.ctx.definitions.as_ref(), &name).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!(sft = %name, "SFT run skipped: {}", e);
                self.ctx.notifier.add(Notification::critical(
                    &self.ctx.localhost,
                    &name,
                    format!("SFT {name} not run: {e}"),
                ));
                report.definition_error = Some(e.to_string());
                return report;
            }
        };

        let down = self.clusters_down.load_full();
        tracing::info!(
            sft = %name,
            clusters = resolved.clusters.len(),
            vos = resolved.vos.len(),
            tests = resolved.tests.len(),
            down = down.len(),
            "running SFT"
        );

        for vo in &resolved.vos {
            if vo.users.is_empty() {
                tracing::debug!(sft = %name, vo = %vo.name, "VO has no users, nothing to submit");
                continue;
            }
            let Some(credential) = self.acquire_for_vo(vo).await else {
                report.degraded_vos.push(vo.name.clone());
                continue;
            };
            for cluster in &resolved.clusters {
                if down.contains(&cluster.hostname) {
                    tracing::info!(sft = %name, cluster = %cluster.hostname, "cluster in scheduled downtime, skipping");
                    report.skipped_down += resolved.tests.len();
                    continue;
                }
                for test in &resolved.tests {
                    self.submit_one(cluster, vo, test, &credential, &mut report)
                        .await;
                }
            }
        }

        tracing::info!(
            sft = %name,
            submitted = report.submitted,
            failed = report.failed,
            skipped_down = report.skipped_down,
            "SFT run complete"
        );
        report
    }

    /// Try every user of `vo` and let the selector pick among the successes.
    async fn acquire_for_vo(&self, vo: &Vo) -> Option<Credential> {
        let name = self.name();
        let mut usable = Vec::with_capacity(vo.users.len());
        let mut failures = Vec::new();
        for user in &vo.users {
            match self.ctx.credentials.acquire(user, &vo.name).await {
                Ok(credential) => usable.push(credential),
                Err(e) => {
                    tracing::warn!(sft = %name, vo = %vo.name, dn = %user.dn, "credential acquisition failed: {}", e);
                    failures.push(format!("{}: {}", user.dn, e));
                }
            }
        }

        match self.ctx.selector.select(&usable) {
            Some(index) if index < usable.len() => Some(usable.swap_remove(index)),
            _ => {
                self.ctx.notifier.add(Notification::critical(
                    &self.ctx.localhost,
                    name,
                    format!(
                        "no usable credential for VO {}: {}",
                        vo.name,
                        failures.join("; ")
                    ),
                ));
                None
            }
        }
    }

    async fn submit_one(
        &self,
        cluster: &Cluster,
        vo: &Vo,
        test: &Test,
        credential: &Credential,
        report: &mut RunReport,
    ) {
        let name = self.name();
        let host = cluster.hostname.as_str();
        let job = match self.ctx.remote.submit(cluster, test, credential).await {
            Ok(remote_id) => {
                tracing::info!(sft = %name, cluster = %host, test = %test.name, remote_id = %remote_id, "job submitted");
                self.ctx.notifier.add(Notification::ok(
                    host,
                    name,
                    format!("{} submitted as {}", test.name, remote_id),
                ));
                report.submitted += 1;
                Job::submitted(name, host, &vo.name, &test.name, &credential.identity, remote_id)
            }
            Err(e) => {
                tracing::warn!(sft = %name, cluster = %host, test = %test.name, "submission failed: {}", e);
                self.ctx.notifier.add(Notification::critical(
                    host,
                    name,
                    format!("{} submission failed: {}", test.name, e),
                ));
                report.failed += 1;
                Job::failed(
                    name,
                    host,
                    &vo.name,
                    &test.name,
                    &credential.identity,
                    e.to_string(),
                )
            }
        };

        if let Err(e) = self.ctx.jobs.insert_job(&job).await {
            tracing::error!(sft = %name, job_id = %job.id, "failed to record job: {}", e);
            report.store_errors += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_sft, Harness};
    use crate::types::{JobStatus, Severity};
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 12)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    async fn nightly(h: &Harness) -> SftEvent {
        let def = SftDefinition::new("nightly", "ce-all", "vos", "basic")
            .with_schedule("0", "2", "*", "*", "*");
        seed_sft(
            &h.store,
            &def,
            &["ce1.example.org", "ce2.example.org"],
            &[("smscg", &["/CN=alice"])],
            &["env", "hostname"],
        )
        .await
        .unwrap();
        let resolved = resolve_named(h.store.as_ref(), "nightly").await.unwrap();
        SftEvent::new(resolved, h.ctx.clone()).unwrap()
    }

    #[tokio::test]
    async fn runs_only_on_matching_minute() {
        let h = Harness::new().unwrap();
        let event = nightly(&h).await;
        event.set_clusters_down(Arc::new(HashSet::from(["ce2.example.org".to_string()])));

        let report = event.check_exec(&at(2, 0)).await.unwrap();
        assert_eq!(report.submitted, 2);
        assert_eq!(report.skipped_down, 2);
        assert!(event.check_exec(&at(2, 1)).await.is_none());

        let jobs = h.store.list_jobs(Some("nightly"), 10).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Submitted));
        assert!(jobs.iter().all(|j| j.cluster == "ce1.example.org"));
        assert!(jobs.iter().all(|j| j.dn == "/CN=alice"));
    }

    #[tokio::test]
    async fn vo_without_users_is_not_attempted() {
        let h = Harness::new().unwrap();
        let def = SftDefinition::new("empty-vo", "ce-all", "vos", "basic");
        seed_sft(&h.store, &def, &["ce1.example.org"], &[("ghost", &[] as &[&str])], &["env"])
            .await
            .unwrap();
        let event = SftEvent::new(
            resolve_named(h.store.as_ref(), "empty-vo").await.unwrap(),
            h.ctx.clone(),
        )
        .unwrap();

        let report = event.run().await;
        assert_eq!(report.submitted, 0);
        assert!(report.degraded_vos.is_empty());
        assert_eq!(h.credentials.calls(), 0);
        assert!(h.store.list_jobs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_users_failing_degrades_only_that_vo() {
        let h = Harness::new().unwrap();
        let def = SftDefinition::new("multi", "ce-all", "vos", "basic");
        seed_sft(
            &h.store,
            &def,
            &["ce1.example.org"],
            &[("atlas", &["/CN=bob"]), ("smscg", &["/CN=alice"])],
            &["env"],
        )
        .await
        .unwrap();
        h.credentials.deny("/CN=bob");
        let event = SftEvent::new(
            resolve_named(h.store.as_ref(), "multi").await.unwrap(),
            h.ctx.clone(),
        )
        .unwrap();

        let report = event.run().await;
        assert_eq!(report.degraded_vos, vec!["atlas".to_string()]);
        assert_eq!(report.submitted, 1);

        let jobs = h.store.list_jobs(None, 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].vo, "smscg");

        let critical: Vec<_> = h
            .notifier
            .notifications()
            .into_iter()
            .filter(|n| n.severity == Severity::Critical)
            .collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].target, h.ctx.localhost);
        assert!(critical[0].message.contains("atlas"));
    }

    #[tokio::test]
    async fn user_selection_only_sees_successful_credentials() {
        let h = Harness::new().unwrap();
        let def = SftDefinition::new("pick", "ce-all", "vos", "basic");
        seed_sft(
            &h.store,
            &def,
            &["ce1.example.org"],
            &[("smscg", &["/CN=alice", "/CN=bob"])],
            &["env"],
        )
        .await
        .unwrap();
        h.credentials.deny("/CN=alice");
        let event = SftEvent::new(
            resolve_named(h.store.as_ref(), "pick").await.unwrap(),
            h.ctx.clone(),
        )
        .unwrap();

        event.run().await;
        let jobs = h.store.list_jobs(None, 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].dn, "/CN=bob");
    }

    #[tokio::test]
    async fn submission_failure_is_recorded_as_failed_job() {
        let h = Harness::new().unwrap();
        let event = nightly(&h).await;
        h.remote.fail_submissions_on("ce1.example.org");

        let report = event.run().await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.submitted, 2);

        let failed: Vec<_> = h
            .store
            .list_jobs(None, 10)
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.status == JobStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|j| j.remote_id.is_none()));
        assert!(failed
            .iter()
            .all(|j| j.error_type == Some(crate::types::ErrorType::Submission)));
    }

    #[tokio::test]
    async fn removed_definition_skips_run_with_critical() {
        let h = Harness::new().unwrap();
        let event = nightly(&h).await;
        h.store.delete_sft("nightly").await.unwrap();

        let report = event.run().await;
        assert!(report.definition_error.is_some());
        assert_eq!(h.remote.submissions().len(), 0);
        let n = h.notifier.notifications();
        assert_eq!(n.len(), 1);
        assert_eq!(n[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn invalid_schedule_is_a_definition_error() {
        let h = Harness::new().unwrap();
        let def = SftDefinition::new("bad", "ce-all", "vos", "basic")
            .with_schedule("1,a,3", "*", "*", "*", "*");
        seed_sft(&h.store, &def, &["ce1.example.org"], &[("smscg", &["/CN=alice"])], &["env"])
            .await
            .unwrap();
        let resolved = resolve_named(h.store.as_ref(), "bad").await.unwrap();
        assert!(matches!(
            SftEvent::new(resolved, h.ctx.clone()),
            Err(DefinitionError::InvalidSchedule { .. })
        ));
    }

    #[tokio::test]
    async fn missing_and_empty_groups_are_reported() {
        let h = Harness::new().unwrap();
        assert!(matches!(
            resolve_named(h.store.as_ref(), "nope").await,
            Err(DefinitionError::MissingSft(_))
        ));

        let def = SftDefinition::new("lonely", "ce-none", "vos", "basic");
        seed_sft(&h.store, &def, &[], &[("smscg", &["/CN=alice"])], &["env"])
            .await
            .unwrap();
        assert!(matches!(
            resolve_named(h.store.as_ref(), "lonely").await,
            Err(DefinitionError::EmptyClusterGroup(_))
        ));

        let dangling = SftDefinition::new("dangling", "no-such-group", "vos", "basic");
        h.store.upsert_sft(&dangling).await.unwrap();
        assert!(matches!(
            resolve_named(h.store.as_ref(), "dangling").await,
            Err(DefinitionError::MissingClusterGroup { .. })
        ));
    }
}
