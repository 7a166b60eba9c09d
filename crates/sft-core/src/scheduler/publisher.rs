//! Job status poller and output fetcher.
//!
//! One [`Publisher::run`] pass first polls every non-terminal job for its
//! remote state, then fetches and classifies every job that reached a
//! grid-terminal state. Each job handled yields exactly one notification
//! keyed by (cluster, SFT).
//!
//! Credentials are cached per (DN, VO) for the duration of a single pass
//! only; both the positive and the negative cache start empty every pass.

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::classify::{OutputClassifier, Verdict};
use super::event::EventContext;
use crate::credentials::Credential;
use crate::indexer::OutputIndexer;
use crate::types::{ErrorType, Job, JobStatus, Notification, RemoteToolErrorKind, Severity};

/// Counters for one publisher pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub polled: usize,
    /// Jobs whose status changed during polling.
    pub transitioned: usize,
    pub lost: usize,
    pub poll_errors: usize,
    pub fetched: usize,
    pub fetched_failed: usize,
    pub fetch_failed: usize,
    pub test_failed: usize,
    /// Jobs left untouched because no credential was available.
    pub credential_skips: usize,
    pub store_errors: usize,
}

type PairKey = (String, String);

/// Per-pass credential cache keyed by (DN, VO).
#[derive(Default)]
struct CredentialCache {
    good: HashMap<PairKey, Credential>,
    bad: HashMap<PairKey, (Severity, String)>,
}

impl CredentialCache {
    async fn get(&mut self, ctx: &EventContext, job: &Job) -> Result<Credential, (Severity, String)> {
        let key = (job.dn.clone(), job.vo.clone());
        if let Some(credential) = self.good.get(&key) {
            return Ok(credential.clone());
        }
        if let Some(failure) = self.bad.get(&key) {
            return Err(failure.clone());
        }

        let outcome = match ctx.definitions.get_user(&job.dn).await {
            Ok(Some(user)) => ctx
                .credentials
                .acquire(&user, &job.vo)
                .await
                .map_err(|e| (Severity::Critical, format!("no credential for {} in {}: {e}", job.dn, job.vo))),
            Ok(None) => Err((
                Severity::Unknown,
                format!("user {} is no longer registered", job.dn),
            )),
            Err(e) => Err((Severity::Unknown, format!("cannot look up user {}: {e}", job.dn))),
        };

        match outcome {
            Ok(credential) => {
                self.good.insert(key, credential.clone());
                Ok(credential)
            }
            Err(failure) => {
                tracing::warn!(dn = %job.dn, vo = %job.vo, "credential unavailable for this pass: {}", failure.1);
                self.bad.insert(key, failure.clone());
                Err(failure)
            }
        }
    }
}

pub struct Publisher {
    ctx: Arc<EventContext>,
    indexer: Arc<dyn OutputIndexer>,
    classifier: OutputClassifier,
    jobs_dir: PathBuf,
}

impl Publisher {
    pub fn new(
        ctx: Arc<EventContext>,
        indexer: Arc<dyn OutputIndexer>,
        classifier: OutputClassifier,
        jobs_dir: PathBuf,
    ) -> Self {
        Self {
            ctx,
            indexer,
            classifier,
            jobs_dir,
        }
    }

    /// One full poll + fetch pass.
    pub async fn run(&self) -> PassReport {
        let mut report = PassReport::default();
        let mut cache = CredentialCache::default();
        self.poll(&mut cache, &mut report).await;
        self.fetch(&mut cache, &mut report).await;
        tracing::info!(
            polled = report.polled,
            transitioned = report.transitioned,
            lost = report.lost,
            fetched = report.fetched,
            fetched_failed = report.fetched_failed,
            fetch_failed = report.fetch_failed,
            test_failed = report.test_failed,
            credential_skips = report.credential_skips,
            "publisher pass complete"
        );
        report
    }

    fn notify(&self, job: &Job, severity: Severity, message: String) {
        self.ctx.notifier.add(Notification::new(
            job.cluster.as_str(),
            job.sft_name.as_str(),
            severity,
            format!("{}: {message}", job.test_name),
        ));
    }

    async fn save(&self, job: &Job, report: &mut PassReport) {
        if let Err(e) = self.ctx.jobs.update_job(job).await {
            tracing::error!(job_id = %job.id, sft = %job.sft_name, "failed to update job: {}", e);
            report.store_errors += 1;
        }
    }

    async fn poll(&self, cache: &mut CredentialCache, report: &mut PassReport) {
        let jobs = match self.ctx.jobs.list_pollable_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!("Publisher: failed to list pollable jobs: {}", e);
                report.store_errors += 1;
                return;
            }
        };

        for mut job in jobs {
            let Some(remote_id) = job.remote_id.clone() else {
                continue;
            };
            report.polled += 1;

            let credential = match cache.get(&self.ctx, &job).await {
                Ok(credential) => credential,
                Err((severity, message)) => {
                    report.credential_skips += 1;
                    self.notify(&job, severity, message);
                    continue;
                }
            };

            match self.ctx.remote.status(&remote_id, &credential).await {
                Ok(state) => {
                    let status = JobStatus::from_remote_state(&state);
                    let severity = if status == JobStatus::GridDeleted {
                        Severity::Warning
                    } else {
                        Severity::Ok
                    };
                    if status != job.status {
                        tracing::info!(
                            job_id = %job.id,
                            cluster = %job.cluster,
                            from = %job.status,
                            to = %status,
                            "job status changed"
                        );
                        job.transition(status, Utc::now());
                        report.transitioned += 1;
                        self.save(&job, report).await;
                    }
                    self.notify(&job, severity, format!("job {remote_id} is {}", job.status));
                }
                Err(e) if e.kind == RemoteToolErrorKind::JobUnknown => {
                    tracing::warn!(job_id = %job.id, cluster = %job.cluster, "job unknown to remote system, marking lost");
                    job.transition(JobStatus::Lost, Utc::now());
                    job.set_error(ErrorType::Lost, e.message.clone());
                    report.lost += 1;
                    self.save(&job, report).await;
                    self.notify(&job, Severity::Critical, format!("job {remote_id} lost: {}", e.message));
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, cluster = %job.cluster, "status query failed: {}", e);
                    report.poll_errors += 1;
                    self.notify(&job, Severity::Warning, format!("status of {remote_id} unavailable: {e}"));
                }
            }
        }
    }

    async fn fetch(&self, cache: &mut CredentialCache, report: &mut PassReport) {
        let jobs = match self.ctx.jobs.list_fetchable_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!("Publisher: failed to list fetchable jobs: {}", e);
                report.store_errors += 1;
                return;
            }
        };

        for mut job in jobs {
            let Some(remote_id) = job.remote_id.clone() else {
                continue;
            };

            let credential = match cache.get(&self.ctx, &job).await {
                Ok(credential) => credential,
                Err((severity, message)) => {
                    report.credential_skips += 1;
                    self.notify(&job, severity, message);
                    continue;
                }
            };

            let (severity, message) = match self
                .ctx
                .remote
                .fetch(&remote_id, &self.jobs_dir, &credential)
                .await
            {
                Ok(dir) => self.record_output(&mut job, dir, report).await,
                Err(e) => {
                    tracing::error!(job_id = %job.id, cluster = %job.cluster, "fetching output failed: {}", e);
                    job.transition(JobStatus::FetchFailed, Utc::now());
                    job.set_error(ErrorType::Fetch, e.to_string());
                    report.fetch_failed += 1;
                    (Severity::Critical, format!("fetching {remote_id} failed: {e}"))
                }
            };

            self.save(&job, report).await;
            self.notify(&job, severity, message);
        }
    }

    /// Classify fetched output, then index it. Indexing renames files, so
    /// classification must come first.
    async fn record_output(
        &self,
        job: &mut Job,
        dir: PathBuf,
        report: &mut PassReport,
    ) -> (Severity, String) {
        let grid_status = job.status.clone();
        job.output_dir = Some(dir.display().to_string());

        let (status, severity, message) = match self.classifier.classify(&dir) {
            Ok(Verdict::Passed(convention)) => {
                report.fetched += 1;
                (
                    JobStatus::Fetched,
                    Severity::Ok,
                    format!("passed ({} convention)", convention.error_type()),
                )
            }
            Ok(Verdict::Failed { convention, reason }) => {
                report.fetched_failed += 1;
                let message = format!("failed: {reason}");
                job.set_error(convention.error_type(), reason);
                (JobStatus::FetchedFailed, Severity::Critical, message)
            }
            Err(e) if grid_status.is_grid_failure() => {
                report.fetched_failed += 1;
                job.set_error(
                    ErrorType::Lrms,
                    format!("job ended {grid_status} in the batch system; {e}"),
                );
                (
                    JobStatus::FetchedFailed,
                    Severity::Critical,
                    format!("job ended {grid_status} in the batch system"),
                )
            }
            Err(e) => {
                report.test_failed += 1;
                job.set_error(ErrorType::Unknown, e.to_string());
                (
                    JobStatus::TestFailed,
                    Severity::Critical,
                    format!("unrecognised output: {e}"),
                )
            }
        };
        tracing::info!(job_id = %job.id, cluster = %job.cluster, status = %status, "job output classified");
        job.transition(status, Utc::now());

        job.artifact = match self.indexer.index(&dir).await {
            Ok(reference) => Some(reference),
            Err(e) => {
                tracing::error!(job_id = %job.id, dir = %dir.display(), "indexing output failed: {}", e);
                Some(format!("{} (indexer error)", dir.display()))
            }
        };
        (severity, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobStore;
    use crate::testing::Harness;
    use crate::types::RemoteToolError;

    async fn submitted(h: &Harness, cluster: &str, dn: &str, remote_id: &str) -> Job {
        let job = Job::submitted("nightly", cluster, "smscg", "env", dn, remote_id.to_string());
        h.store.insert_job(&job).await.unwrap();
        job
    }

    async fn reload(h: &Harness, job: &Job) -> Job {
        h.store.get_job(job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn poll_moves_jobs_through_remote_states() {
        let h = Harness::new().unwrap();
        h.add_user("/CN=alice", &["smscg"]).await;
        let running = submitted(&h, "ce1", "/CN=alice", "gsiftp://ce1/jobs/1").await;
        let done = submitted(&h, "ce1", "/CN=alice", "gsiftp://ce1/jobs/2").await;
        h.remote.set_status("gsiftp://ce1/jobs/1", "INLRMS:R");
        h.remote.set_status("gsiftp://ce1/jobs/2", "DELETED");

        let dir = tempfile::tempdir().unwrap();
        let report = h.publisher(dir.path()).run().await;
        assert_eq!(report.polled, 2);
        assert_eq!(report.transitioned, 2);
        assert_eq!(
            reload(&h, &running).await.status,
            JobStatus::Remote("INLRMS:R".into())
        );
        assert_eq!(reload(&h, &done).await.status, JobStatus::GridDeleted);
        // one credential acquisition for the shared (DN, VO) pair
        assert_eq!(h.credentials.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_job_becomes_lost_other_errors_retry() {
        let h = Harness::new().unwrap();
        h.add_user("/CN=alice", &["smscg"]).await;
        let gone = submitted(&h, "ce1", "/CN=alice", "gsiftp://ce1/jobs/1").await;
        let flaky = submitted(&h, "ce2", "/CN=alice", "gsiftp://ce2/jobs/2").await;
        h.remote.set_status_error("gsiftp://ce1/jobs/1", RemoteToolError::job_unknown("Job not found"));
        h.remote.set_status_error("gsiftp://ce2/jobs/2", RemoteToolError::timeout("arcstat timed out"));

        let dir = tempfile::tempdir().unwrap();
        let report = h.publisher(dir.path()).run().await;
        assert_eq!(report.lost, 1);
        assert_eq!(report.poll_errors, 1);

        let gone = reload(&h, &gone).await;
        assert_eq!(gone.status, JobStatus::Lost);
        assert_eq!(gone.error_type, Some(ErrorType::Lost));
        let flaky = reload(&h, &flaky).await;
        assert_eq!(flaky.status, JobStatus::Submitted);
        assert_eq!(flaky.error_type, None);

        let notes = h.notifier.notifications();
        assert_eq!(notes.len(), 2);
        assert!(notes.iter().any(|n| n.target == "ce1" && n.severity == Severity::Critical));
        assert!(notes.iter().any(|n| n.target == "ce2" && n.severity == Severity::Warning));
    }

    #[tokio::test]
    async fn credential_failure_is_cached_for_the_pass_only() {
        let h = Harness::new().unwrap();
        h.add_user("/CN=bob", &["smscg"]).await;
        h.credentials.deny("/CN=bob");
        let a = submitted(&h, "ce1", "/CN=bob", "gsiftp://ce1/jobs/1").await;
        submitted(&h, "ce2", "/CN=bob", "gsiftp://ce2/jobs/2").await;

        let dir = tempfile::tempdir().unwrap();
        let publisher = h.publisher(dir.path());
        let report = publisher.run().await;
        assert_eq!(report.credential_skips, 2);
        assert_eq!(h.credentials.calls(), 1);
        assert_eq!(h.remote.status_calls(), 0);
        assert_eq!(reload(&h, &a).await.status, JobStatus::Submitted);

        publisher.run().await;
        assert_eq!(h.credentials.calls(), 2);
    }

    #[tokio::test]
    async fn unregistered_user_reports_unknown() {
        let h = Harness::new().unwrap();
        submitted(&h, "ce1", "/CN=ghost", "gsiftp://ce1/jobs/1").await;

        let dir = tempfile::tempdir().unwrap();
        let report = h.publisher(dir.path()).run().await;
        assert_eq!(report.credential_skips, 1);
        assert_eq!(h.credentials.calls(), 0);
        let notes = h.notifier.notifications();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity, Severity::Unknown);
    }

    async fn finished(h: &Harness, state: &str, files: &[(&str, &str)]) -> Job {
        h.add_user("/CN=alice", &["smscg"]).await;
        let job = submitted(h, "ce1", "/CN=alice", "gsiftp://ce1:2811/jobs/abc").await;
        h.remote.set_status("gsiftp://ce1:2811/jobs/abc", state);
        h.remote.set_output("gsiftp://ce1:2811/jobs/abc", files);
        job
    }

    #[tokio::test]
    async fn non_empty_error_log_is_logical_failure() {
        let h = Harness::new().unwrap();
        let job = finished(&h, "FINISHED", &[("stderr.txt", "command not found\n")]).await;

        let dir = tempfile::tempdir().unwrap();
        let report = h.publisher(dir.path()).run().await;
        assert_eq!(report.fetched_failed, 1);

        let job = reload(&h, &job).await;
        assert_eq!(job.status, JobStatus::FetchedFailed);
        assert_eq!(job.error_type, Some(ErrorType::ErrorLog));
        assert_eq!(
            job.output_dir.as_deref(),
            Some(dir.path().join("abc").display().to_string().as_str())
        );
        assert_eq!(job.artifact.as_deref(), Some("indexed/abc/index.html"));
    }

    #[tokio::test]
    async fn grid_failure_with_clean_error_log_is_fetched() {
        let h = Harness::new().unwrap();
        let job = finished(&h, "FAILED", &[("stderr.txt", "")]).await;

        let dir = tempfile::tempdir().unwrap();
        h.publisher(dir.path()).run().await;
        let job = reload(&h, &job).await;
        assert_eq!(job.status, JobStatus::Fetched);
        assert_eq!(job.error_type, None);
    }

    #[tokio::test]
    async fn unrecognised_output_depends_on_grid_state() {
        let h = Harness::new().unwrap();
        let job = finished(&h, "FINISHED", &[("stdout.txt", "hi")]).await;
        let dir = tempfile::tempdir().unwrap();
        h.publisher(dir.path()).run().await;
        let job = reload(&h, &job).await;
        assert_eq!(job.status, JobStatus::TestFailed);
        assert_eq!(job.error_type, Some(ErrorType::Unknown));

        let h = Harness::new().unwrap();
        let job = finished(&h, "KILLED", &[("stdout.txt", "hi")]).await;
        let dir = tempfile::tempdir().unwrap();
        h.publisher(dir.path()).run().await;
        let job = reload(&h, &job).await;
        assert_eq!(job.status, JobStatus::FetchedFailed);
        assert_eq!(job.error_type, Some(ErrorType::Lrms));
    }

    #[tokio::test]
    async fn fetch_tool_failure_is_terminal() {
        let h = Harness::new().unwrap();
        let job = finished(&h, "FINISHED", &[]).await;
        h.remote.fail_fetch("gsiftp://ce1:2811/jobs/abc");

        let dir = tempfile::tempdir().unwrap();
        let publisher = h.publisher(dir.path());
        let report = publisher.run().await;
        assert_eq!(report.fetch_failed, 1);
        let reloaded = reload(&h, &job).await;
        assert_eq!(reloaded.status, JobStatus::FetchFailed);
        assert_eq!(reloaded.error_type, Some(ErrorType::Fetch));

        // never retried
        let report = publisher.run().await;
        assert_eq!(report.fetch_failed, 0);
        assert_eq!(report.polled, 0);
    }

    #[tokio::test]
    async fn indexer_failure_keeps_outcome() {
        let h = Harness::new().unwrap();
        let job = finished(&h, "FINISHED", &[("stderr.txt", "")]).await;
        h.indexer.fail();

        let dir = tempfile::tempdir().unwrap();
        h.publisher(dir.path()).run().await;
        let job = reload(&h, &job).await;
        assert_eq!(job.status, JobStatus::Fetched);
        assert!(job.artifact.unwrap().ends_with("(indexer error)"));
    }

    #[tokio::test]
    async fn one_notification_per_job_outcome() {
        let h = Harness::new().unwrap();
        finished(&h, "FINISHED", &[("stderr.txt", "")]).await;

        let dir = tempfile::tempdir().unwrap();
        h.publisher(dir.path()).run().await;
        // poll moved it to FINISHED, fetch classified it
        let notes = h.notifier.notifications();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[1].severity, Severity::Ok);
        assert_eq!(notes[1].target, "ce1");
        assert_eq!(notes[1].service, "nightly");
    }
}
