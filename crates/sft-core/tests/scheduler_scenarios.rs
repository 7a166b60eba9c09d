//! End-to-end scenarios for the SFT engine
//!
//! These drive the housekeeper, events, publisher and scheduler together
//! over an in-memory store, with every external tool replaced by the fakes
//! from `sft_core::testing`:
//! - scheduled submission with a cluster in downtime
//! - the full job lifecycle from submission to classified output
//! - retention of old job rows

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use sft_core::config::SchedulerConfig;
use sft_core::scheduler::Scheduler;
use sft_core::testing::{seed_sft, Harness};
use sft_core::types::{DowntimeWindow, ErrorType, JobStatus, Severity, SftDefinition};
use sft_core::JobStore;
use std::sync::Arc;
use std::time::Duration;

/// Schedules are matched on UTC.
fn utc(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 12, h, m, 0).unwrap()
}

/// Site-local wall clock, one hour ahead of UTC. Downtime windows use it.
fn local(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 12)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

async fn nightly(h: &Harness) {
    let def = SftDefinition::new("nightly", "ce-all", "swiss", "basic")
        .with_schedule("0", "2", "*", "*", "*");
    seed_sft(
        &h.store,
        &def,
        &["ce1.example.org", "ce2.example.org"],
        &[("smscg", &["/DC=ch/CN=alice"])],
        &["env", "hostname"],
    )
    .await
    .unwrap();
    // 02:00 UTC is 03:00 local
    h.downtime.set(vec![DowntimeWindow {
        host: "ce2.example.org".into(),
        start: local(2, 30),
        end: local(4, 0),
    }]);
}

fn scheduler(h: &Harness, jobs_dir: &std::path::Path) -> Scheduler {
    let config = SchedulerConfig {
        cycle: Duration::from_secs(60),
        workers: 1,
        publish_every: 1,
        refresh_period: 10,
        dequeue_wait: Duration::from_millis(10),
    };
    Scheduler::new(
        config,
        h.housekeeper(10, Duration::from_secs(2880 * 60)),
        Arc::new(h.publisher(jobs_dir)),
        h.notifier.clone(),
    )
}

// ============================================================================
// Scheduled submission
// ============================================================================

#[tokio::test]
async fn test_nightly_submits_to_clusters_not_in_downtime() {
    let h = Harness::new().unwrap();
    nightly(&h).await;

    let mut housekeeper = h.housekeeper(10, Duration::from_secs(3600));
    housekeeper.tick(local(3, 0), utc(2, 0)).await;
    let event = housekeeper.events()[0].clone();

    let report = event.check_exec(&utc(2, 0).naive_utc()).await.unwrap();
    assert_eq!(report.submitted, 2);

    let jobs = h.store.list_jobs(Some("nightly"), 100).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Submitted));
    assert!(jobs.iter().all(|j| j.cluster == "ce1.example.org"));
    let mut tests: Vec<_> = jobs.iter().map(|j| j.test_name.clone()).collect();
    tests.sort();
    assert_eq!(tests, vec!["env".to_string(), "hostname".to_string()]);

    assert!(event.check_exec(&utc(2, 1).naive_utc()).await.is_none());
    assert_eq!(h.store.list_jobs(None, 100).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_exit_zero_with_failure_marker_is_failed_job() {
    let h = Harness::new().unwrap();
    nightly(&h).await;
    h.remote.fail_submissions_on("ce1.example.org");

    let mut housekeeper = h.housekeeper(10, Duration::from_secs(3600));
    housekeeper.tick(local(3, 0), utc(2, 0)).await;
    housekeeper.events()[0].run().await;

    let jobs = h.store.list_jobs(None, 100).await.unwrap();
    assert_eq!(jobs.len(), 2);
    for job in &jobs {
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_type, Some(ErrorType::Submission));
        assert!(job.error_msg.as_deref().unwrap().contains("Job submission failed"));
    }

    // a failed submission is never polled
    let dir = tempfile::tempdir().unwrap();
    let pass = h.publisher(dir.path()).run().await;
    assert_eq!(pass.polled, 0);
}

// ============================================================================
// Job lifecycle
// ============================================================================

#[tokio::test]
async fn test_scheduler_cycle_runs_submission_then_publication() {
    let h = Harness::new().unwrap();
    nightly(&h).await;
    let dir = tempfile::tempdir().unwrap();
    let s = scheduler(&h, dir.path());

    let cycle = s.run_cycle(0, utc(2, 0), local(3, 0)).await;
    assert_eq!(cycle.enqueued, vec!["nightly".to_string()]);
    assert_eq!(cycle.housekeeping.clusters_down, 1);
    assert_eq!(s.drain().await, 1);

    let jobs = h.store.list_jobs(Some("nightly"), 100).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.cluster == "ce1.example.org"));

    for job in &jobs {
        let id = job.remote_id.clone().unwrap();
        h.remote.set_status(&id, "FINISHED");
        h.remote.set_output(&id, &[("stderr.txt", ""), ("stdout.txt", "ok\n")]);
    }
    let cycle = s.run_cycle(1, utc(2, 5), local(3, 5)).await;
    let pass = cycle.publisher.unwrap();
    assert_eq!(pass.fetched, 2);

    for job in &jobs {
        let job = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Fetched);
        assert!(job.artifact.is_some());
    }
}

#[tokio::test]
async fn test_grid_failed_job_with_empty_error_log_is_fetched() {
    let h = Harness::new().unwrap();
    h.add_user("/DC=ch/CN=alice", &["smscg"]).await;
    let job = sft_core::Job::submitted(
        "nightly",
        "ce1.example.org",
        "smscg",
        "env",
        "/DC=ch/CN=alice",
        "gsiftp://ce1.example.org:2811/jobs/77".into(),
    );
    h.store.insert_job(&job).await.unwrap();
    h.remote.set_status("gsiftp://ce1.example.org:2811/jobs/77", "FAILED");
    h.remote.set_output("gsiftp://ce1.example.org:2811/jobs/77", &[("stderr.txt", "")]);

    let dir = tempfile::tempdir().unwrap();
    let pass = h.publisher(dir.path()).run().await;
    assert_eq!(pass.transitioned, 1);
    assert_eq!(pass.fetched, 1);

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Fetched);
    assert!(dir.path().join("77").join("stderr.txt").is_file());

    let last = h.notifier.notifications().pop().unwrap();
    assert_eq!(last.target, "ce1.example.org");
    assert_eq!(last.service, "nightly");
    assert_eq!(last.severity, Severity::Ok);
}

#[tokio::test]
async fn test_lost_job_is_never_polled_again() {
    let h = Harness::new().unwrap();
    h.add_user("/DC=ch/CN=alice", &["smscg"]).await;
    let job = sft_core::Job::submitted(
        "nightly",
        "ce1.example.org",
        "smscg",
        "env",
        "/DC=ch/CN=alice",
        "gsiftp://ce1.example.org:2811/jobs/9".into(),
    );
    h.store.insert_job(&job).await.unwrap();
    h.remote.set_status_error(
        "gsiftp://ce1.example.org:2811/jobs/9",
        sft_core::RemoteToolError::job_unknown("Job not found"),
    );

    let dir = tempfile::tempdir().unwrap();
    let publisher = h.publisher(dir.path());
    assert_eq!(publisher.run().await.lost, 1);
    assert_eq!(publisher.run().await.polled, 0);
    assert_eq!(h.remote.status_calls(), 1);
}

// ============================================================================
// Retention
// ============================================================================

#[tokio::test]
async fn test_refresh_purges_jobs_past_retention() {
    let h = Harness::new().unwrap();
    nightly(&h).await;
    let now = Utc::now();

    let mut old = sft_core::Job::submitted("nightly", "ce1", "smscg", "env", "/CN=a", "x/1".into());
    old.transition(JobStatus::Fetched, now - chrono::Duration::hours(3));
    let mut fresh = sft_core::Job::submitted("nightly", "ce1", "smscg", "env", "/CN=a", "x/2".into());
    fresh.transition(JobStatus::Fetched, now - chrono::Duration::minutes(30));
    h.store.insert_job(&old).await.unwrap();
    h.store.insert_job(&fresh).await.unwrap();

    let mut housekeeper = h.housekeeper(10, Duration::from_secs(2 * 3600));
    let report = housekeeper.tick(local(12, 0), now).await;
    assert_eq!(report.purged_jobs, 1);
    assert_eq!(report.events, Some(1));

    let left = h.store.list_jobs(None, 10).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, fresh.id);
}
