//! Shared types for SFT definitions, job records and notifications.

pub mod error;

pub use error::*;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A remote compute endpoint, identified by its front-end host name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cluster {
    pub hostname: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl Cluster {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            alias: None,
        }
    }
}

/// A grid user whose delegated credentials are used to submit test jobs.
#[derive(Clone, Serialize, Deserialize)]
pub struct User {
    /// Distinguished name of the user certificate.
    pub dn: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Opaque secret handed to the credential provider (never logged).
    #[serde(skip_serializing)]
    pub secret: String,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("dn", &self.dn)
            .field("display_name", &self.display_name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A virtual organisation with its member users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vo {
    pub name: String,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub users: Vec<User>,
}

/// A single functional test: a name and an opaque job description (xRSL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Test {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterGroup {
    pub name: String,
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoGroup {
    pub name: String,
    pub vos: Vec<Vo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    pub name: String,
    pub tests: Vec<Test>,
}

fn every_value() -> String {
    "*".to_string()
}

/// A named, schedulable site functional test.
///
/// The five schedule fields hold cron-style expressions (see
/// [`crate::scheduler::cron`]) and default to "every value".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SftDefinition {
    pub name: String,
    pub cluster_group: String,
    pub vo_group: String,
    pub test_suite: String,
    #[serde(default = "every_value")]
    pub minute: String,
    #[serde(default = "every_value")]
    pub hour: String,
    #[serde(default = "every_value")]
    pub day: String,
    #[serde(default = "every_value")]
    pub month: String,
    #[serde(default = "every_value")]
    pub day_of_week: String,
}

impl SftDefinition {
    pub fn new(
        name: impl Into<String>,
        cluster_group: impl Into<String>,
        vo_group: impl Into<String>,
        test_suite: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cluster_group: cluster_group.into(),
            vo_group: vo_group.into(),
            test_suite: test_suite.into(),
            minute: every_value(),
            hour: every_value(),
            day: every_value(),
            month: every_value(),
            day_of_week: every_value(),
        }
    }

    /// Builder-style setter for the five schedule fields.
    pub fn with_schedule(
        mut self,
        minute: &str,
        hour: &str,
        day: &str,
        month: &str,
        day_of_week: &str,
    ) -> Self {
        self.minute = minute.to_string();
        self.hour = hour.to_string();
        self.day = day.to_string();
        self.month = month.to_string();
        self.day_of_week = day_of_week.to_string();
        self
    }
}

/// Unique identifier for a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle status of a job row.
///
/// Locally assigned states are lower case, states reported by the grid keep
/// the remote spelling (`FINISHED`, `INLRMS:R`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Accepted by the remote front end, no status queried yet.
    Submitted,
    /// Any non-terminal state reported by the remote system.
    Remote(String),
    GridFinished,
    GridFailed,
    GridKilled,
    GridDeleted,
    /// Submission failed; never retried.
    Failed,
    /// The remote system no longer knows the job.
    Lost,
    /// Output retrieved and classified as a logical success.
    Fetched,
    /// Output retrieved and classified as a logical failure.
    FetchedFailed,
    /// The retrieval tool itself failed; never retried.
    FetchFailed,
    /// Output retrieved but follows no known convention.
    TestFailed,
}

impl JobStatus {
    /// Statuses the publisher never queries again.
    pub const TERMINAL: [JobStatus; 10] = [
        JobStatus::GridFinished,
        JobStatus::GridFailed,
        JobStatus::GridKilled,
        JobStatus::GridDeleted,
        JobStatus::Failed,
        JobStatus::Lost,
        JobStatus::Fetched,
        JobStatus::FetchedFailed,
        JobStatus::FetchFailed,
        JobStatus::TestFailed,
    ];

    /// Grid-terminal statuses whose output is retrieved.
    pub const FETCHABLE: [JobStatus; 3] = [
        JobStatus::GridFinished,
        JobStatus::GridFailed,
        JobStatus::GridKilled,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Remote(state) => state.as_str(),
            JobStatus::GridFinished => "FINISHED",
            JobStatus::GridFailed => "FAILED",
            JobStatus::GridKilled => "KILLED",
            JobStatus::GridDeleted => "DELETED",
            JobStatus::Failed => "failed",
            JobStatus::Lost => "lost",
            JobStatus::Fetched => "fetched",
            JobStatus::FetchedFailed => "fetched_failed",
            JobStatus::FetchFailed => "fetch_failed",
            JobStatus::TestFailed => "test_failed",
        }
    }

    /// Map a state string reported by the remote status tool.
    pub fn from_remote_state(state: &str) -> Self {
        match state.trim() {
            "FINISHED" => JobStatus::GridFinished,
            "FAILED" => JobStatus::GridFailed,
            "KILLED" => JobStatus::GridKilled,
            "DELETED" => JobStatus::GridDeleted,
            other => JobStatus::Remote(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    pub fn is_fetchable(&self) -> bool {
        Self::FETCHABLE.contains(self)
    }

    /// True for grid-terminal states that signal an unsuccessful run.
    pub fn is_grid_failure(&self) -> bool {
        matches!(self, JobStatus::GridFailed | JobStatus::GridKilled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err("empty job status".to_string()),
            "submitted" => Ok(JobStatus::Submitted),
            "failed" => Ok(JobStatus::Failed),
            "lost" => Ok(JobStatus::Lost),
            "fetched" => Ok(JobStatus::Fetched),
            "fetched_failed" => Ok(JobStatus::FetchedFailed),
            "fetch_failed" => Ok(JobStatus::FetchFailed),
            "test_failed" => Ok(JobStatus::TestFailed),
            other => Ok(JobStatus::from_remote_state(other)),
        }
    }
}

/// Classification of the error recorded on a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    /// The submission tool failed or reported failure.
    Submission,
    /// The job failed inside the remote batch system.
    Lrms,
    /// The designated error log was not empty.
    ErrorLog,
    /// The failure marker was found in the log directory.
    LogDir,
    /// Fetched output matched no known convention.
    Unknown,
    /// The retrieval tool failed.
    Fetch,
    /// The remote system no longer knows the job.
    Lost,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Submission => "submission",
            ErrorType::Lrms => "lrms",
            ErrorType::ErrorLog => "stderr",
            ErrorType::LogDir => "gmlog",
            ErrorType::Unknown => "unknown",
            ErrorType::Fetch => "fetch",
            ErrorType::Lost => "lost",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submission" => Ok(ErrorType::Submission),
            "lrms" => Ok(ErrorType::Lrms),
            "stderr" => Ok(ErrorType::ErrorLog),
            "gmlog" => Ok(ErrorType::LogDir),
            "unknown" => Ok(ErrorType::Unknown),
            "fetch" => Ok(ErrorType::Fetch),
            "lost" => Ok(ErrorType::Lost),
            other => Err(format!("unknown error type: {other}")),
        }
    }
}

/// One concrete (cluster, test, VO, user) submission of an SFT occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub sft_name: String,
    pub cluster: String,
    pub vo: String,
    pub test_name: String,
    pub dn: String,
    /// Opaque remote job identifier, present once submission succeeded.
    pub remote_id: Option<String>,
    pub status: JobStatus,
    pub error_type: Option<ErrorType>,
    pub error_msg: Option<String>,
    /// Directory holding the fetched output.
    pub output_dir: Option<String>,
    /// Browsable reference produced by the output indexer.
    pub artifact: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Job {
    fn base(sft: &str, cluster: &str, vo: &str, test: &str, dn: &str, status: JobStatus) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            sft_name: sft.to_string(),
            cluster: cluster.to_string(),
            vo: vo.to_string(),
            test_name: test.to_string(),
            dn: dn.to_string(),
            remote_id: None,
            status,
            error_type: None,
            error_msg: None,
            output_dir: None,
            artifact: None,
            submitted_at: now,
            last_modified: now,
        }
    }

    /// A job accepted by the remote front end.
    pub fn submitted(
        sft: &str,
        cluster: &str,
        vo: &str,
        test: &str,
        dn: &str,
        remote_id: String,
    ) -> Self {
        let mut job = Self::base(sft, cluster, vo, test, dn, JobStatus::Submitted);
        job.remote_id = Some(remote_id);
        job
    }

    /// A job whose submission failed.
    pub fn failed(
        sft: &str,
        cluster: &str,
        vo: &str,
        test: &str,
        dn: &str,
        error_msg: String,
    ) -> Self {
        let mut job = Self::base(sft, cluster, vo, test, dn, JobStatus::Failed);
        job.error_type = Some(ErrorType::Submission);
        job.error_msg = Some(error_msg);
        job
    }

    /// Record a state transition and bump `last_modified`.
    pub fn transition(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.last_modified = now;
    }

    pub fn set_error(&mut self, error_type: ErrorType, message: impl Into<String>) {
        self.error_type = Some(error_type);
        self.error_msg = Some(message.into());
    }
}

/// Severity of a monitoring notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl Severity {
    /// Nagios plugin return code.
    pub fn code(&self) -> u8 {
        match self {
            Severity::Ok => 0,
            Severity::Warning => 1,
            Severity::Critical => 2,
            Severity::Unknown => 3,
        }
    }

    /// Ordering used when several notifications collapse into one.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Ok => 0,
            Severity::Unknown => 1,
            Severity::Warning => 2,
            Severity::Critical => 3,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Ok => "OK",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
            Severity::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Transient status report destined for the monitoring sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Host the report is attributed to.
    pub target: String,
    /// Service name, usually the SFT name.
    pub service: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub perf_data: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        target: impl Into<String>,
        service: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            service: service.into(),
            severity,
            message: message.into(),
            perf_data: None,
            created_at: Utc::now(),
        }
    }

    pub fn ok(target: &str, service: &str, message: impl Into<String>) -> Self {
        Self::new(target, service, Severity::Ok, message)
    }

    pub fn warning(target: &str, service: &str, message: impl Into<String>) -> Self {
        Self::new(target, service, Severity::Warning, message)
    }

    pub fn critical(target: &str, service: &str, message: impl Into<String>) -> Self {
        Self::new(target, service, Severity::Critical, message)
    }

    pub fn unknown(target: &str, service: &str, message: impl Into<String>) -> Self {
        Self::new(target, service, Severity::Unknown, message)
    }

    pub fn with_perf_data(mut self, perf_data: impl Into<String>) -> Self {
        self.perf_data = Some(perf_data.into());
        self
    }

    /// Deduplication key.
    pub fn key(&self) -> (String, String) {
        (self.target.clone(), self.service.clone())
    }
}

/// A scheduled downtime window, authored in local time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DowntimeWindow {
    pub host: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl DowntimeWindow {
    /// Both ends of the window are inclusive.
    pub fn contains(&self, now: NaiveDateTime) -> bool {
        self.start <= now && now <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn job_status_string_roundtrip() {
        for status in [
            JobStatus::Submitted,
            JobStatus::Remote("INLRMS:R".to_string()),
            JobStatus::GridFinished,
            JobStatus::GridFailed,
            JobStatus::GridKilled,
            JobStatus::GridDeleted,
            JobStatus::Failed,
            JobStatus::Lost,
            JobStatus::Fetched,
            JobStatus::FetchedFailed,
            JobStatus::FetchFailed,
            JobStatus::TestFailed,
        ] {
            let parsed: JobStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn local_failed_and_grid_failed_are_distinct() {
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert_eq!("FAILED".parse::<JobStatus>().unwrap(), JobStatus::GridFailed);
    }

    #[test]
    fn terminal_and_fetchable_sets() {
        assert!(!JobStatus::Submitted.is_terminal());
        assert!(!JobStatus::Remote("PREPARING".into()).is_terminal());
        assert!(JobStatus::GridFinished.is_terminal());
        assert!(JobStatus::GridFinished.is_fetchable());
        assert!(JobStatus::GridKilled.is_fetchable());
        assert!(!JobStatus::GridDeleted.is_fetchable());
        assert!(!JobStatus::Fetched.is_fetchable());
    }

    #[test]
    fn failed_job_carries_submission_error() {
        let job = Job::failed("nightly", "ce.example.org", "smscg", "env", "/CN=x", "boom".into());
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_type, Some(ErrorType::Submission));
        assert!(job.remote_id.is_none());
    }

    #[test]
    fn severity_codes_follow_nagios() {
        assert_eq!(Severity::Ok.code(), 0);
        assert_eq!(Severity::Critical.code(), 2);
        assert_eq!(Severity::Unknown.code(), 3);
        assert!(Severity::Critical.rank() > Severity::Warning.rank());
    }

    #[test]
    fn downtime_window_is_inclusive() {
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let window = DowntimeWindow {
            host: "ce.example.org".into(),
            start: day.and_hms_opt(8, 0, 0).unwrap(),
            end: day.and_hms_opt(12, 0, 0).unwrap(),
        };
        assert!(window.contains(day.and_hms_opt(8, 0, 0).unwrap()));
        assert!(window.contains(day.and_hms_opt(12, 0, 0).unwrap()));
        assert!(!window.contains(day.and_hms_opt(12, 0, 1).unwrap()));
    }

    #[test]
    fn user_debug_redacts_secret() {
        let user = User {
            dn: "/CN=tester".into(),
            display_name: None,
            secret: "hunter2".into(),
        };
        assert!(!format!("{user:?}").contains("hunter2"));
    }
}
