//! In-process fakes for every collaborator, for unit and integration tests.
//!
//! Compiled for this crate's tests and behind the `test-utils` feature.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ClassificationConfig;
use crate::credentials::{Credential, CredentialProvider, FirstSelector};
use crate::indexer::{IndexerError, OutputIndexer};
use crate::notifier::{FlushReport, Notifier};
use crate::remote::arc::output_dir_for;
use crate::remote::RemoteJobControl;
use crate::scheduler::{Clock, EventContext, Housekeeper, OutputClassifier, Publisher};
use crate::store::{DowntimeSource, SqliteStore, StoreError};
use crate::types::{
    Cluster, CredentialError, DowntimeWindow, Notification, RemoteToolError, SftDefinition, Test,
    User,
};

/// Credential provider that succeeds unless the DN was denied.
#[derive(Default)]
pub struct FakeCredentials {
    denied: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl FakeCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, dn: &str) {
        self.denied.lock().insert(dn.to_string());
    }

    pub fn allow(&self, dn: &str) {
        self.denied.lock().remove(dn);
    }

    /// Number of `acquire` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn acquire(&self, user: &User, vo: &str) -> Result<Credential, CredentialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.denied.lock().contains(&user.dn) {
            return Err(CredentialError::denied(format!("{} refused by VOMS", user.dn)));
        }
        Ok(Credential {
            identity: user.dn.clone(),
            vo: vo.to_string(),
            proxy_path: PathBuf::from(format!("/fake/proxies/{vo}")),
        })
    }
}

/// Remote job control backed by in-memory tables.
///
/// Submissions are numbered `gsiftp://<host>:2811/jobs/<n>`. Jobs without a
/// configured status report `INLRMS:R`.
#[derive(Default)]
pub struct FakeRemote {
    next_id: AtomicUsize,
    failing_hosts: Mutex<HashSet<String>>,
    panicking_hosts: Mutex<HashSet<String>>,
    statuses: Mutex<HashMap<String, Result<String, RemoteToolError>>>,
    outputs: Mutex<HashMap<String, Vec<(String, String)>>>,
    failing_fetches: Mutex<HashSet<String>>,
    submissions: Mutex<Vec<(String, String)>>,
    status_calls: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submissions to `host` report a failure marker despite a zero exit.
    pub fn fail_submissions_on(&self, host: &str) {
        self.failing_hosts.lock().insert(host.to_string());
    }

    /// Submissions to `host` panic inside the submitting task.
    pub fn panic_on_submit(&self, host: &str) {
        self.panicking_hosts.lock().insert(host.to_string());
    }

    pub fn set_status(&self, remote_id: &str, state: &str) {
        self.statuses
            .lock()
            .insert(remote_id.to_string(), Ok(state.to_string()));
    }

    pub fn set_status_error(&self, remote_id: &str, error: RemoteToolError) {
        self.statuses.lock().insert(remote_id.to_string(), Err(error));
    }

    /// Files (relative path, content) written into the job directory on fetch.
    pub fn set_output(&self, remote_id: &str, files: &[(&str, &str)]) {
        self.outputs.lock().insert(
            remote_id.to_string(),
            files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
        );
    }

    pub fn fail_fetch(&self, remote_id: &str) {
        self.failing_fetches.lock().insert(remote_id.to_string());
    }

    /// (cluster, test) for every submission attempt, in order.
    pub fn submissions(&self) -> Vec<(String, String)> {
        self.submissions.lock().clone()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteJobControl for FakeRemote {
    async fn submit(
        &self,
        cluster: &Cluster,
        test: &Test,
        _credential: &Credential,
    ) -> Result<String, RemoteToolError> {
        self.submissions
            .lock()
            .push((cluster.hostname.clone(), test.name.clone()));
        let panics = self.panicking_hosts.lock().contains(&cluster.hostname);
        if panics {
            panic!("submission tool crashed on {}", cluster.hostname);
        }
        if self.failing_hosts.lock().contains(&cluster.hostname) {
            return Err(RemoteToolError::logical(
                "Job submission failed due to: no matching queue",
            ));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("gsiftp://{}:2811/jobs/{n}", cluster.hostname))
    }

    async fn status(
        &self,
        remote_id: &str,
        _credential: &Credential,
    ) -> Result<String, RemoteToolError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .get(remote_id)
            .cloned()
            .unwrap_or_else(|| Ok("INLRMS:R".to_string()))
    }

    async fn fetch(
        &self,
        remote_id: &str,
        destination: &Path,
        _credential: &Credential,
    ) -> Result<PathBuf, RemoteToolError> {
        if self.failing_fetches.lock().contains(remote_id) {
            return Err(RemoteToolError::invocation(format!(
                "arcget: failed to download {remote_id}"
            )));
        }
        let dir = output_dir_for(destination, remote_id);
        let files = self.outputs.lock().get(remote_id).cloned().unwrap_or_default();
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            for (rel, content) in &files {
                let path = dir.join(rel);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, content)?;
            }
            Ok(())
        };
        write().map_err(|e| RemoteToolError::invocation(e.to_string()))?;
        Ok(dir)
    }
}

/// Notifier that keeps every notification ever added.
#[derive(Default)]
pub struct RecordingNotifier {
    history: Mutex<Vec<Notification>>,
    pending: Mutex<Vec<Notification>>,
    flushes: AtomicUsize,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// All notifications in the order they were added, flushed or not.
    pub fn notifications(&self) -> Vec<Notification> {
        self.history.lock().clone()
    }

    pub fn pending(&self) -> Vec<Notification> {
        self.pending.lock().clone()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn add(&self, notification: Notification) {
        self.history.lock().push(notification.clone());
        self.pending.lock().push(notification);
    }

    async fn flush(&self) -> FlushReport {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        let batch = std::mem::take(&mut *self.pending.lock());
        let keys: BTreeMap<_, _> = batch.iter().map(|n| (n.key(), ())).collect();
        FlushReport {
            channel: "recording".to_string(),
            delivered: keys.len(),
            collapsed: batch.len() - keys.len(),
            success: true,
            error: None,
        }
    }
}

/// Indexer returning `indexed/<dir name>/index.html` without touching files.
#[derive(Default)]
pub struct FakeIndexer {
    failing: AtomicBool,
}

impl FakeIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl OutputIndexer for FakeIndexer {
    async fn index(&self, dir: &Path) -> Result<String, IndexerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(IndexerError::Walk(format!("{} unreadable", dir.display())));
        }
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!("indexed/{name}/index.html"))
    }
}

/// Downtime source with a settable window list.
#[derive(Default)]
pub struct StaticDowntime {
    windows: Mutex<Vec<DowntimeWindow>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl StaticDowntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, windows: Vec<DowntimeWindow>) {
        *self.windows.lock() = windows;
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every lookup take at least `delay`.
    pub fn slow(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }
}

#[async_trait]
impl DowntimeSource for StaticDowntime {
    async fn downtime_windows(&self) -> Result<Vec<DowntimeWindow>, StoreError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Sqlite("downtime table unavailable".to_string()));
        }
        Ok(self.windows.lock().clone())
    }
}

/// Clock frozen at a settable instant, with local time a fixed offset
/// away from UTC.
pub struct FixedClock {
    utc: Mutex<DateTime<Utc>>,
    local_offset: chrono::Duration,
}

impl FixedClock {
    pub fn new(utc: DateTime<Utc>, local_offset: chrono::Duration) -> Self {
        Self {
            utc: Mutex::new(utc),
            local_offset,
        }
    }

    pub fn set(&self, utc: DateTime<Utc>) {
        *self.utc.lock() = utc;
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.utc.lock()
    }

    fn now_local(&self) -> NaiveDateTime {
        self.utc.lock().naive_utc() + self.local_offset
    }
}

/// Store an SFT together with every entity it references.
///
/// `vos` lists each VO with the DNs of its users. Tests get a trivial
/// description.
pub async fn seed_sft(
    store: &SqliteStore,
    definition: &SftDefinition,
    clusters: &[&str],
    vos: &[(&str, &[&str])],
    tests: &[&str],
) -> Result<(), StoreError> {
    for host in clusters {
        store.upsert_cluster(&Cluster::new(*host)).await?;
    }
    let hosts: Vec<String> = clusters.iter().map(|h| h.to_string()).collect();
    store
        .upsert_cluster_group(&definition.cluster_group, &hosts)
        .await?;

    let mut memberships: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (vo, users) in vos {
        store.upsert_vo(vo, None).await?;
        for dn in users.iter() {
            memberships
                .entry(dn.to_string())
                .or_default()
                .push(vo.to_string());
        }
    }
    for (dn, member_of) in &memberships {
        store.upsert_user(&test_user(dn), member_of).await?;
    }
    let vo_names: Vec<String> = vos.iter().map(|(vo, _)| vo.to_string()).collect();
    store.upsert_vo_group(&definition.vo_group, &vo_names).await?;

    for name in tests {
        store
            .upsert_test(&Test {
                name: name.to_string(),
                description: format!("&(executable=/bin/sh)(arguments=-c \"echo {name}\")"),
            })
            .await?;
    }
    let test_names: Vec<String> = tests.iter().map(|t| t.to_string()).collect();
    store
        .upsert_test_suite(&definition.test_suite, &test_names)
        .await?;

    store.upsert_sft(definition).await
}

fn test_user(dn: &str) -> User {
    User {
        dn: dn.to_string(),
        display_name: None,
        secret: "secret".to_string(),
    }
}

/// Every fake wired into an [`EventContext`] over an in-memory store.
pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub credentials: Arc<FakeCredentials>,
    pub remote: Arc<FakeRemote>,
    pub notifier: Arc<RecordingNotifier>,
    pub indexer: Arc<FakeIndexer>,
    pub downtime: Arc<StaticDowntime>,
    pub ctx: Arc<EventContext>,
}

impl Harness {
    pub fn new() -> Result<Self, StoreError> {
        let store = Arc::new(SqliteStore::open_in_memory()?);
        let credentials = Arc::new(FakeCredentials::new());
        let remote = Arc::new(FakeRemote::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = Arc::new(EventContext {
            definitions: store.clone(),
            jobs: store.clone(),
            credentials: credentials.clone(),
            remote: remote.clone(),
            notifier: notifier.clone(),
            selector: Arc::new(FirstSelector),
            localhost: "sftd.test".to_string(),
        });
        Ok(Self {
            store,
            credentials,
            remote,
            notifier,
            indexer: Arc::new(FakeIndexer::new()),
            downtime: Arc::new(StaticDowntime::new()),
            ctx,
        })
    }

    /// Register `dn` as a member of `vos`, creating the VOs if needed.
    pub async fn add_user(&self, dn: &str, vos: &[&str]) {
        let names: Vec<String> = vos.iter().map(|v| v.to_string()).collect();
        for vo in &names {
            if let Err(e) = self.store.upsert_vo(vo, None).await {
                panic!("cannot create VO {vo}: {e}");
            }
        }
        if let Err(e) = self.store.upsert_user(&test_user(dn), &names).await {
            panic!("cannot create user {dn}: {e}");
        }
    }

    pub fn publisher(&self, jobs_dir: &Path) -> Publisher {
        Publisher::new(
            self.ctx.clone(),
            self.indexer.clone(),
            OutputClassifier::new(ClassificationConfig::default()),
            jobs_dir.to_path_buf(),
        )
    }

    pub fn housekeeper(&self, refresh_period: u32, max_job_age: Duration) -> Housekeeper {
        Housekeeper::new(
            self.ctx.clone(),
            self.downtime.clone(),
            refresh_period,
            max_job_age,
        )
    }
}
