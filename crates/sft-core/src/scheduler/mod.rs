//! The control loop and its worker pool.
//!
//! `Scheduler` runs a fixed-length cycle: housekeeping, every K-th cycle a
//! publisher pass, enqueueing of due events, and a notification flush.
//! Schedules are matched against the UTC minute; downtime windows are
//! authored in local time and checked against the local clock.
//! A fixed pool of worker tasks drains the queue and runs events. A stop
//! request ends the loop at the next cycle boundary; workers exit after at
//! most one dequeue wait.

pub mod classify;
pub mod cron;
pub mod event;
pub mod housekeeper;
pub mod publisher;

pub use classify::{ClassificationError, ClassificationErrorKind, Convention, OutputClassifier, Verdict};
pub use cron::{CronError, CronField, Schedule};
pub use event::{resolve, resolve_named, EventContext, ResolvedSft, RunReport, SftEvent};
pub use housekeeper::{Housekeeper, HousekeepingReport};
pub use publisher::{PassReport, Publisher};

use chrono::{DateTime, Local, NaiveDateTime, Timelike, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::notifier::{FlushReport, Notifier};

/// Source of the current time for the control loop.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
    /// Wall-clock local time, the time base of downtime windows.
    fn now_local(&self) -> NaiveDateTime;
}

/// The host's real clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_local(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Live counters for the control loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerMetrics {
    pub cycles: u64,
    /// Cycles whose work took longer than the cycle length.
    pub overruns: u64,
    pub enqueued: u64,
    /// Due events not enqueued because a previous occurrence was still queued or running.
    pub skipped_already_queued: u64,
    pub runs_completed: u64,
    pub runs_panicked: u64,
    pub publisher_passes: u64,
}

/// What one control cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    /// UTC minute schedules were matched against.
    pub minute: NaiveDateTime,
    pub housekeeping: HousekeepingReport,
    pub publisher: Option<PassReport>,
    pub enqueued: Vec<String>,
    pub flush: FlushReport,
}

struct QueuedEvent {
    event: Arc<SftEvent>,
    enqueued_at: DateTime<Utc>,
}

type Queue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedEvent>>>;

pub struct Scheduler {
    config: SchedulerConfig,
    housekeeper: tokio::sync::Mutex<Housekeeper>,
    publisher: Arc<Publisher>,
    notifier: Arc<dyn Notifier>,
    sender: mpsc::UnboundedSender<QueuedEvent>,
    receiver: Queue,
    /// Names of events queued or running.
    queued: Arc<Mutex<HashSet<String>>>,
    /// UTC minute each event was last enqueued for.
    last_fired: Mutex<HashMap<String, NaiveDateTime>>,
    clock: Arc<dyn Clock>,
    shutdown_notify: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
    metrics: Arc<RwLock<SchedulerMetrics>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        housekeeper: Housekeeper,
        publisher: Arc<Publisher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            config,
            housekeeper: tokio::sync::Mutex::new(housekeeper),
            publisher,
            notifier,
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            queued: Arc::new(Mutex::new(HashSet::new())),
            last_fired: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            shutdown_notify: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(true)),
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
        }
    }

    /// Replace the time source used by [`Scheduler::run`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.read().clone()
    }

    pub fn is_running(&self) -> bool {
        *self.is_running.read()
    }

    /// Ask the control loop and the workers to stop.
    pub fn shutdown(&self) {
        {
            let mut running = self.is_running.write();
            if !*running {
                return;
            }
            *running = false;
        }
        // A permit is stored if the control loop is not sleeping yet.
        self.shutdown_notify.notify_one();
        tracing::info!("Scheduler: stop requested");
    }

    /// Names of the events currently loaded by the housekeeper.
    pub async fn event_names(&self) -> Vec<String> {
        self.housekeeper
            .lock()
            .await
            .events()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Run the control loop until [`Scheduler::shutdown`] is called.
    pub async fn run(&self) {
        tracing::info!(
            cycle = ?self.config.cycle,
            workers = self.config.workers,
            publish_every = self.config.publish_every,
            refresh_period = self.config.refresh_period,
            "Scheduler started"
        );
        let workers: Vec<JoinHandle<()>> = (0..self.config.workers.max(1))
            .map(|id| self.spawn_worker(id))
            .collect();

        let mut cycle: u64 = 0;
        while self.is_running() {
            let started = Instant::now();
            let utc_now = self.clock.now_utc();
            let local_now = self.clock.now_local();
            self.run_cycle(cycle, utc_now, local_now).await;
            cycle += 1;

            let remaining = self.config.cycle.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                tracing::warn!(elapsed = ?started.elapsed(), "Scheduler: cycle overran, starting next cycle immediately");
                self.metrics.write().overruns += 1;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = self.shutdown_notify.notified() => {}
            }
        }

        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Scheduler: worker task failed: {}", e);
            }
        }
        let flush = self.notifier.flush().await;
        if !flush.success {
            tracing::error!("Scheduler: final notification flush failed: {:?}", flush.error);
        }
        tracing::info!("Scheduler shutdown complete");
    }

    /// One control cycle. Schedules are matched against the minute of
    /// `utc_now`; `local_now` only decides which clusters are in downtime.
    pub async fn run_cycle(
        &self,
        cycle: u64,
        utc_now: DateTime<Utc>,
        local_now: NaiveDateTime,
    ) -> CycleReport {
        let minute = truncate_to_minute(utc_now.naive_utc());
        let (housekeeping, events) = {
            let mut housekeeper = self.housekeeper.lock().await;
            let report = housekeeper.tick(local_now, utc_now).await;
            (report, housekeeper.events().to_vec())
        };

        let publisher = if cycle % u64::from(self.config.publish_every.max(1)) == 0 {
            let report = self.publisher.run().await;
            self.metrics.write().publisher_passes += 1;
            Some(report)
        } else {
            None
        };

        let mut enqueued = Vec::new();
        for event in events {
            if !event.is_due(&minute) {
                continue;
            }
            let name = event.name().to_string();
            if self.last_fired.lock().get(&name) == Some(&minute) {
                continue;
            }
            if !self.queued.lock().insert(name.clone()) {
                tracing::warn!(sft = %name, "SFT still queued or running, skipping this occurrence");
                self.metrics.write().skipped_already_queued += 1;
                continue;
            }
            self.last_fired.lock().insert(name.clone(), minute);
            let item = QueuedEvent {
                event,
                enqueued_at: Utc::now(),
            };
            if self.sender.send(item).is_err() {
                tracing::error!(sft = %name, "Scheduler: work queue closed");
                self.queued.lock().remove(&name);
                continue;
            }
            tracing::debug!(sft = %name, "enqueued SFT");
            enqueued.push(name);
        }

        let flush = self.notifier.flush().await;
        if !flush.success {
            tracing::error!(
                channel = %flush.channel,
                "Scheduler: notification flush failed: {}",
                flush.error.as_deref().unwrap_or("unknown error")
            );
        }

        {
            let mut metrics = self.metrics.write();
            metrics.cycles += 1;
            metrics.enqueued += enqueued.len() as u64;
        }

        CycleReport {
            cycle,
            minute,
            housekeeping,
            publisher,
            enqueued,
            flush,
        }
    }

    fn spawn_worker(&self, id: usize) -> JoinHandle<()> {
        let receiver = self.receiver.clone();
        let queued = self.queued.clone();
        let is_running = self.is_running.clone();
        let metrics = self.metrics.clone();
        let wait = self.config.dequeue_wait;

        tokio::spawn(async move {
            tracing::debug!(worker = id, "worker started");
            while *is_running.read() {
                let Some(item) = dequeue(&receiver, wait).await else {
                    continue;
                };
                execute(id, item, &queued, &metrics).await;
            }
            tracing::debug!(worker = id, "worker stopped");
        })
    }

    /// Run every event currently queued on the calling task, the way a
    /// worker would. Returns how many were run.
    #[cfg(any(test, feature = "test-utils"))]
    pub async fn drain(&self) -> usize {
        let mut count = 0;
        loop {
            let item = self.receiver.lock().await.try_recv();
            let Ok(item) = item else {
                return count;
            };
            execute(0, item, &self.queued, &self.metrics).await;
            count += 1;
        }
    }
}

/// Run one dequeued event in its own task so a panic only ends that run.
async fn execute(
    worker: usize,
    item: QueuedEvent,
    queued: &Mutex<HashSet<String>>,
    metrics: &RwLock<SchedulerMetrics>,
) {
    let name = item.event.name().to_string();
    let waited = Utc::now() - item.enqueued_at;
    tracing::debug!(worker, sft = %name, waited_ms = waited.num_milliseconds(), "dequeued SFT");

    let event = item.event;
    match tokio::spawn(async move { event.run().await }).await {
        Ok(_) => metrics.write().runs_completed += 1,
        Err(e) => {
            tracing::error!(worker, sft = %name, "SFT run aborted: {}", e);
            metrics.write().runs_panicked += 1;
        }
    }
    queued.lock().remove(&name);
}

/// Wait at most `wait` for the next queued event.
async fn dequeue(receiver: &Queue, wait: Duration) -> Option<QueuedEvent> {
    tokio::time::timeout(wait, async { receiver.lock().await.recv().await })
        .await
        .ok()
        .flatten()
}

fn truncate_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}
