//! Batched task status poller.
//!
//! [`BatchPoller`] owns the [`TaskRegistry`] and a recurring schedule
//! that, every `interval`, requests the status of every non-terminal
//! record in a single call and writes the answers back. The schedule is
//! spawned lazily by [`BatchPoller::track`] and stops by itself as soon
//! as a tick finds nothing left to poll.
//!
//! Ticks are strictly sequential: a tick holds the tick gate until its
//! response has been applied or the request was abandoned after one
//! interval, so a slow backend never accumulates in-flight requests.
//!
//! Each tick that changed something is reported once on the channel
//! returned by [`BatchPoller::new`], carrying every collection affected
//! by the jobs that completed in that tick.

use std::sync::Arc;
use std::time::Duration;

use opsdesk_core::{Collection, TaskId, TaskRecord, TaskStatus};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::registry::{TaskRegistry, TickReport};
use crate::source::{StatusError, StatusSource};

/// Default cadence of the batched status request.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Fixed interval between ticks. Also bounds how long a single
    /// batched request may stay in flight.
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Result of a single tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// No non-terminal record was left; the schedule has stopped.
    Idle,
    /// The batched response was written back.
    Polled(TickReport),
    /// The request failed; every record is untouched and the next tick
    /// retries.
    Failed(StatusError),
    /// The request did not resolve within one interval and was abandoned.
    TimedOut,
}

struct PollState {
    registry: TaskRegistry,
    /// Generation of the running schedule, `None` when stopped.
    schedule: Option<u64>,
    next_generation: u64,
}

struct Inner {
    state: RwLock<PollState>,
    source: Arc<dyn StatusSource>,
    config: PollerConfig,
    reports: mpsc::UnboundedSender<TickReport>,
    tick_gate: Mutex<()>,
    /// Owner teardown.
    cancel: CancellationToken,
}

/// Tracks in-flight jobs and polls their status in batches.
///
/// Cheap to clone; all clones share one registry and one schedule.
#[derive(Clone)]
pub struct BatchPoller {
    inner: Arc<Inner>,
}

impl BatchPoller {
    /// Create a poller and the receiving end of its per-tick reports.
    pub fn new(
        source: Arc<dyn StatusSource>,
        config: PollerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TickReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let poller = Self {
            inner: Arc::new(Inner {
                state: RwLock::new(PollState {
                    registry: TaskRegistry::new(),
                    schedule: None,
                    next_generation: 0,
                }),
                source,
                config,
                reports,
                tick_gate: Mutex::new(()),
                cancel: CancellationToken::new(),
            }),
        };
        (poller, rx)
    }

    /// Register a job handle at `PENDING`. Returns `false` if the id is
    /// already tracked. Starts the schedule if it is not running.
    pub async fn track(&self, id: TaskId, label: impl Into<String>) -> bool {
        self.track_record(TaskRecord::new(id, label)).await
    }

    /// Like [`track`](Self::track), remembering the collection the job
    /// populates so it is refreshed when the job succeeds.
    pub async fn track_affecting(
        &self,
        id: TaskId,
        label: impl Into<String>,
        collection: Collection,
    ) -> bool {
        self.track_record(TaskRecord::new(id, label).with_affects(collection))
            .await
    }

    async fn track_record(&self, record: TaskRecord) -> bool {
        let id = record.id.clone();
        let mut state = self.inner.state.write().await;
        if !state.registry.track(record) {
            tracing::debug!(task_id = %id, "Task already tracked");
            return false;
        }
        tracing::info!(task_id = %id, "Tracking task");
        self.ensure_scheduled(&mut state);
        true
    }

    /// Remove a record on explicit user dismissal.
    pub async fn dismiss(&self, id: &TaskId) -> Option<TaskRecord> {
        let removed = self.inner.state.write().await.registry.dismiss(id);
        if removed.is_some() {
            tracing::info!(task_id = %id, "Task dismissed");
        }
        removed
    }

    /// Ask the backend to cancel a job. Best effort: the local record is
    /// not touched and keeps converging through polling.
    pub async fn revoke(&self, id: &TaskId) -> Result<(), StatusError> {
        match self.inner.source.revoke(id).await {
            Ok(()) => {
                tracing::info!(task_id = %id, "Task revoke requested");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "Task revoke failed");
                Err(e)
            }
        }
    }

    pub async fn get(&self, id: &TaskId) -> Option<TaskRecord> {
        self.inner.state.read().await.registry.get(id).cloned()
    }

    /// Snapshot of every tracked record in creation order.
    pub async fn records(&self) -> Vec<TaskRecord> {
        self.inner
            .state
            .read()
            .await
            .registry
            .records()
            .cloned()
            .collect()
    }

    /// Whether the recurring schedule is currently running.
    pub async fn is_scheduled(&self) -> bool {
        self.inner.state.read().await.schedule.is_some()
    }

    /// Run one tick now.
    ///
    /// Reads the current record set, stops the schedule if nothing is
    /// left to poll, otherwise issues exactly one batched request for the
    /// non-terminal ids and writes the answers back.
    pub async fn tick(&self) -> TickOutcome {
        self.run_tick(None).await.unwrap_or(TickOutcome::Idle)
    }

    /// Cancel the recurring schedule for good. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if !self.inner.cancel.is_cancelled() {
            tracing::info!("Shutting down task poller");
        }
        self.inner.cancel.cancel();
        self.inner.state.write().await.schedule = None;
    }

    // ---- private helpers ----

    fn ensure_scheduled(&self, state: &mut PollState) {
        if state.schedule.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        state.schedule = Some(generation);

        let poller = self.clone();
        tokio::spawn(async move { poller.run_schedule(generation).await });
    }

    async fn run_schedule(self, generation: u64) {
        let interval = self.inner.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            generation,
            interval_ms = interval.as_millis() as u64,
            "Task poll schedule started",
        );

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.run_tick(Some(generation)).await {
                None | Some(TickOutcome::Idle) => break,
                Some(_) => {}
            }
        }

        tracing::info!(generation, "Task poll schedule stopped");
    }

    /// `caller` is the schedule generation when invoked by the schedule;
    /// returns `None` if that schedule has been stopped or superseded.
    async fn run_tick(&self, caller: Option<u64>) -> Option<TickOutcome> {
        let _gate = self.inner.tick_gate.lock().await;

        let requested = {
            let mut state = self.inner.state.write().await;
            if caller.is_some() && state.schedule != caller {
                return None;
            }
            let ids = state.registry.pending_ids();
            if ids.is_empty() {
                if state.schedule.take().is_some() {
                    tracing::debug!("No pending tasks, stopping poll schedule");
                }
                return Some(TickOutcome::Idle);
            }
            ids
        };

        let count = requested.len();
        tracing::debug!(count, "Polling task status");

        let fetched = tokio::time::timeout(
            self.inner.config.interval,
            self.inner.source.fetch_batch(&requested),
        )
        .await;

        let reports = match fetched {
            Ok(Ok(reports)) => reports,
            Ok(Err(e)) => {
                tracing::warn!(count, error = %e, "Batched status request failed");
                return Some(TickOutcome::Failed(e));
            }
            Err(_) => {
                tracing::warn!(count, "Batched status request timed out");
                return Some(TickOutcome::TimedOut);
            }
        };

        let report = self
            .inner
            .state
            .write()
            .await
            .registry
            .apply_batch(&requested, reports);

        for record in &report.updated {
            match record.status() {
                TaskStatus::Success => {
                    tracing::info!(task_id = %record.id, "Task succeeded")
                }
                TaskStatus::Failure => {
                    tracing::info!(task_id = %record.id, error = ?record.error(), "Task failed")
                }
                status => tracing::debug!(task_id = %record.id, %status, "Task status changed"),
            }
        }
        if !report.missing.is_empty() {
            tracing::debug!(
                missing = report.missing.len(),
                "Status response omitted some tasks",
            );
        }

        if report.has_changes() {
            // A closed receiver only means the owner stopped listening.
            let _ = self.inner.reports.send(report.clone());
        }

        Some(TickOutcome::Polled(report))
    }
}
