//! Single-task status flow.
//!
//! Screens that submit exactly one job (e.g. a one-off scrape) follow it
//! through the single-task endpoint instead of the shared batch poller.

use std::time::Duration;

use opsdesk_core::{TaskId, TaskState};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::source::StatusSource;

/// Poll one task every `interval` until it reaches a terminal state.
///
/// Returns the terminal state, or `None` if `cancel` fires first.
/// Request failures and unknown ids are logged and retried on the next
/// interval.
pub async fn wait_for_task(
    source: &dyn StatusSource,
    id: &TaskId,
    interval: Duration,
    cancel: &CancellationToken,
) -> Option<TaskState> {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(task_id = %id, "Stopped waiting for task");
                return None;
            }
            _ = ticker.tick() => {}
        }

        match source.fetch_one(id).await {
            Ok(Some(report)) => {
                let state = report.into_state();
                if state.status().is_terminal() {
                    tracing::info!(task_id = %id, status = %state.status(), "Task finished");
                    return Some(state);
                }
                tracing::debug!(task_id = %id, status = %state.status(), "Task still running");
            }
            Ok(None) => {
                tracing::debug!(task_id = %id, "Task not known to the backend yet");
            }
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "Task status request failed");
            }
        }
    }
}
