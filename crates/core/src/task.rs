//! Tracked background jobs.
//!
//! A [`TaskRecord`] is created when a job-submission call returns a
//! handle, mutated only by poll write-backs, and removed only by an
//! explicit dismissal. `SUCCESS` and `FAILURE` are absorbing: once a
//! record reaches either, [`TaskRecord::apply`] refuses every later
//! write.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::collection::Collection;
use crate::types::Timestamp;

/// Opaque job handle issued by the submission endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Job status as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Progress,
    Success,
    Failure,
}

impl TaskStatus {
    /// `SUCCESS` and `FAILURE` are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Progress => "PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status together with the payload that is only valid in that status.
///
/// Progress detail exists only while running, a result only on success
/// and an error only on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Started,
    Progress(serde_json::Value),
    Success(serde_json::Value),
    Failure(serde_json::Value),
}

impl TaskState {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Pending => TaskStatus::Pending,
            Self::Started => TaskStatus::Started,
            Self::Progress(_) => TaskStatus::Progress,
            Self::Success(_) => TaskStatus::Success,
            Self::Failure(_) => TaskStatus::Failure,
        }
    }
}

/// Per-task entry of the status endpoints: `{"status": ..., "result": ...}`.
///
/// The backend reuses `result` for the progress metadata while running
/// and for the failure cause on `FAILURE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl StatusReport {
    pub fn into_state(self) -> TaskState {
        let payload = self.result.unwrap_or(serde_json::Value::Null);
        match self.status {
            TaskStatus::Pending => TaskState::Pending,
            TaskStatus::Started => TaskState::Started,
            TaskStatus::Progress => TaskState::Progress(payload),
            TaskStatus::Success => TaskState::Success(payload),
            TaskStatus::Failure => TaskState::Failure(payload),
        }
    }
}

/// Outcome of writing a server state onto a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Incoming state equals the stored one.
    Unchanged,
    /// The record was already terminal; the incoming state was dropped.
    Absorbed,
    Changed { from: TaskStatus, to: TaskStatus },
}

impl Transition {
    /// True when this write moved the record into `SUCCESS`.
    pub fn completed(&self) -> bool {
        matches!(
            self,
            Self::Changed {
                to: TaskStatus::Success,
                ..
            }
        )
    }
}

/// Client-side view of one asynchronous backend job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    /// Display-only metadata (e.g. the originating URL).
    pub label: String,
    /// Collection the job populates, refreshed when it succeeds.
    pub affects: Option<Collection>,
    #[serde(flatten)]
    pub state: TaskState,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TaskRecord {
    /// New record at `PENDING`.
    pub fn new(id: TaskId, label: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            label: label.into(),
            affects: None,
            state: TaskState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_affects(mut self, collection: Collection) -> Self {
        self.affects = Some(collection);
        self
    }

    pub fn status(&self) -> TaskStatus {
        self.state.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn progress_detail(&self) -> Option<&serde_json::Value> {
        match &self.state {
            TaskState::Progress(detail) => Some(detail),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match &self.state {
            TaskState::Success(result) => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&serde_json::Value> {
        match &self.state {
            TaskState::Failure(error) => Some(error),
            _ => None,
        }
    }

    /// Write a server-reported state onto this record.
    ///
    /// Terminal records never change. Non-terminal records take whatever
    /// the server reports, including a move back to an earlier running
    /// status; `label` and `affects` are never touched.
    pub fn apply(&mut self, incoming: TaskState) -> Transition {
        if self.is_terminal() {
            return Transition::Absorbed;
        }
        if self.state == incoming {
            return Transition::Unchanged;
        }

        let from = self.status();
        self.state = incoming;
        self.updated_at = Utc::now();
        Transition::Changed {
            from,
            to: self.status(),
        }
    }
}
