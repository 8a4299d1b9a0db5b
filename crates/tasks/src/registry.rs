//! In-memory registry of tracked jobs.
//!
//! The registry is the single mutable record set the poller reads at
//! every tick. It never creates or removes records on its own: records
//! enter through [`TaskRegistry::track`] and leave through
//! [`TaskRegistry::dismiss`].

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;
use opsdesk_core::{Collection, StatusReport, TaskId, TaskRecord, Transition};

/// Tracked records in creation order.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    records: IndexMap<TaskId, TaskRecord>,
}

/// What one batched status response changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Number of ids in the request.
    pub requested: usize,
    /// Records whose stored state changed, after the write-back.
    pub updated: Vec<TaskRecord>,
    /// Ids that moved into `SUCCESS` during this tick.
    pub completed: Vec<TaskId>,
    /// Requested ids the response said nothing about.
    pub missing: Vec<TaskId>,
    /// Collections affected by the jobs that completed.
    pub refresh: BTreeSet<Collection>,
}

impl TickReport {
    pub fn has_changes(&self) -> bool {
        !self.updated.is_empty()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record. Returns `false` (and leaves the existing record
    /// alone) when the id is already tracked.
    pub fn track(&mut self, record: TaskRecord) -> bool {
        if self.records.contains_key(&record.id) {
            return false;
        }
        self.records.insert(record.id.clone(), record);
        true
    }

    /// Explicit user dismissal.
    pub fn dismiss(&mut self, id: &TaskId) -> Option<TaskRecord> {
        self.records.shift_remove(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &TaskRecord> {
        self.records.values()
    }

    /// Ids of every record in `PENDING`, `STARTED` or `PROGRESS`.
    pub fn pending_ids(&self) -> Vec<TaskId> {
        self.records
            .values()
            .filter(|r| !r.is_terminal())
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.records.values().any(|r| !r.is_terminal())
    }

    /// Write a batched response back onto the records that were requested.
    ///
    /// Ids outside `requested`, ids dismissed while the request was in
    /// flight and terminal records are left untouched. Requested ids the
    /// response omits are reported as missing and stay pending.
    pub fn apply_batch(
        &mut self,
        requested: &[TaskId],
        mut reports: HashMap<TaskId, StatusReport>,
    ) -> TickReport {
        let mut tick = TickReport {
            requested: requested.len(),
            ..Default::default()
        };

        for id in requested {
            let Some(report) = reports.remove(id) else {
                tick.missing.push(id.clone());
                continue;
            };
            let Some(record) = self.records.get_mut(id) else {
                continue;
            };

            let transition = record.apply(report.into_state());
            if transition.completed() {
                tick.completed.push(id.clone());
                if let Some(collection) = record.affects {
                    tick.refresh.insert(collection);
                }
            }
            if matches!(transition, Transition::Changed { .. }) {
                tick.updated.push(record.clone());
            }
        }

        tick
    }
}
