//! Session view model and its merge rules.
//!
//! [`ViewState`] is plain data with synchronous mutators; the
//! [`Reconciler`](crate::Reconciler) serialises access to it. Push events
//! are applied optimistically only to content that has already been
//! fetched, and every authoritative refresh replaces its collection
//! wholesale, guarded by a per-collection sequence number.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use opsdesk_core::{Alert, ChatMessage, Collection, PushEvent, TaskId, TaskRecord};
use opsdesk_core::types::DbId;

/// Authoritative contents of one collection, as returned by a refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionData {
    Leads(Vec<serde_json::Value>),
    Conversations(Vec<serde_json::Value>),
    Messages(DbId, Vec<ChatMessage>),
    Alerts(Vec<Alert>),
}

impl CollectionData {
    pub fn collection(&self) -> Collection {
        match self {
            Self::Leads(_) => Collection::Leads,
            Self::Conversations(_) => Collection::Conversations,
            Self::Messages(id, _) => Collection::Messages(*id),
            Self::Alerts(_) => Collection::Alerts,
        }
    }
}

/// What [`ViewState::apply_event`] did to the view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventEffect {
    /// The event was shown optimistically.
    pub changed: bool,
    /// Collections whose authoritative lists must be refreshed.
    pub refresh: BTreeSet<Collection>,
}

/// Outcome of [`ViewState::apply_refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshApplied {
    Replaced,
    /// A newer result for the same collection was already applied.
    Stale,
    /// The collection is no longer displayed (a closed conversation).
    NotDisplayed,
}

#[derive(Debug, Clone, Default)]
pub struct ViewState {
    tasks: IndexMap<TaskId, TaskRecord>,
    open_conversation: Option<DbId>,
    messages: Vec<ChatMessage>,
    conversations: Vec<serde_json::Value>,
    leads: Vec<serde_json::Value>,
    alerts: Vec<Alert>,
    /// Last sequence number handed out per collection.
    requested: BTreeMap<Collection, u64>,
    /// Sequence number of the refresh currently shown per collection.
    /// A collection without an entry has never been fetched.
    applied: BTreeMap<Collection, u64>,
}

impl ViewState {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- tasks ----

    pub fn tasks(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }

    /// Insert or replace task records, keeping first-seen order.
    pub fn upsert_tasks<'a>(&mut self, records: impl IntoIterator<Item = &'a TaskRecord>) {
        for record in records {
            self.tasks.insert(record.id.clone(), record.clone());
        }
    }

    /// Replace records that are already shown. Ids the view does not hold
    /// are ignored, so a write-back never resurrects a dismissed task.
    /// Returns whether any record was replaced.
    pub fn update_tasks<'a>(&mut self, records: impl IntoIterator<Item = &'a TaskRecord>) -> bool {
        let mut changed = false;
        for record in records {
            if let Some(shown) = self.tasks.get_mut(&record.id) {
                if shown != record {
                    *shown = record.clone();
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn remove_task(&mut self, id: &TaskId) -> bool {
        self.tasks.shift_remove(id).is_some()
    }

    // ---- conversations ----

    pub fn open_conversation_id(&self) -> Option<DbId> {
        self.open_conversation
    }

    /// Mark `id` as the visible conversation. Its messages are unknown
    /// until the first refresh lands.
    pub fn open_conversation(&mut self, id: DbId) {
        if let Some(previous) = self.open_conversation.replace(id) {
            self.applied.remove(&Collection::Messages(previous));
        }
        self.messages.clear();
        self.applied.remove(&Collection::Messages(id));
    }

    pub fn close_conversation(&mut self) {
        if let Some(previous) = self.open_conversation.take() {
            self.applied.remove(&Collection::Messages(previous));
        }
        self.messages.clear();
    }

    /// Messages of the open conversation, in server order.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn conversations(&self) -> &[serde_json::Value] {
        &self.conversations
    }

    pub fn leads(&self) -> &[serde_json::Value] {
        &self.leads
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn is_loaded(&self, collection: Collection) -> bool {
        self.applied.contains_key(&collection)
    }

    // ---- push events ----

    /// Apply a push event optimistically.
    pub fn apply_event(&mut self, event: &PushEvent) -> EventEffect {
        let mut effect = EventEffect::default();

        match event {
            PushEvent::MessageDelivered { target_id, payload } => {
                if self.open_conversation == Some(*target_id) {
                    effect.changed = self.append_message(*target_id, payload);
                    effect.refresh.insert(Collection::Messages(*target_id));
                } else {
                    tracing::debug!(
                        conversation_id = target_id,
                        "Message for a conversation that is not open",
                    );
                }
                effect.refresh.insert(Collection::Conversations);
            }
            PushEvent::HighIntentAlert { payload, .. } | PushEvent::AlertRaised { payload, .. } => {
                effect.changed = self.insert_alert(payload);
                effect.refresh.insert(Collection::Alerts);
            }
        }

        effect
    }

    fn append_message(&mut self, conversation_id: DbId, message: &ChatMessage) -> bool {
        if !self.is_loaded(Collection::Messages(conversation_id)) {
            return false;
        }
        if self.messages.iter().any(|m| m.id == message.id) {
            tracing::debug!(message_id = message.id, "Message already shown");
            return false;
        }
        self.messages.push(message.clone());
        true
    }

    fn insert_alert(&mut self, alert: &Alert) -> bool {
        // Without an id the alert cannot be deduplicated against the
        // refreshed list; wait for the refresh.
        let Some(id) = alert.id else {
            return false;
        };
        if !self.is_loaded(Collection::Alerts) || self.alerts.iter().any(|a| a.id == Some(id)) {
            return false;
        }
        self.alerts.insert(0, alert.clone());
        true
    }

    // ---- refresh ----

    /// Allocate the sequence number for a new refresh of `collection`.
    pub fn begin_refresh(&mut self, collection: Collection) -> u64 {
        let seq = self.requested.entry(collection).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Replace a collection with an authoritative result, unless a newer
    /// result was already applied.
    pub fn apply_refresh(&mut self, seq: u64, data: CollectionData) -> RefreshApplied {
        let collection = data.collection();

        if self.applied.get(&collection).is_some_and(|&applied| applied >= seq) {
            return RefreshApplied::Stale;
        }

        match data {
            CollectionData::Messages(id, messages) => {
                if self.open_conversation != Some(id) {
                    return RefreshApplied::NotDisplayed;
                }
                self.messages = messages;
            }
            CollectionData::Leads(leads) => self.leads = leads,
            CollectionData::Conversations(conversations) => self.conversations = conversations,
            CollectionData::Alerts(alerts) => self.alerts = alerts,
        }

        self.applied.insert(collection, seq);
        RefreshApplied::Replaced
    }
}
