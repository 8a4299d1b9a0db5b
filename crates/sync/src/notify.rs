//! Priority notifications.
//!
//! [`NotificationDispatcher`] projects `high_intent_alert` events into
//! persistent [`Notification`]s regardless of which view is active, and
//! names the collections that must be refreshed as a consequence.

use std::collections::BTreeSet;
use std::sync::Arc;

use opsdesk_core::types::DbId;
use opsdesk_core::{Collection, PushEvent};
use serde::Serialize;

/// A user-facing notice that stays until the user dismisses it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Lead the signal is about.
    pub target_id: DbId,
    pub score: Option<f64>,
    pub persistent: bool,
}

/// Host surface that displays notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Surface `event` if it is a priority kind. Returns the collections
    /// to refresh; empty for every other kind.
    pub fn dispatch(&self, event: &PushEvent) -> BTreeSet<Collection> {
        match event {
            PushEvent::HighIntentAlert { target_id, payload } => {
                tracing::info!(
                    lead_id = target_id,
                    title = %payload.title,
                    score = ?payload.score,
                    "High intent alert",
                );
                self.notifier.notify(Notification {
                    title: payload.title.clone(),
                    body: payload.body.clone(),
                    target_id: *target_id,
                    score: payload.score,
                    persistent: true,
                });
                BTreeSet::from([Collection::Alerts, Collection::Leads])
            }
            PushEvent::MessageDelivered { .. } | PushEvent::AlertRaised { .. } => BTreeSet::new(),
        }
    }
}
