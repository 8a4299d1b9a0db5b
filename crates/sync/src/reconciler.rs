//! Merges poller write-backs and push events into the session view.
//!
//! [`Reconciler::run`] is the single consumer of both streams. Push events
//! are applied strictly in arrival order; each one is applied
//! optimistically to the view, tapped by the [`NotificationDispatcher`],
//! and followed by background refreshes of the affected collections.
//! Refreshes run as tracked tasks and land through the view's sequence
//! guard, so a slow response never rolls a collection back.

use std::collections::BTreeSet;
use std::sync::Arc;

use opsdesk_core::types::DbId;
use opsdesk_core::{Collection, PushEvent, TaskId, TaskRecord};
use opsdesk_tasks::{BatchPoller, TickReport};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::notify::NotificationDispatcher;
use crate::source::CollectionSource;
use crate::view::{EventEffect, RefreshApplied, ViewState};

struct Inner {
    view: RwLock<ViewState>,
    poller: BatchPoller,
    source: Arc<dyn CollectionSource>,
    notifications: NotificationDispatcher,
    /// Bumped on every visible view change.
    revision: watch::Sender<u64>,
    refreshes: TaskTracker,
}

/// Owner of the session [`ViewState`]. Clones share the same view.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    pub fn new(
        poller: BatchPoller,
        source: Arc<dyn CollectionSource>,
        notifications: NotificationDispatcher,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                view: RwLock::new(ViewState::new()),
                poller,
                source,
                notifications,
                revision,
                refreshes: TaskTracker::new(),
            }),
        }
    }

    /// Copy of the current view for rendering.
    pub async fn snapshot(&self) -> ViewState {
        self.inner.view.read().await.clone()
    }

    /// Receiver whose value changes whenever the view does.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub fn poller(&self) -> &BatchPoller {
        &self.inner.poller
    }

    /// Track a submitted job and show it at `PENDING` straight away.
    pub async fn track(&self, id: TaskId, label: impl Into<String>, affects: Option<Collection>) -> bool {
        let poller = &self.inner.poller;
        let tracked = match affects {
            Some(collection) => poller.track_affecting(id.clone(), label, collection).await,
            None => poller.track(id.clone(), label).await,
        };
        if !tracked {
            return false;
        }

        if let Some(record) = poller.get(&id).await {
            self.inner.view.write().await.upsert_tasks([&record]);
            self.inner.bump();
        }
        true
    }

    /// Explicit user dismissal of a finished or abandoned job.
    pub async fn dismiss_task(&self, id: &TaskId) -> Option<TaskRecord> {
        let removed = self.inner.poller.dismiss(id).await;
        if self.inner.view.write().await.remove_task(id) {
            self.inner.bump();
        }
        removed
    }

    /// Show conversation `id` and fetch its messages.
    pub async fn open_conversation(&self, id: DbId) {
        self.inner.view.write().await.open_conversation(id);
        self.inner.bump();
        tracing::debug!(conversation_id = id, "Conversation opened");
        self.refresh(Collection::Messages(id)).await;
    }

    pub async fn close_conversation(&self) {
        self.inner.view.write().await.close_conversation();
        self.inner.bump();
    }

    /// Start a background refresh of `collection`.
    pub async fn refresh(&self, collection: Collection) {
        let seq = self.inner.view.write().await.begin_refresh(collection);
        let inner = Arc::clone(&self.inner);
        self.inner.refreshes.spawn(async move {
            inner.run_refresh(collection, seq).await;
        });
    }

    /// Wait until every refresh started so far has landed or failed.
    pub async fn settle(&self) {
        let refreshes = &self.inner.refreshes;
        refreshes.close();
        refreshes.wait().await;
        refreshes.reopen();
    }

    pub async fn handle_event(&self, event: PushEvent) {
        tracing::debug!(kind = event.kind(), target_id = event.target_id(), "Reconciling push event");

        let EventEffect { changed, mut refresh } = self.inner.view.write().await.apply_event(&event);
        if changed {
            self.inner.bump();
        }

        refresh.extend(self.inner.notifications.dispatch(&event));
        self.refresh_all(refresh).await;
    }

    pub async fn handle_report(&self, report: TickReport) {
        // Write-backs only refresh records the view still shows; a task
        // dismissed while its report was queued stays gone.
        if self.inner.view.write().await.update_tasks(&report.updated) {
            self.inner.bump();
        }
        if !report.refresh.is_empty() {
            tracing::info!(
                completed = report.completed.len(),
                collections = report.refresh.len(),
                "Jobs completed, refreshing affected collections",
            );
        }
        self.refresh_all(report.refresh).await;
    }

    /// Consume push events and poller reports until `cancel` fires or
    /// both streams end.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<PushEvent>,
        mut reports: mpsc::UnboundedReceiver<TickReport>,
        cancel: CancellationToken,
    ) {
        let mut events_open = true;
        let mut reports_open = true;

        tracing::info!("Reconciler started");

        while events_open || reports_open {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        tracing::debug!("Push event stream ended");
                        events_open = false;
                    }
                },
                report = reports.recv(), if reports_open => match report {
                    Some(report) => self.handle_report(report).await,
                    None => {
                        tracing::debug!("Poller report stream ended");
                        reports_open = false;
                    }
                },
            }
        }

        tracing::info!("Reconciler stopped");
    }

    async fn refresh_all(&self, collections: BTreeSet<Collection>) {
        for collection in collections {
            self.refresh(collection).await;
        }
    }
}

impl Inner {
    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    async fn run_refresh(&self, collection: Collection, seq: u64) {
        let data = match self.source.fetch(collection).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(%collection, seq, error = %e, "Collection refresh failed");
                return;
            }
        };

        if data.collection() != collection {
            tracing::error!(
                %collection,
                returned = %data.collection(),
                "Collection source returned the wrong collection",
            );
            return;
        }

        let applied = self.view.write().await.apply_refresh(seq, data);
        match applied {
            RefreshApplied::Replaced => {
                tracing::debug!(%collection, seq, "Collection refreshed");
                self.bump();
            }
            RefreshApplied::Stale => {
                tracing::debug!(%collection, seq, "Discarding stale refresh");
            }
            RefreshApplied::NotDisplayed => {
                tracing::debug!(%collection, seq, "Discarding refresh for closed view");
            }
        }
    }
}
