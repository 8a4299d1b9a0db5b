//! Session view reconciliation.
//!
//! - [`view`]: the view model and its merge rules.
//! - [`reconciler`]: the loop merging poller reports and push events.
//! - [`notify`]: priority notifications for high-intent signals.
//! - [`api`] / [`source`]: the authoritative collection endpoints.

pub mod api;
pub mod notify;
pub mod reconciler;
pub mod source;
pub mod view;

pub use api::CollectionApi;
pub use notify::{Notification, NotificationDispatcher, Notifier};
pub use reconciler::Reconciler;
pub use source::{CollectionSource, SourceError};
pub use view::{CollectionData, EventEffect, RefreshApplied, ViewState};
