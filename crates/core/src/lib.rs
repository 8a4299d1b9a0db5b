//! Shared domain types for the opsdesk job tracking and live-event layer.
//!
//! - [`task`]: tracked background jobs and their status machine.
//! - [`collection`]: authoritative server lists the view mirrors.
//! - [`push_events`]: typed inbound push-channel frames.
//! - [`credentials`]: injected session credential storage.

pub mod collection;
pub mod credentials;
pub mod push_events;
pub mod task;
pub mod types;

pub use collection::Collection;
pub use credentials::{CredentialError, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use push_events::{parse_event, Alert, ChatMessage, MessageDirection, PushEvent};
pub use task::{StatusReport, TaskId, TaskRecord, TaskState, TaskStatus, Transition};
