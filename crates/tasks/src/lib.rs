//! Background job tracking.
//!
//! Provides the [`TaskRegistry`] of in-flight jobs, the [`BatchPoller`]
//! that converges them to server truth with one batched status request
//! per tick, and the REST client for the task status endpoints.

pub mod api;
pub mod poller;
pub mod registry;
pub mod source;
pub mod wait;

pub use api::StatusApi;
pub use poller::{BatchPoller, PollerConfig, TickOutcome};
pub use registry::{TaskRegistry, TickReport};
pub use source::{StatusError, StatusSource};
pub use wait::wait_for_task;
