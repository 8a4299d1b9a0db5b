//! Owner-driven reconnection with exponential backoff.
//!
//! The channel itself never reconnects. An owner that wants recovery
//! after a non-authentication close calls [`reconnect_with_backoff`],
//! which retries until the channel is open, the session ends, or the
//! owner cancels.

use std::time::Duration;

use opsdesk_core::PushEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelError, ChannelState, CloseReason, PushChannel};

/// Retry schedule for an owner recovering from an ordinary close.
///
/// The first attempt is immediate. After `n` consecutive failures the
/// owner waits `first_retry * 2^(n-1)`, never longer than `retry_ceiling`.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub first_retry: Duration,
    pub retry_ceiling: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            first_retry: Duration::from_secs(1),
            retry_ceiling: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    /// Wait before the next attempt, given how many attempts have failed
    /// in a row.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(31);
        self.first_retry
            .saturating_mul(1 << doublings)
            .min(self.retry_ceiling)
    }
}

/// How a reconnect loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Connected,
    /// The credential is gone or was rejected; retrying cannot help.
    SessionEnded,
    Cancelled,
}

pub async fn reconnect_with_backoff(
    channel: &PushChannel,
    dispatch: &mpsc::UnboundedSender<PushEvent>,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> ReconnectOutcome {
    let mut status = channel.subscribe();
    let mut failures = 0u32;

    loop {
        let attempt = failures + 1;

        match channel.reconnect(dispatch.clone()) {
            Ok(outcome) => {
                tracing::debug!(attempt, generation = outcome.generation(), "Reconnect attempt started");
            }
            Err(ChannelError::MissingCredential) => return ReconnectOutcome::SessionEnded,
            Err(e) => {
                tracing::warn!(attempt, error = %e, "Reconnect attempt rejected");
                return ReconnectOutcome::Cancelled;
            }
        }

        let settled = tokio::select! {
            _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
            settled = status.wait_for(|s| s.state != ChannelState::Connecting) => match settled {
                Ok(current) => current.clone(),
                Err(_) => return ReconnectOutcome::Cancelled,
            },
        };

        match (settled.state, settled.last_close) {
            (ChannelState::Open, _) => {
                tracing::info!(attempt, "Push channel reconnected");
                return ReconnectOutcome::Connected;
            }
            (_, Some(CloseReason::AuthRejected(_))) => return ReconnectOutcome::SessionEnded,
            (_, reason) => {
                failures += 1;
                let delay = config.delay_after(failures);
                tracing::warn!(
                    attempt,
                    reason = ?reason,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnect attempt {attempt} failed",
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
            _ = tokio::time::sleep(config.delay_after(failures)) => {}
        }
    }
}
