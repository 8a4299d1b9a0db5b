use std::path::PathBuf;
use std::time::Duration;

use opsdesk_core::TaskId;

/// Errors raised while reading the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

/// Console session configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// REST base URL (default: `http://localhost:8000/api`).
    pub api_url: String,
    /// Push channel endpoint (default: `ws://localhost:8000/ws/events`).
    pub ws_url: String,
    /// Seeds the credential store when set.
    pub token: Option<String>,
    /// Persist the credential in this JSON file instead of memory.
    pub credential_file: Option<PathBuf>,
    /// Batch poll cadence (default: 2000 ms).
    pub poll_interval: Duration,
    /// Jobs to follow from the start.
    pub track_task_ids: Vec<TaskId>,
}

impl ConsoleConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default                          |
    /// |---------------------------|----------------------------------|
    /// | `OPSDESK_API_URL`         | `http://localhost:8000/api`      |
    /// | `OPSDESK_WS_URL`          | `ws://localhost:8000/ws/events`  |
    /// | `OPSDESK_TOKEN`           | none                             |
    /// | `OPSDESK_CREDENTIAL_FILE` | none                             |
    /// | `POLL_INTERVAL_MS`        | `2000`                           |
    /// | `TRACK_TASK_IDS`          | empty                            |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = lookup("OPSDESK_API_URL").unwrap_or_else(|| "http://localhost:8000/api".into());
        let ws_url = lookup("OPSDESK_WS_URL").unwrap_or_else(|| "ws://localhost:8000/ws/events".into());

        let token = lookup("OPSDESK_TOKEN").filter(|t| !t.trim().is_empty());
        let credential_file = lookup("OPSDESK_CREDENTIAL_FILE")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        let poll_interval_ms = match lookup("POLL_INTERVAL_MS") {
            None => 2000,
            Some(value) => match value.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => ms,
                _ => {
                    return Err(ConfigError::InvalidNumber {
                        name: "POLL_INTERVAL_MS",
                        value,
                    })
                }
            },
        };

        let track_task_ids = lookup("TRACK_TASK_IDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(TaskId::from)
            .collect();

        Ok(Self {
            api_url,
            ws_url,
            token,
            credential_file,
            poll_interval: Duration::from_millis(poll_interval_ms),
            track_task_ids,
        })
    }
}
