//! `opsdesk-console` -- headless job tracking session.
//!
//! Follows the jobs listed in `TRACK_TASK_IDS` through the batched status
//! endpoint and the live push channel until interrupted.
//!
//! # Environment variables
//!
//! | Variable                  | Required | Default                         | Description                  |
//! |---------------------------|----------|---------------------------------|------------------------------|
//! | `OPSDESK_API_URL`         | no       | `http://localhost:8000/api`     | REST base URL                |
//! | `OPSDESK_WS_URL`          | no       | `ws://localhost:8000/ws/events` | Push channel endpoint        |
//! | `OPSDESK_TOKEN`           | no       | --                              | Session credential           |
//! | `OPSDESK_CREDENTIAL_FILE` | no       | --                              | JSON credential store path   |
//! | `POLL_INTERVAL_MS`        | no       | `2000`                          | Batch poll cadence           |
//! | `TRACK_TASK_IDS`          | no       | --                              | Comma-separated task ids     |

use opsdesk_console::{session, ConsoleConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "opsdesk_console=info,opsdesk_tasks=info,opsdesk_push=info,opsdesk_sync=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ConsoleConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    if let Err(e) = session::run(config, shutdown).await {
        tracing::error!(error = %e, "Console session failed");
        std::process::exit(1);
    }
}
