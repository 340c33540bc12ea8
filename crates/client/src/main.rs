//! `loyalty-client` -- headless runner for the live-sync and spin core.
//!
//! Subscribes to the configured user's spin-balance, check-in and coupon
//! changes and logs them until interrupted.
//!
//! # Environment variables
//!
//! | Variable                     | Required | Default                        |
//! |------------------------------|----------|--------------------------------|
//! | `LOYALTY_USER_ID`            | yes      | --                             |
//! | `REALTIME_WS_URL`            | no       | `ws://localhost:4000/realtime` |
//! | `SPIN_VISIBILITY_MARGIN_MS`  | no       | `5000`                         |
//! | `SPIN_CHECK_INTERVAL_MS`     | no       | `250`                          |
//! | `SPIN_SAFETY_MULTIPLIER`     | no       | `2`                            |
//! | `RECONNECT_INITIAL_DELAY_MS` | no       | `1000`                         |
//! | `RECONNECT_MAX_DELAY_MS`     | no       | `30000`                        |

use std::sync::Arc;

use loyalty_client::{Client, ClientConfig, HeadlessHost};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "loyalty_client=info,loyalty_realtime=info,loyalty_spin=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    tracing::info!(
        user_id = %config.user_id,
        ws_url = %config.ws_url,
        "Starting loyalty-client",
    );

    let client = Client::start(&config, Arc::new(HeadlessHost::default()));

    shutdown_signal().await;
    client.shutdown();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
