//! ==============================================================================
//! main.rs - bloom bridge entry point
//! ==============================================================================
//!
//! purpose:
//!     bridges a plant monitor that talks mqtt to a web client that talks
//!     http. the device publishes readings; the bridge keeps the latest one
//!     and serves it, and turns "water now" requests into a bus command.
//!
//! responsibilities:
//!     - load configuration and start logging
//!     - create the shared reading cache
//!     - run the mqtt session on a background task
//!     - serve the http api until ctrl-c / sigterm
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                       bridge (this file)                      │
//!     │  ┌──────────────────┐                 ┌───────────────────┐  │
//!     │  │ mqtt session     │   ReadingCache  │ http api          │  │
//!     │  │ (bus.rs task)    │ ──── writes ──> │ (gateway.rs)      │  │
//!     │  │ decoder.rs       │ <── publish ─── │ /sensors /water   │  │
//!     │  └────────┬─────────┘   (BusHandle)   └─────────┬─────────┘  │
//!     └───────────┼─────────────────────────────────────┼────────────┘
//!                 │ mqtt                                │ http/json
//!          ┌──────┴──────┐                       ┌──────┴──────┐
//!          │   broker    │                       │  web client │
//!          └─────────────┘                       └─────────────┘
//!
//! failure model:
//!     broker trouble never stops the process. the session retries with
//!     backoff; meanwhile /sensors serves the last (or default) reading and
//!     /water answers 500.
//!
//! ==============================================================================

mod bus;
mod cache;
mod config;
mod decoder;
mod domain;
mod error;
mod gateway;
mod logging;
mod publisher;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::bus::BusSession;
use crate::cache::ReadingCache;
use crate::config::BridgeConfig;
use crate::gateway::AppState;
use crate::publisher::CommandPublisher;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration
    let (mut config, origin) = BridgeConfig::load_or_default();
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate().context("invalid configuration")?;

    logging::init(&config.logging);
    origin.log();
    config.log_summary();

    // step 2: shared state
    let cache = ReadingCache::new();

    // step 3: mqtt session in the background
    let (session, bus) = BusSession::new(&config);
    let mut session_task = tokio::spawn(session.run(cache.clone()));

    // step 4: http api in the foreground
    let commands = CommandPublisher::new(Arc::new(bus.clone()), &config.topics);
    let state = AppState::new(cache, commands, bus.subscribe_state());

    let addr = (config.http.bind_address.as_str(), config.http.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}:{}", addr.0, addr.1))?;
    info!(addr = %listener.local_addr()?, "http api listening");

    axum::serve(listener, gateway::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    // step 5: leave the broker politely
    info!("shutting down");
    if session_task.is_finished() {
        warn!("mqtt session had already stopped");
    }
    bus.shutdown();
    // let the session flush the DISCONNECT before it is dropped
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, &mut session_task).await;
    session_task.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
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
                warn!(error = %e, "sigterm handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
