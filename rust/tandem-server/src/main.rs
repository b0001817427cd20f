//! room-relay: WebSocket room multiplexer with server-side CRDT replicas.
//!
//! A collaboration relay for a web IDE: clients connect over WebSocket, join
//! a room keyed by URL path, and exchange binary messages the server fans
//! out to the room's other members. Code-editor rooms additionally get an
//! authoritative in-memory CRDT replica; file-tree rooms get typed JSON
//! broadcast; every room is subject to admission, quota, and grace-period
//! cleanup policy.
//!
//! Usage:
//!   cargo run --bin room-relay
//!   # Listens on ws://0.0.0.0:<PORT>/<roomId>
//!
//! See `Config::from_env` for the full list of environment variables.

mod classify;
mod config;
mod connection;
mod document;
mod error;
mod lifecycle;
mod quota;
mod room;
mod save;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::TcpListener;

use config::Config;
use document::DocumentRegistry;
use lifecycle::LifecycleController;
use quota::QuotaTable;
use room::RoomRegistry;

/// Shared, process-wide state handed to every connection task.
pub struct AppState {
    pub config: Arc<Config>,
    pub rooms: Arc<RoomRegistry>,
    pub documents: Arc<DocumentRegistry>,
    pub quota: Arc<QuotaTable>,
    pub lifecycle: Arc<LifecycleController>,
    /// Reused across calls per `reqwest`'s own pooling guidance; wired to
    /// `save::trigger_save` by whatever admin surface an operator adds (see
    /// spec.md §9, the core does not invoke it automatically).
    pub http_client: reqwest::Client,
}

/// Budget for the shutdown sequence (spec.md §6): exit 0 if it completes in
/// time, exit 1 if it has to be force-terminated.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log_panics::init();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        "room-relay starting: bind=0.0.0.0:{}, node_env={}, max_clients_per_room={}, grace_period={:?}",
        config.port, config.node_env, config.max_clients_per_room, config.grace_period
    );

    let listener = match TcpListener::bind(config.bind_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {}", config.bind_addr(), e);
            return ExitCode::FAILURE;
        }
    };
    info!("room-relay listening on ws://{}", config.bind_addr());

    let documents = Arc::new(DocumentRegistry::new());
    let rooms = RoomRegistry::new(documents.clone());
    let quota = Arc::new(QuotaTable::new(config.max_connections_per_ip_per_room));
    let lifecycle =
        LifecycleController::new(config.clone(), rooms.clone(), documents.clone(), quota.clone());

    let http_client = reqwest::Client::new();
    let state = Arc::new(AppState {
        config: config.clone(),
        rooms,
        documents,
        quota,
        lifecycle: lifecycle.clone(),
        http_client,
    });

    let accept_handle = {
        let state = state.clone();
        tokio::spawn(async move { accept_loop(listener, state).await })
    };

    let heartbeat_handle = {
        let lifecycle = lifecycle.clone();
        let interval = state.config.ping_interval;
        tokio::spawn(async move { ticker(interval, move || lifecycle.heartbeat()).await })
    };

    let reap_handle = {
        let lifecycle = lifecycle.clone();
        let interval = state.config.reap_interval;
        tokio::spawn(async move { ticker(interval, move || lifecycle.reap()).await })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");

    accept_handle.abort();
    heartbeat_handle.abort();
    reap_handle.abort();

    match tokio::time::timeout(SHUTDOWN_BUDGET, lifecycle.shutdown()).await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(_) => {
            warn!("shutdown exceeded {:?} budget, forcing exit", SHUTDOWN_BUDGET);
            ExitCode::FAILURE
        }
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<AppState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    connection::handle_connection(stream, peer_addr, state).await;
                });
            }
            Err(e) => {
                warn!("accept failed: {}", e);
            }
        }
    }
}

/// Runs `tick` on a fixed interval until the task is aborted (shutdown).
async fn ticker<F, Fut>(interval: Duration, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        tick().await;
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
