use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::DuetError;
use crate::matchmaker::Matchmaker;
use crate::verify::Verifier;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Shared state for the relay server.
pub struct ServerState {
    /// Matchmaking queue and room registry.
    pub matchmaker: Matchmaker,
    /// External human-verification collaborator client.
    pub verifier: Verifier,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Per-IP connection counter for enforcing connection limits.
    pub ip_connections: DashMap<IpAddr, usize>,
    /// Atomic counter for active connections.
    pub active_connections: AtomicUsize,
    /// Source of transport-assigned connection identifiers.
    pub next_conn_id: AtomicU64,
    /// Semaphore to limit unverified (pre-gate) connections.
    pub pre_verify_semaphore: Semaphore,
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), DuetError> {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the server accept loop with an externally-controlled shutdown signal.
///
/// When a value is sent on the paired sender (or the sender is dropped),
/// the accept loop stops accepting new connections and waits for in-flight
/// connections to finish.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: tokio::sync::watch::Receiver<()>,
) -> Result<(), DuetError> {
    let local_addr = listener.local_addr().map_err(DuetError::Io)?;
    info!("relay listening on {}", local_addr);
    let task_tracker = Arc::new(tokio::sync::Notify::new());

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if state.active_connections.load(Ordering::Relaxed) >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        state.active_connections.fetch_add(1, Ordering::Relaxed);
                        let state = Arc::clone(&state);
                        let tracker = task_tracker.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, Arc::clone(&state)).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                            state.active_connections.fetch_sub(1, Ordering::Relaxed);
                            tracker.notify_one();
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!(
                    "shutdown signal received, draining {} connections",
                    state.active_connections.load(Ordering::Relaxed)
                );
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (with timeout). Each task
    // decrements the counter before it notifies, so rechecking the counter
    // after every wakeup cannot miss the final completion.
    let drain_timeout = std::time::Duration::from_secs(30);
    let deadline = tokio::time::Instant::now() + drain_timeout;
    while state.active_connections.load(Ordering::Relaxed) > 0 {
        if tokio::time::timeout_at(deadline, task_tracker.notified())
            .await
            .is_err()
        {
            warn!(
                "drain timeout reached with {} connections still active",
                state.active_connections.load(Ordering::Relaxed)
            );
            break;
        }
    }

    info!("server shut down gracefully");
    Ok(())
}
