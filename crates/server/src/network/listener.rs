//! TCP listener
//!
//! Binds the USB/IP port, enforces the connection limit and spawns one
//! session task per accepted connection. Shutdown closes the listening
//! socket first, lets sessions finish their current request, and aborts
//! whatever is left after a grace period.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::network::session::Session;
use crate::state::ServerCounters;
use crate::usb::claim::ClaimArbiter;
use crate::usb::registry::DeviceRegistry;
use common::BackendHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// How long sessions get to finish their current request on shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Listener {
    config: Arc<RwLock<ServerConfig>>,
    backend: BackendHandle,
    registry: Arc<DeviceRegistry>,
    claims: Arc<ClaimArbiter>,
    counters: Arc<ServerCounters>,
    next_session: AtomicU64,
}

impl Listener {
    pub fn new(
        config: Arc<RwLock<ServerConfig>>,
        backend: BackendHandle,
        registry: Arc<DeviceRegistry>,
        claims: Arc<ClaimArbiter>,
        counters: Arc<ServerCounters>,
    ) -> Self {
        Self {
            config,
            backend,
            registry,
            claims,
            counters,
            next_session: AtomicU64::new(1),
        }
    }

    /// Bind the configured port with a backlog of max(max_connections, 16)
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let (port, max_connections) = {
            let config = self.config.read().await;
            (config.port, config.max_connections)
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        let socket =
            TcpSocket::new_v4().map_err(|e| ServerError::BindFailed(e.to_string()))?;
        socket
            .set_reuseaddr(true)
            .map_err(|e| ServerError::BindFailed(e.to_string()))?;
        socket
            .bind(addr)
            .map_err(|e| ServerError::BindFailed(format!("{}: {}", addr, e)))?;

        let backlog = max_connections.max(16) as u32;
        let listener = socket
            .listen(backlog)
            .map_err(|e| ServerError::BindFailed(e.to_string()))?;

        info!(%addr, backlog, "listening");
        Ok(listener)
    }

    /// Accept connections until shutdown is signalled, then drain
    pub async fn run(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown requested, closing listener");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            warn!(%error, "accept failed");
                            continue;
                        }
                    };

                    let max_connections = self.config.read().await.max_connections;
                    let active = self.counters.active_connections.load(Ordering::SeqCst);
                    if active >= max_connections {
                        // Accepted then immediately closed; no partial-open
                        // state survives
                        warn!(%addr, active, max_connections, "connection limit reached, refusing");
                        drop(stream);
                        continue;
                    }

                    let session_id = self.next_session.fetch_add(1, Ordering::SeqCst);
                    let connection_timeout = {
                        let config = self.config.read().await;
                        Duration::from_secs(config.connection_timeout)
                    };
                    let session = Session::new(
                        session_id,
                        self.backend.clone(),
                        self.registry.clone(),
                        self.claims.clone(),
                        self.counters.clone(),
                        connection_timeout,
                        shutdown.clone(),
                    );

                    self.counters.active_connections.fetch_add(1, Ordering::SeqCst);
                    let counters = self.counters.clone();
                    sessions.spawn(async move {
                        if let Err(error) = session.run(stream).await {
                            warn!(session = session_id, %error, "session ended with error");
                        }
                        counters.active_connections.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }

        // Close the listening socket before draining sessions
        drop(listener);

        let drain = async {
            while sessions.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(
                remaining = sessions.len(),
                "grace period elapsed, aborting remaining sessions"
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        info!("listener stopped");
        Ok(())
    }
}
