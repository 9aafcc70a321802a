//! Daemon status snapshot and live counters
//!
//! The daemon keeps its counters in shared atomics and periodically writes
//! a JSON snapshot next to the config file; `usbipd status` reads that
//! snapshot from a separate process.

use crate::usb::claim::ClaimArbiter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// How often the daemon refreshes the status snapshot
pub const STATUS_REFRESH: Duration = Duration::from_secs(2);

/// A snapshot is considered fresh within this window
pub const STATUS_STALE_AFTER: Duration = Duration::from_secs(10);

/// Live counters shared across the listener and sessions
#[derive(Debug, Default)]
pub struct ServerCounters {
    pub active_connections: AtomicUsize,
    pub in_flight_urbs: AtomicUsize,
}

impl ServerCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Persisted daemon status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: u32,
    /// Unix seconds the daemon started
    pub started_at: u64,
    /// Unix seconds this snapshot was written
    pub updated_at: u64,
    pub port: u16,
    pub active_connections: usize,
    pub in_flight_urbs: usize,
    /// Device keys currently claimed by sessions
    pub claimed_devices: Vec<String>,
}

impl DaemonStatus {
    pub fn read_from(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn write_to(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(self) {
            Ok(content) => {
                if let Err(e) = std::fs::write(path, content) {
                    warn!("Failed to write status snapshot: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize status snapshot: {}", e),
        }
    }

    /// Whether the snapshot is recent enough to trust
    pub fn is_fresh(&self) -> bool {
        let now = unix_now();
        now.saturating_sub(self.updated_at) <= STATUS_STALE_AFTER.as_secs()
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Periodically refresh the status snapshot until shutdown is signalled
pub async fn run_status_writer(
    path: PathBuf,
    port: u16,
    started_at: u64,
    counters: Arc<ServerCounters>,
    claims: Arc<ClaimArbiter>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(STATUS_REFRESH);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let status = DaemonStatus {
                    running: true,
                    pid: std::process::id(),
                    started_at,
                    updated_at: unix_now(),
                    port,
                    active_connections: counters.active_connections.load(Ordering::SeqCst),
                    in_flight_urbs: counters.in_flight_urbs.load(Ordering::SeqCst),
                    claimed_devices: claims.claimed_keys().await,
                };
                status.write_to(&path);
            }
            _ = shutdown.changed() => break,
        }
    }

    // Final snapshot so `status` reports a clean stop
    let status = DaemonStatus {
        running: false,
        pid: std::process::id(),
        started_at,
        updated_at: unix_now(),
        port,
        active_connections: 0,
        in_flight_urbs: 0,
        claimed_devices: Vec::new(),
    };
    status.write_to(&path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let status = DaemonStatus {
            running: true,
            pid: 42,
            started_at: 100,
            updated_at: unix_now(),
            port: 3240,
            active_connections: 2,
            in_flight_urbs: 7,
            claimed_devices: vec!["1-1-1-4".to_string()],
        };
        status.write_to(&path);
        let read = DaemonStatus::read_from(&path).unwrap();
        assert_eq!(read, status);
        assert!(read.is_fresh());
    }

    #[test]
    fn test_stale_snapshot() {
        let status = DaemonStatus {
            running: true,
            pid: 42,
            started_at: 100,
            updated_at: 100,
            port: 3240,
            active_connections: 0,
            in_flight_urbs: 0,
            claimed_devices: Vec::new(),
        };
        assert!(!status.is_fresh());
    }

    #[test]
    fn test_missing_snapshot() {
        assert!(DaemonStatus::read_from(Path::new("/nonexistent/status.json")).is_none());
    }
}
