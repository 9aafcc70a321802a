//! Claim arbitration
//!
//! The arbiter owns the process-wide table of device claims: at most one
//! session holds a device at any instant. Platform exclusivity is acquired
//! through the backend before an entry is recorded, and the persisted claim
//! file is always a superset of the in-memory table so a crashed daemon can
//! reconcile on restart.

use common::{BackendError, BackendHandle, ClaimHandle};
use protocol::{ST_DEVICE_BUSY, ST_NA, ST_NO_SUCH_DEVICE, UsbDevice};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Session id used for entries recovered from the claim file; such entries
/// are adopted by the first session that imports the device
const RECOVERED_SESSION: u64 = 0;

/// Claim failures surfaced in REP_IMPORT
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClaimError {
    /// Another session already holds the device
    #[error("device is already claimed")]
    AlreadyClaimed,

    /// The backend refused platform exclusivity
    #[error("backend refused claim: {0}")]
    BackendRefused(BackendError),
}

impl ClaimError {
    /// Op status code for the REP_IMPORT header
    pub fn op_status(&self) -> u32 {
        match self {
            ClaimError::AlreadyClaimed => ST_DEVICE_BUSY,
            ClaimError::BackendRefused(BackendError::NotFound) => ST_NO_SUCH_DEVICE,
            ClaimError::BackendRefused(BackendError::Busy) => ST_DEVICE_BUSY,
            ClaimError::BackendRefused(_) => ST_NA,
        }
    }
}

/// Token handed to the claiming session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    pub device_key: String,
    pub handle: ClaimHandle,
}

#[derive(Debug, Clone)]
struct ClaimEntry {
    bus_id: String,
    device_id: String,
    owner_session: u64,
    claimed_at: u64,
    handle: ClaimHandle,
}

/// Persisted claim record; identity is stored split because device keys are
/// not self-delimiting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct PersistedClaim {
    bus_id: String,
    device_id: String,
    claimed_at: u64,
}

/// Process-wide claim table
pub struct ClaimArbiter {
    entries: Mutex<HashMap<String, ClaimEntry>>,
    persist_path: Option<PathBuf>,
}

impl ClaimArbiter {
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            persist_path,
        }
    }

    /// Atomically claim `device` for `session`
    ///
    /// Returns the existing token when the same session claims twice and
    /// adopts entries recovered from the claim file. The backend is asked
    /// for platform exclusivity first; on refusal no entry is recorded.
    pub async fn try_claim(
        &self,
        backend: &BackendHandle,
        device: &UsbDevice,
        session: u64,
    ) -> Result<ClaimToken, ClaimError> {
        let key = device.device_key();
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&key) {
            if entry.owner_session == session {
                return Ok(ClaimToken {
                    device_key: key,
                    handle: entry.handle,
                });
            }
            if entry.owner_session == RECOVERED_SESSION {
                info!(device = %key, session, "adopting recovered claim");
                entry.owner_session = session;
                return Ok(ClaimToken {
                    device_key: key,
                    handle: entry.handle,
                });
            }
            return Err(ClaimError::AlreadyClaimed);
        }

        let handle = backend
            .claim(&device.bus_id, &device.device_id)
            .await
            .map_err(ClaimError::BackendRefused)?;

        let entry = ClaimEntry {
            bus_id: device.bus_id.clone(),
            device_id: device.device_id.clone(),
            owner_session: session,
            claimed_at: unix_now(),
            handle,
        };

        // Persist before recording so the file stays a superset of memory
        let mut persisted: Vec<_> = entries.values().collect();
        persisted.push(&entry);
        self.persist(&persisted);

        entries.insert(key.clone(), entry);
        info!(device = %key, session, "claimed device");

        Ok(ClaimToken {
            device_key: key,
            handle,
        })
    }

    /// Release a claim; idempotent
    pub async fn release(&self, backend: &BackendHandle, token: &ClaimToken) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.remove(&token.device_key) else {
            debug!(device = %token.device_key, "release of unheld claim ignored");
            return;
        };
        self.persist(&entries.values().collect::<Vec<_>>());
        drop(entries);

        if let Err(error) = backend.release(entry.handle).await {
            warn!(device = %token.device_key, %error, "backend failed to drop exclusivity");
        }
        info!(device = %token.device_key, "released claim");
    }

    /// Release every claim a session owns; used on session teardown
    pub async fn release_session(&self, backend: &BackendHandle, session: u64) {
        let tokens: Vec<ClaimToken> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .filter(|(_, entry)| entry.owner_session == session)
                .map(|(key, entry)| ClaimToken {
                    device_key: key.clone(),
                    handle: entry.handle,
                })
                .collect()
        };
        for token in tokens {
            self.release(backend, &token).await;
        }
    }

    /// Whether any session holds the device
    pub async fn is_claimed(&self, device_key: &str) -> bool {
        self.entries.lock().await.contains_key(device_key)
    }

    /// Keys currently claimed, for status reporting
    pub async fn claimed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Reconcile persisted claims on startup
    ///
    /// Attempts a backend re-claim for every persisted entry and drops the
    /// ones that fail; the file is rewritten to the surviving set. Returns
    /// the number of recovered claims.
    pub async fn recover(&self, backend: &BackendHandle) -> usize {
        let Some(ref path) = self.persist_path else {
            return 0;
        };
        let persisted: Vec<PersistedClaim> = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => return 0,
        };
        if persisted.is_empty() {
            return 0;
        }

        let mut entries = self.entries.lock().await;
        for claim in persisted {
            let key = format!("{}-{}", claim.bus_id, claim.device_id);
            match backend.claim(&claim.bus_id, &claim.device_id).await {
                Ok(handle) => {
                    info!(device = %key, "recovered persisted claim");
                    entries.insert(
                        key,
                        ClaimEntry {
                            bus_id: claim.bus_id,
                            device_id: claim.device_id,
                            owner_session: RECOVERED_SESSION,
                            claimed_at: claim.claimed_at,
                            handle,
                        },
                    );
                }
                Err(error) => {
                    warn!(device = %key, %error, "dropping unrecoverable claim");
                }
            }
        }
        self.persist(&entries.values().collect::<Vec<_>>());
        entries.len()
    }

    fn persist(&self, entries: &[&ClaimEntry]) {
        let Some(ref path) = self.persist_path else {
            return;
        };
        let persisted: Vec<PersistedClaim> = entries
            .iter()
            .map(|entry| PersistedClaim {
                bus_id: entry.bus_id.clone(),
                device_id: entry.device_id.clone(),
                claimed_at: entry.claimed_at,
            })
            .collect();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&persisted) {
            Ok(content) => {
                if let Err(error) = std::fs::write(path, content) {
                    warn!(%error, "failed to persist claim state");
                }
            }
            Err(error) => warn!(%error, "failed to serialize claim state"),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockBackendConfig, spawn_mock_backend, test_device};

    #[tokio::test]
    async fn test_exclusive_claim() {
        let (backend, _state) = spawn_mock_backend(MockBackendConfig {
            devices: vec![test_device("1-1", "1-4")],
            ..Default::default()
        });
        let arbiter = ClaimArbiter::new(None);
        let device = test_device("1-1", "1-4");

        let token = arbiter.try_claim(&backend, &device, 1).await.unwrap();
        assert!(arbiter.is_claimed(&device.device_key()).await);

        // Same session re-claims and gets the same token
        let again = arbiter.try_claim(&backend, &device, 1).await.unwrap();
        assert_eq!(again, token);

        // A different session is refused
        assert_eq!(
            arbiter.try_claim(&backend, &device, 2).await.unwrap_err(),
            ClaimError::AlreadyClaimed
        );

        arbiter.release(&backend, &token).await;
        assert!(!arbiter.is_claimed(&device.device_key()).await);

        // Release is idempotent
        arbiter.release(&backend, &token).await;
    }

    #[tokio::test]
    async fn test_backend_refusal_records_nothing() {
        let mut config = MockBackendConfig {
            devices: vec![test_device("1-1", "1-4")],
            ..Default::default()
        };
        config
            .claim_errors
            .insert("1-1".to_string(), BackendError::AccessDenied);
        let (backend, _state) = spawn_mock_backend(config);

        let arbiter = ClaimArbiter::new(None);
        let device = test_device("1-1", "1-4");
        let error = arbiter.try_claim(&backend, &device, 1).await.unwrap_err();
        assert_eq!(
            error,
            ClaimError::BackendRefused(BackendError::AccessDenied)
        );
        assert!(!arbiter.is_claimed(&device.device_key()).await);
    }

    #[tokio::test]
    async fn test_session_release_cascade() {
        let (backend, state) = spawn_mock_backend(MockBackendConfig {
            devices: vec![test_device("1-1", "1-4"), test_device("2-1", "2-3")],
            ..Default::default()
        });
        let arbiter = ClaimArbiter::new(None);

        arbiter
            .try_claim(&backend, &test_device("1-1", "1-4"), 7)
            .await
            .unwrap();
        arbiter
            .try_claim(&backend, &test_device("2-1", "2-3"), 7)
            .await
            .unwrap();
        assert_eq!(arbiter.claimed_keys().await.len(), 2);

        arbiter.release_session(&backend, 7).await;
        assert!(arbiter.claimed_keys().await.is_empty());
        assert_eq!(state.released.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_persistence_and_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claims.json");

        {
            let (backend, _state) = spawn_mock_backend(MockBackendConfig {
                devices: vec![test_device("1-1", "1-4"), test_device("2-1", "2-3")],
                ..Default::default()
            });
            let arbiter = ClaimArbiter::new(Some(path.clone()));
            arbiter
                .try_claim(&backend, &test_device("1-1", "1-4"), 1)
                .await
                .unwrap();
            arbiter
                .try_claim(&backend, &test_device("2-1", "2-3"), 1)
                .await
                .unwrap();
        }

        // Restart: "2-1" can no longer be claimed and must be dropped
        let mut config = MockBackendConfig {
            devices: vec![test_device("1-1", "1-4"), test_device("2-1", "2-3")],
            ..Default::default()
        };
        config
            .claim_errors
            .insert("2-1".to_string(), BackendError::Busy);
        let (backend, _state) = spawn_mock_backend(config);

        let arbiter = ClaimArbiter::new(Some(path.clone()));
        let recovered = arbiter.recover(&backend).await;
        assert_eq!(recovered, 1);
        assert!(arbiter.is_claimed("1-1-1-4").await);
        assert!(!arbiter.is_claimed("2-1-2-3").await);

        // The rewritten file holds only the surviving entry
        let content = std::fs::read_to_string(&path).unwrap();
        let persisted: Vec<PersistedClaim> = serde_json::from_str(&content).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].bus_id, "1-1");

        // A recovered claim is adopted by the next importer
        let token = arbiter
            .try_claim(&backend, &test_device("1-1", "1-4"), 42)
            .await
            .unwrap();
        assert_eq!(token.device_key, "1-1-1-4");
    }
}
