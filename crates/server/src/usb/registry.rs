//! Exportable-device registry
//!
//! Enumerates devices through the backend and filters them through the
//! configured allow-list. Enumerations are coalesced behind a short cache
//! window so a burst of DEVLIST requests hits the backend once.

use crate::config::ServerConfig;
use common::{BackendError, BackendHandle};
use protocol::UsbDevice;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Maximum staleness of a cached enumeration
pub const CACHE_WINDOW: Duration = Duration::from_secs(1);

struct CachedSnapshot {
    taken_at: Instant,
    devices: Vec<UsbDevice>,
}

/// Registry of exportable devices
pub struct DeviceRegistry {
    backend: BackendHandle,
    config: Arc<RwLock<ServerConfig>>,
    cache: Mutex<Option<CachedSnapshot>>,
}

impl DeviceRegistry {
    pub fn new(backend: BackendHandle, config: Arc<RwLock<ServerConfig>>) -> Self {
        Self {
            backend,
            config,
            cache: Mutex::new(None),
        }
    }

    /// Current exportable devices, allow-list applied
    pub async fn list(&self) -> Result<Vec<UsbDevice>, BackendError> {
        let devices = self.snapshot().await?;
        let config = self.config.read().await;
        Ok(devices
            .into_iter()
            .filter(|device| config.is_device_allowed(&device.bus_id, &device.device_key()))
            .collect())
    }

    /// Find an exportable device by bus id
    pub async fn lookup_bus_id(&self, bus_id: &str) -> Result<Option<UsbDevice>, BackendError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|device| device.bus_id == bus_id))
    }

    /// Find an exportable device by full identity
    pub async fn lookup(
        &self,
        bus_id: &str,
        device_id: &str,
    ) -> Result<Option<UsbDevice>, BackendError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|device| device.bus_id == bus_id && device.device_id == device_id))
    }

    /// Unfiltered enumeration, coalesced behind the cache window
    async fn snapshot(&self) -> Result<Vec<UsbDevice>, BackendError> {
        let mut cache = self.cache.lock().await;
        if let Some(ref snapshot) = *cache {
            if snapshot.taken_at.elapsed() <= CACHE_WINDOW {
                return Ok(snapshot.devices.clone());
            }
        }

        let devices = self.backend.list_devices().await?;
        debug!(count = devices.len(), "refreshed device enumeration");
        *cache = Some(CachedSnapshot {
            taken_at: Instant::now(),
            devices: devices.clone(),
        });
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockBackendConfig, spawn_mock_backend, test_device};
    use std::sync::atomic::Ordering;

    fn shared_config(allowed: Vec<String>) -> Arc<RwLock<ServerConfig>> {
        Arc::new(RwLock::new(ServerConfig {
            allowed_devices: allowed,
            ..ServerConfig::default()
        }))
    }

    #[tokio::test]
    async fn test_empty_allow_list_exports_all() {
        let (backend, _state) = spawn_mock_backend(MockBackendConfig {
            devices: vec![test_device("1-1", "1-4"), test_device("2-1", "2-3")],
            ..Default::default()
        });
        let registry = DeviceRegistry::new(backend, shared_config(Vec::new()));

        let devices = registry.list().await.unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[tokio::test]
    async fn test_allow_list_filters() {
        let (backend, _state) = spawn_mock_backend(MockBackendConfig {
            devices: vec![test_device("1-1", "1-4"), test_device("2-1", "2-3")],
            ..Default::default()
        });
        let registry = DeviceRegistry::new(backend, shared_config(vec!["1-1".to_string()]));

        let devices = registry.list().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].bus_id, "1-1");

        assert!(registry.lookup_bus_id("2-1").await.unwrap().is_none());
        assert!(registry.lookup_bus_id("1-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_enumeration_coalesced_within_window() {
        let (backend, state) = spawn_mock_backend(MockBackendConfig {
            devices: vec![test_device("1-1", "1-4")],
            ..Default::default()
        });
        let registry = DeviceRegistry::new(backend, shared_config(Vec::new()));

        registry.list().await.unwrap();
        registry.list().await.unwrap();
        registry.lookup("1-1", "1-4").await.unwrap();
        assert_eq!(state.enumerations.load(Ordering::SeqCst), 1);
    }
}
