//! Shared test fixtures
//!
//! Provides a scripted mock backend that services [`BackendCommand`]s from
//! a tokio task, so engine and end-to-end tests run without USB hardware.
//! Transfers execute concurrently: each one runs in its own task and can be
//! delayed or cancelled mid-flight, which is what the unlink tests need.

use crate::backend::{
    BackendError, ClaimHandle, TransferData, TransferOutcome, TransferRequest,
};
use crate::channel::{BackendCommand, BackendHandle, BackendWorker, create_backend_bridge};
use bytes::Bytes;
use protocol::{DeviceSpeed, Direction, UsbDevice};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// A canned device for tests
pub fn test_device(bus_id: &str, device_id: &str) -> UsbDevice {
    let (bus_num, dev_num) = parse_nums(device_id);
    UsbDevice {
        bus_id: bus_id.to_string(),
        device_id: device_id.to_string(),
        bus_num,
        dev_num,
        vendor_id: 0x1234,
        product_id: 0x5678,
        bcd_device: 0x0100,
        class: 0x00,
        subclass: 0x00,
        protocol: 0x00,
        configuration_value: 1,
        num_configurations: 1,
        num_interfaces: 1,
        speed: DeviceSpeed::High,
        manufacturer: Some("Mock".to_string()),
        product: Some("Device".to_string()),
        serial: Some("MOCK0001".to_string()),
    }
}

fn parse_nums(device_id: &str) -> (u32, u32) {
    let mut parts = device_id.split('-');
    let bus = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1);
    let dev = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1);
    (bus, dev)
}

/// Scripted result for transfers matching an endpoint/direction pair
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// IN transfer returns these bytes
    InData(Bytes),
    /// OUT transfer acknowledges this many bytes (None = the full request)
    OutAck(Option<u32>),
    /// Transfer fails with this backend error
    Error(BackendError),
}

/// One scripted transfer behavior
#[derive(Debug, Clone)]
pub struct MockTransferScript {
    pub endpoint: u8,
    pub direction: Direction,
    /// Simulated device latency before the outcome resolves
    pub delay: Duration,
    pub outcome: MockOutcome,
}

/// Mock backend configuration
#[derive(Default)]
pub struct MockBackendConfig {
    pub devices: Vec<UsbDevice>,
    /// Claim failures injected per bus id
    pub claim_errors: HashMap<String, BackendError>,
    pub scripts: Vec<MockTransferScript>,
}

/// Observable mock state, shared with the test body
#[derive(Default)]
pub struct MockBackendState {
    /// Bus ids currently claimed
    pub claims: Mutex<Vec<String>>,
    /// Bus ids whose claim was released
    pub released: Mutex<Vec<String>>,
    /// Seqnums the engine asked to cancel
    pub cancelled: Mutex<Vec<u32>>,
    /// (claim handle, interface) pairs opened
    pub opened_interfaces: Mutex<Vec<(u32, u8)>>,
    /// Number of transfers handed to the backend
    pub transfers_started: AtomicUsize,
    /// Number of ListDevices commands serviced
    pub enumerations: AtomicUsize,
}

/// Spawn the mock backend task and return the engine-side handle
pub fn spawn_mock_backend(config: MockBackendConfig) -> (BackendHandle, Arc<MockBackendState>) {
    let (handle, worker) = create_backend_bridge();
    let state = Arc::new(MockBackendState::default());
    let task_state = state.clone();
    tokio::spawn(run_mock_backend(worker, config, task_state));
    (handle, state)
}

async fn run_mock_backend(
    worker: BackendWorker,
    config: MockBackendConfig,
    state: Arc<MockBackendState>,
) {
    let mut next_handle = 1u32;
    let mut claimed: HashMap<ClaimHandle, String> = HashMap::new();
    let mut pending: HashMap<u32, Arc<Notify>> = HashMap::new();

    while let Ok(cmd) = worker.recv().await {
        match cmd {
            BackendCommand::ListDevices { response } => {
                state.enumerations.fetch_add(1, Ordering::SeqCst);
                let _ = response.send(Ok(config.devices.clone()));
            }

            BackendCommand::Claim {
                bus_id,
                device_id,
                response,
            } => {
                let result = if let Some(err) = config.claim_errors.get(&bus_id) {
                    Err(err.clone())
                } else if config
                    .devices
                    .iter()
                    .any(|d| d.bus_id == bus_id && d.device_id == device_id)
                {
                    let handle = ClaimHandle(next_handle);
                    next_handle += 1;
                    debug!(%bus_id, handle = handle.0, "mock claim");
                    claimed.insert(handle, bus_id.clone());
                    state.claims.lock().unwrap().push(bus_id);
                    Ok(handle)
                } else {
                    Err(BackendError::NotFound)
                };
                let _ = response.send(result);
            }

            BackendCommand::Release { handle, response } => {
                let result = match claimed.remove(&handle) {
                    Some(bus_id) => {
                        state.released.lock().unwrap().push(bus_id);
                        Ok(())
                    }
                    None => Err(BackendError::NotFound),
                };
                let _ = response.send(result);
            }

            BackendCommand::OpenInterface {
                handle,
                interface,
                response,
            } => {
                let result = if claimed.contains_key(&handle) {
                    state
                        .opened_interfaces
                        .lock()
                        .unwrap()
                        .push((handle.0, interface));
                    Ok(())
                } else {
                    Err(BackendError::NotFound)
                };
                let _ = response.send(result);
            }

            BackendCommand::Transfer {
                handle,
                request,
                response,
            } => {
                if !claimed.contains_key(&handle) {
                    let _ = response.send(Err(BackendError::NotFound));
                    continue;
                }
                state.transfers_started.fetch_add(1, Ordering::SeqCst);

                let script = config
                    .scripts
                    .iter()
                    .find(|s| s.endpoint == request.endpoint && s.direction == request.direction)
                    .cloned();

                let cancel = Arc::new(Notify::new());
                pending.insert(request.seqnum, cancel.clone());

                tokio::spawn(async move {
                    let delay = script.as_ref().map_or(Duration::ZERO, |s| s.delay);
                    let outcome = tokio::select! {
                        _ = tokio::time::sleep(delay) => resolve_script(&request, script),
                        _ = cancel.notified() => {
                            Err(BackendError::Internal("transfer cancelled".to_string()))
                        }
                    };
                    let _ = response.send(outcome);
                });
            }

            BackendCommand::Cancel {
                handle: _,
                seqnum,
                response,
            } => {
                state.cancelled.lock().unwrap().push(seqnum);
                if let Some(notify) = pending.remove(&seqnum) {
                    notify.notify_waiters();
                }
                let _ = response.send(Ok(()));
            }

            BackendCommand::Shutdown => break,
        }
    }
}

fn resolve_script(request: &TransferRequest, script: Option<MockTransferScript>) -> TransferOutcome {
    let completion_time = script.as_ref().map_or(Duration::ZERO, |s| s.delay);
    match script.map(|s| s.outcome) {
        Some(MockOutcome::Error(err)) => Err(err),
        Some(MockOutcome::InData(data)) => Ok(TransferData {
            actual_length: data.len() as u32,
            data: Some(data),
            error_count: 0,
            start_frame: request.iso.map_or(0, |iso| iso.start_frame),
            completion_time,
        }),
        Some(MockOutcome::OutAck(len)) => Ok(TransferData {
            actual_length: len.unwrap_or(request.buffer_length),
            data: None,
            error_count: 0,
            start_frame: request.iso.map_or(0, |iso| iso.start_frame),
            completion_time,
        }),
        // No script: IN returns nothing, OUT acknowledges everything
        None => match request.direction {
            Direction::In => Ok(TransferData {
                actual_length: 0,
                data: None,
                error_count: 0,
                start_frame: 0,
                completion_time,
            }),
            Direction::Out => Ok(TransferData {
                actual_length: request.buffer_length,
                data: None,
                error_count: 0,
                start_frame: 0,
                completion_time,
            }),
        },
    }
}
