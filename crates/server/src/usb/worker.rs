//! USB worker thread
//!
//! Dedicated thread that owns the rusb context and services backend
//! commands from the engine. Transfers are handed to short-lived threads
//! sharing the device handle, so a slow device never stalls claims or
//! cancellations.

use crate::usb::manager::DeviceManager;
use crate::usb::transfers::execute_transfer;
use common::{BackendCommand, BackendError, BackendWorker};
use tracing::{debug, error, info, warn};

pub struct UsbWorkerThread {
    manager: DeviceManager,
    worker: BackendWorker,
}

impl UsbWorkerThread {
    pub fn new(worker: BackendWorker) -> Result<Self, rusb::Error> {
        Ok(Self {
            manager: DeviceManager::new()?,
            worker,
        })
    }

    /// Run until a Shutdown command arrives or the engine side hangs up
    pub fn run(mut self) {
        info!("USB worker thread started");

        loop {
            let command = match self.worker.recv_command() {
                Ok(BackendCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Ok(command) => command,
                Err(_) => {
                    debug!("engine side closed, stopping USB worker");
                    break;
                }
            };

            // A panic in one command must not take the whole thread down
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.handle_command(command)
            }));
            if let Err(panic) = result {
                error!("panic in USB command handler: {:?}", panic);
            }
        }

        info!("USB worker thread stopped");
    }

    fn handle_command(&mut self, command: BackendCommand) {
        match command {
            BackendCommand::ListDevices { response } => {
                let devices = self.manager.list_devices();
                if let Ok(ref devices) = devices {
                    debug!(count = devices.len(), "listing devices");
                }
                let _ = response.send(devices);
            }

            BackendCommand::Claim {
                bus_id,
                device_id,
                response,
            } => {
                let _ = response.send(self.manager.claim(&bus_id, &device_id));
            }

            BackendCommand::Release { handle, response } => {
                let _ = response.send(self.manager.release(handle));
            }

            BackendCommand::OpenInterface {
                handle,
                interface,
                response,
            } => {
                let _ = response.send(self.manager.open_interface(handle, interface));
            }

            BackendCommand::Transfer {
                handle,
                request,
                response,
            } => {
                if self.manager.take_cancelled(request.seqnum) {
                    let _ = response.send(Err(BackendError::Internal(
                        "transfer cancelled before dispatch".to_string(),
                    )));
                    return;
                }

                let device_handle = match self.manager.device_for(handle) {
                    Ok(device) => device.shared_handle(),
                    Err(e) => {
                        let _ = response.send(Err(e));
                        return;
                    }
                };
                let Some(device_handle) = device_handle else {
                    let _ = response.send(Err(BackendError::NotFound));
                    return;
                };

                // libusb's sync API is thread-safe; run the transfer off
                // the worker so other commands keep flowing
                let spawned = std::thread::Builder::new()
                    .name("usb-transfer".to_string())
                    .spawn(move || {
                        let outcome = execute_transfer(&device_handle, &request);
                        let _ = response.send(outcome);
                    });
                if let Err(e) = spawned {
                    warn!(error = %e, "failed to spawn transfer thread");
                }
            }

            BackendCommand::Cancel {
                handle: _,
                seqnum,
                response,
            } => {
                // Synchronous libusb transfers cannot be interrupted; mark
                // the seqnum so a not-yet-started transfer is dropped. The
                // engine's own timeout bounds anything already running.
                self.manager.mark_cancelled(seqnum);
                let _ = response.send(Ok(()));
            }

            BackendCommand::Shutdown => unreachable!("handled in run()"),
        }
    }
}

/// Spawn the USB worker thread
pub fn spawn_usb_worker(worker: BackendWorker) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || match UsbWorkerThread::new(worker) {
            Ok(thread) => thread.run(),
            Err(e) => error!("failed to initialize USB context: {}", e),
        })
}
