//! Async channel bridge between the tokio runtime and the USB backend
//!
//! The platform USB implementation runs in its own worker (a dedicated
//! thread for the rusb backend, a task for the mock backend). The engine
//! talks to it through [`BackendHandle`]; each command carries a oneshot
//! for its reply, so callers suspend until the backend answers.

use crate::backend::{BackendError, ClaimHandle, TransferOutcome, TransferRequest};
use async_channel::{Receiver, Sender, bounded};
use protocol::UsbDevice;
use tokio::sync::oneshot;

/// Commands from the engine to the backend worker
#[derive(Debug)]
pub enum BackendCommand {
    /// Enumerate exportable devices
    ListDevices {
        response: oneshot::Sender<Result<Vec<UsbDevice>, BackendError>>,
    },

    /// Acquire platform-level exclusivity on a device
    Claim {
        bus_id: String,
        device_id: String,
        response: oneshot::Sender<Result<ClaimHandle, BackendError>>,
    },

    /// Drop exclusivity for a previously issued handle
    Release {
        handle: ClaimHandle,
        response: oneshot::Sender<Result<(), BackendError>>,
    },

    /// Open an interface on a claimed device; idempotent
    OpenInterface {
        handle: ClaimHandle,
        interface: u8,
        response: oneshot::Sender<Result<(), BackendError>>,
    },

    /// Execute one transfer
    Transfer {
        handle: ClaimHandle,
        request: TransferRequest,
        response: oneshot::Sender<TransferOutcome>,
    },

    /// Best-effort cancellation of an in-flight transfer by seqnum
    Cancel {
        handle: ClaimHandle,
        seqnum: u32,
        response: oneshot::Sender<Result<(), BackendError>>,
    },

    /// Shut the backend worker down gracefully
    Shutdown,
}

/// Handle for the tokio runtime (async side)
#[derive(Clone)]
pub struct BackendHandle {
    cmd_tx: Sender<BackendCommand>,
}

impl BackendHandle {
    async fn send(&self, cmd: BackendCommand) -> Result<(), BackendError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| BackendError::Disconnected)
    }

    pub async fn list_devices(&self) -> Result<Vec<UsbDevice>, BackendError> {
        let (tx, rx) = oneshot::channel();
        self.send(BackendCommand::ListDevices { response: tx }).await?;
        rx.await.map_err(|_| BackendError::Disconnected)?
    }

    pub async fn claim(
        &self,
        bus_id: &str,
        device_id: &str,
    ) -> Result<ClaimHandle, BackendError> {
        let (tx, rx) = oneshot::channel();
        self.send(BackendCommand::Claim {
            bus_id: bus_id.to_string(),
            device_id: device_id.to_string(),
            response: tx,
        })
        .await?;
        rx.await.map_err(|_| BackendError::Disconnected)?
    }

    pub async fn release(&self, handle: ClaimHandle) -> Result<(), BackendError> {
        let (tx, rx) = oneshot::channel();
        self.send(BackendCommand::Release {
            handle,
            response: tx,
        })
        .await?;
        rx.await.map_err(|_| BackendError::Disconnected)?
    }

    pub async fn open_interface(
        &self,
        handle: ClaimHandle,
        interface: u8,
    ) -> Result<(), BackendError> {
        let (tx, rx) = oneshot::channel();
        self.send(BackendCommand::OpenInterface {
            handle,
            interface,
            response: tx,
        })
        .await?;
        rx.await.map_err(|_| BackendError::Disconnected)?
    }

    pub async fn transfer(
        &self,
        handle: ClaimHandle,
        request: TransferRequest,
    ) -> TransferOutcome {
        let (tx, rx) = oneshot::channel();
        self.send(BackendCommand::Transfer {
            handle,
            request,
            response: tx,
        })
        .await?;
        rx.await.map_err(|_| BackendError::Disconnected)?
    }

    pub async fn cancel(&self, handle: ClaimHandle, seqnum: u32) -> Result<(), BackendError> {
        let (tx, rx) = oneshot::channel();
        self.send(BackendCommand::Cancel {
            handle,
            seqnum,
            response: tx,
        })
        .await?;
        rx.await.map_err(|_| BackendError::Disconnected)?
    }

    /// Ask the worker to exit; safe to call more than once
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.cmd_tx
            .send(BackendCommand::Shutdown)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the backend worker (blocking or async side)
pub struct BackendWorker {
    cmd_rx: Receiver<BackendCommand>,
}

impl BackendWorker {
    /// Receive a command, blocking the current thread
    pub fn recv_command(&self) -> crate::Result<BackendCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<BackendCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Receive a command asynchronously (mock backends run as tasks)
    pub async fn recv(&self) -> crate::Result<BackendCommand> {
        self.cmd_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between the engine and the backend worker
pub fn create_backend_bridge() -> (BackendHandle, BackendWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    (BackendHandle { cmd_tx }, BackendWorker { cmd_rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (handle, worker) = create_backend_bridge();

        // Simulate a backend worker on a plain thread
        let join = std::thread::spawn(move || {
            let cmd = worker.recv_command().unwrap();
            match cmd {
                BackendCommand::ListDevices { response } => {
                    let _ = response.send(Ok(Vec::new()));
                    true
                }
                _ => false,
            }
        });

        let devices = handle.list_devices().await.unwrap();
        assert!(devices.is_empty());
        assert!(join.join().unwrap());
    }

    #[tokio::test]
    async fn test_dropped_worker_is_disconnected() {
        let (handle, worker) = create_backend_bridge();
        drop(worker);
        assert_eq!(
            handle.list_devices().await.unwrap_err(),
            BackendError::Disconnected
        );
    }
}
