//! Per-connection session
//!
//! One session per accepted TCP connection. The read path is strictly
//! ordered: op-phase requests (DEVLIST, IMPORT) are answered inline, and
//! after a successful import the session routes SUBMIT/UNLINK to the URB
//! processors. SUBMIT admission happens on the read loop so UNLINK ordering
//! holds; dispatch runs as its own task per URB. Replies share one write
//! mutex, so they never interleave on the socket.

use crate::state::ServerCounters;
use crate::usb::claim::ClaimArbiter;
use crate::usb::registry::DeviceRegistry;
use crate::usb::submit::{self, SharedWriter, TransferContext, write_reply};
use crate::usb::tracker::UrbTracker;
use crate::usb::unlink;
use anyhow::{Result, anyhow};
use common::BackendHandle;
use protocol::{
    DevlistReply, ExportedDevice, ImportReply, ImportRequest, Request, read_request_async,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

/// Session phase: op requests first, then the imported-device command loop
enum Phase {
    Op,
    Imported(TransferContext),
}

pub struct Session {
    id: u64,
    backend: BackendHandle,
    registry: Arc<DeviceRegistry>,
    claims: Arc<ClaimArbiter>,
    counters: Arc<ServerCounters>,
    connection_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Session {
    pub fn new(
        id: u64,
        backend: BackendHandle,
        registry: Arc<DeviceRegistry>,
        claims: Arc<ClaimArbiter>,
        counters: Arc<ServerCounters>,
        connection_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            backend,
            registry,
            claims,
            counters,
            connection_timeout,
            shutdown,
        }
    }

    /// Drive the session until disconnect, idle timeout, protocol error or
    /// server shutdown; teardown always runs
    pub async fn run(mut self, stream: TcpStream) -> Result<()> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!(session = self.id, %peer, "session started");

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(write_half)));

        let mut phase = Phase::Op;
        let mut shutdown = self.shutdown.clone();

        let result = loop {
            let request = tokio::select! {
                _ = shutdown.changed() => {
                    info!(session = self.id, "shutting down session");
                    break Ok(());
                }
                read = tokio::time::timeout(
                    self.connection_timeout,
                    read_request_async(&mut reader),
                ) => match read {
                    Err(_) => {
                        info!(session = self.id, "idle timeout, closing session");
                        break Ok(());
                    }
                    Ok(Ok(None)) => {
                        debug!(session = self.id, "peer closed the connection");
                        break Ok(());
                    }
                    Ok(Ok(Some(request))) => request,
                    Ok(Err(error)) => {
                        // Codec errors are the only connection-fatal ones
                        warn!(session = self.id, %error, "protocol error, closing session");
                        break Err(error.into());
                    }
                },
            };

            debug!(session = self.id, request = request.name(), "request");
            match self.handle_request(&mut phase, &writer, request).await {
                Ok(()) => {}
                Err(error) => break Err(error),
            }
        };

        self.teardown(phase).await;
        info!(session = self.id, %peer, "session closed");
        result
    }

    async fn handle_request(
        &mut self,
        phase: &mut Phase,
        writer: &SharedWriter,
        request: Request,
    ) -> Result<()> {
        match request {
            Request::Devlist => {
                if !matches!(phase, Phase::Op) {
                    return self.violation(&request);
                }
                self.handle_devlist(writer).await
            }
            Request::Import(import) => {
                if !matches!(phase, Phase::Op) {
                    return self.violation(&Request::Import(import));
                }
                if let Some(ctx) = self.handle_import(writer, &import).await? {
                    *phase = Phase::Imported(ctx);
                }
                Ok(())
            }
            Request::Submit(request) => {
                let Phase::Imported(ctx) = phase else {
                    return self.violation(&Request::Submit(request));
                };
                match submit::admit(ctx, &request) {
                    Ok(urb) => {
                        let ctx = ctx.clone();
                        let session = self.id;
                        tokio::spawn(async move {
                            if let Err(error) = submit::dispatch(ctx, urb).await {
                                error!(session, %error, "failed to complete SUBMIT");
                            }
                        });
                        Ok(())
                    }
                    Err(error) => submit::reject(ctx, &request, &error).await,
                }
            }
            Request::Unlink(request) => {
                let Phase::Imported(ctx) = phase else {
                    return self.violation(&Request::Unlink(request));
                };
                unlink::handle_unlink(ctx, &request).await
            }
        }
    }

    /// Command not valid in the current phase: protocol violation, close
    fn violation(&self, request: &Request) -> Result<()> {
        warn!(
            session = self.id,
            request = request.name(),
            "request not allowed in this phase, closing"
        );
        Err(anyhow!("{} not allowed in this phase", request.name()))
    }

    async fn handle_devlist(&self, writer: &SharedWriter) -> Result<()> {
        let devices = match self.registry.list().await {
            Ok(devices) => devices,
            Err(error) => {
                warn!(session = self.id, %error, "device enumeration failed");
                Vec::new()
            }
        };
        debug!(session = self.id, count = devices.len(), "sending device list");

        let reply = DevlistReply {
            devices: devices.iter().map(ExportedDevice::from_device).collect(),
        };
        write_reply(writer, &reply.encode()?).await?;
        Ok(())
    }

    async fn handle_import(
        &self,
        writer: &SharedWriter,
        import: &ImportRequest,
    ) -> Result<Option<TransferContext>> {
        let device = match self.registry.lookup_bus_id(&import.bus_id).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                info!(session = self.id, bus_id = %import.bus_id, "import of unknown device");
                let reply = ImportReply::failure(protocol::ST_NO_SUCH_DEVICE);
                write_reply(writer, &reply.encode()?).await?;
                return Ok(None);
            }
            Err(error) => {
                warn!(session = self.id, %error, "enumeration failed during import");
                let reply = ImportReply::failure(protocol::ST_NA);
                write_reply(writer, &reply.encode()?).await?;
                return Ok(None);
            }
        };

        match self
            .claims
            .try_claim(&self.backend, &device, self.id)
            .await
        {
            Ok(token) => {
                info!(
                    session = self.id,
                    device = %token.device_key,
                    "imported device"
                );
                let reply = ImportReply::success(ExportedDevice::from_device(&device));
                write_reply(writer, &reply.encode()?).await?;

                Ok(Some(TransferContext {
                    backend: self.backend.clone(),
                    claim: token.handle,
                    device_key: token.device_key,
                    tracker: Arc::new(UrbTracker::new()),
                    writer: writer.clone(),
                    counters: self.counters.clone(),
                    interface_ready: Arc::new(AtomicBool::new(false)),
                }))
            }
            Err(error) => {
                info!(
                    session = self.id,
                    bus_id = %import.bus_id,
                    %error,
                    "import refused"
                );
                let reply = ImportReply::failure(error.op_status());
                write_reply(writer, &reply.encode()?).await?;
                Ok(None)
            }
        }
    }

    /// Cascade: cancel every in-flight URB, then release the claim
    async fn teardown(&self, phase: Phase) {
        let Phase::Imported(ctx) = phase else {
            return;
        };

        let drained = ctx.tracker.drain();
        if !drained.is_empty() {
            debug!(
                session = self.id,
                count = drained.len(),
                "cancelling in-flight URBs on teardown"
            );
            for urb in &drained {
                if let Err(error) = self.backend.cancel(ctx.claim, urb.seqnum).await {
                    debug!(session = self.id, seqnum = urb.seqnum, %error, "cancel failed");
                }
                self.counters.in_flight_urbs.fetch_sub(1, Ordering::SeqCst);
            }
        }

        self.claims.release_session(&self.backend, self.id).await;
    }
}
