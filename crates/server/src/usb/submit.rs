//! SUBMIT processing
//!
//! Admission (validate, infer, insert into the tracker) happens on the
//! session's read loop so a later UNLINK is guaranteed to observe the
//! entry. Dispatch runs as its own task per URB: it suspends on the
//! backend, arms the URB timeout, and emits the RET_SUBMIT under the
//! per-connection write mutex.

use crate::state::ServerCounters;
use crate::usb::tracker::UrbTracker;
use crate::usb::urb::{RequestError, Urb, UrbStatus};
use bytes::Bytes;
use common::{BackendHandle, ClaimHandle};
use protocol::status::{STATUS_CANCELLED, STATUS_OK, STATUS_SHORT_PACKET, STATUS_TIMEOUT};
use protocol::{Direction, SubmitReply, SubmitRequest, TransferKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Engine-assigned URB watchdog; the wire format carries no timeout
pub const DEFAULT_URB_TIMEOUT_MS: u32 = 5_000;

/// Interface the backend opens for non-control transfers
///
/// Deriving the interface from the endpoint needs cached descriptor data;
/// until then every transfer goes through interface 0.
pub const DEFAULT_INTERFACE: u8 = 0;

/// Transfer flag: a short IN transfer is an error, not a success
pub const URB_SHORT_NOT_OK: u32 = 0x0001;

/// The per-connection write half, serialized by a single mutex
pub type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Write one complete reply atomically
pub async fn write_reply(writer: &SharedWriter, bytes: &[u8]) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Everything a SUBMIT/UNLINK processor needs from its session
#[derive(Clone)]
pub struct TransferContext {
    pub backend: BackendHandle,
    pub claim: ClaimHandle,
    pub device_key: String,
    pub tracker: Arc<UrbTracker>,
    pub writer: SharedWriter,
    pub counters: Arc<ServerCounters>,
    /// Set once the default interface has been opened
    pub interface_ready: Arc<AtomicBool>,
}

/// Validate a SUBMIT and admit its URB into the tracker
///
/// Runs synchronously on the read path. Validation failures never touch
/// the backend; admission failures leave no tracker entry.
pub fn admit(ctx: &TransferContext, request: &SubmitRequest) -> Result<Urb, RequestError> {
    let urb = Urb::from_submit(request, DEFAULT_URB_TIMEOUT_MS)?;
    ctx.tracker.insert(urb.clone())?;
    ctx.counters.in_flight_urbs.fetch_add(1, Ordering::SeqCst);
    Ok(urb)
}

/// Reply to a SUBMIT that failed admission
pub async fn reject(
    ctx: &TransferContext,
    request: &SubmitRequest,
    error: &RequestError,
) -> anyhow::Result<()> {
    warn!(seqnum = request.seqnum, %error, "rejecting SUBMIT");
    let reply = SubmitReply {
        seqnum: request.seqnum,
        devid: request.devid,
        direction: request.direction,
        ep: request.ep,
        status: error.wire_status(),
        actual_length: 0,
        start_frame: request.start_frame,
        number_of_packets: request.number_of_packets,
        error_count: 0,
        data: None,
    };
    write_reply(&ctx.writer, &reply.encode()?).await?;
    Ok(())
}

/// Execute an admitted URB and emit its RET_SUBMIT
pub async fn dispatch(ctx: TransferContext, urb: Urb) -> anyhow::Result<()> {
    let seqnum = urb.seqnum;

    if urb.kind != TransferKind::Control && !ctx.interface_ready.load(Ordering::SeqCst) {
        if let Err(error) = ctx
            .backend
            .open_interface(ctx.claim, DEFAULT_INTERFACE)
            .await
        {
            warn!(seqnum, %error, "failed to open interface for transfer");
            return finish(&ctx, &urb, error.wire_status(), 0, None, 0).await;
        }
        ctx.interface_ready.store(true, Ordering::SeqCst);
    }

    ctx.tracker.set_status(seqnum, UrbStatus::InProgress);

    let deadline = Duration::from_millis(urb.timeout_ms as u64);
    let outcome = tokio::time::timeout(
        deadline,
        ctx.backend.transfer(ctx.claim, urb.to_transfer_request()),
    )
    .await;

    match outcome {
        Err(_elapsed) => {
            debug!(seqnum, timeout_ms = urb.timeout_ms, "URB timed out, synthesizing -ETIMEDOUT");
            if let Err(error) = ctx.backend.cancel(ctx.claim, seqnum).await {
                debug!(seqnum, %error, "backend refused cancel of timed-out URB");
            }
            finish(&ctx, &urb, STATUS_TIMEOUT, 0, None, 0).await
        }
        Ok(Err(error)) => {
            debug!(seqnum, %error, "backend transfer failed");
            finish(&ctx, &urb, error.wire_status(), 0, None, 0).await
        }
        Ok(Ok(data)) => {
            let payload = match urb.direction {
                Direction::In => data.data.map(|bytes| {
                    // Never return more than the client asked for
                    if bytes.len() as u32 > urb.buffer_len {
                        bytes.slice(0..urb.buffer_len as usize)
                    } else {
                        bytes
                    }
                }),
                Direction::Out => None,
            };
            let actual_length = match urb.direction {
                Direction::In => payload.as_ref().map_or(0, |b| b.len() as u32),
                Direction::Out => data.actual_length,
            };
            if urb.direction == Direction::In
                && urb.transfer_flags & URB_SHORT_NOT_OK != 0
                && actual_length < urb.buffer_len
            {
                debug!(seqnum, actual_length, expected = urb.buffer_len, "short IN transfer");
                return finish(&ctx, &urb, STATUS_SHORT_PACKET, 0, None, data.error_count).await;
            }
            finish(&ctx, &urb, STATUS_OK, actual_length, payload, data.error_count).await
        }
    }
}

/// Remove the URB from the tracker and emit the reply
///
/// If an UNLINK marked the entry cancelled before we removed it, the reply
/// status becomes -2 regardless of what the backend reported.
async fn finish(
    ctx: &TransferContext,
    urb: &Urb,
    status: i32,
    actual_length: u32,
    data: Option<Bytes>,
    error_count: u32,
) -> anyhow::Result<()> {
    let removed = ctx.tracker.remove(urb.seqnum);
    if removed.is_some() {
        ctx.counters.in_flight_urbs.fetch_sub(1, Ordering::SeqCst);
    }

    let cancelled = matches!(
        removed.as_ref().map(|entry| entry.status),
        Some(UrbStatus::Cancelled)
    );
    let (status, actual_length, data) = if cancelled {
        debug!(seqnum = urb.seqnum, "URB was unlinked, replying cancelled");
        (STATUS_CANCELLED, 0, None)
    } else {
        (status, actual_length, data)
    };

    let reply = SubmitReply {
        seqnum: urb.seqnum,
        devid: urb.devid,
        direction: urb.direction.wire_code(),
        ep: urb.endpoint as u32,
        status,
        actual_length,
        start_frame: urb.iso.map_or(0, |iso| iso.start_frame),
        number_of_packets: urb.iso.map_or(0, |iso| iso.num_packets),
        error_count,
        data: if urb.direction == Direction::In && status == STATUS_OK {
            data
        } else {
            None
        },
    };

    write_reply(&ctx.writer, &reply.encode()?).await?;
    debug!(seqnum = urb.seqnum, status, actual_length, "sent RET_SUBMIT");
    Ok(())
}
