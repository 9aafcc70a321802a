//! UNLINK processing
//!
//! Cancels one in-flight URB by seqnum. The cancel is best-effort: the
//! outstanding SUBMIT reply is still emitted by the submit path (with a
//! cancelled status if the unlink won the race), and the tracker entry is
//! cleaned up there.

use crate::usb::submit::{TransferContext, write_reply};
use protocol::status::{STATUS_CANCELLED, STATUS_INVALID, STATUS_OK};
use protocol::{UnlinkReply, UnlinkRequest};
use tracing::debug;

/// Handle a CMD_UNLINK and emit its RET_UNLINK
///
/// Runs on the session's read loop so it observes any SUBMIT admitted
/// before it.
pub async fn handle_unlink(ctx: &TransferContext, request: &UnlinkRequest) -> anyhow::Result<()> {
    let target = request.unlink_seqnum;

    let status = if ctx.tracker.cancel(target) {
        match ctx.backend.cancel(ctx.claim, target).await {
            Ok(()) => {
                debug!(seqnum = request.seqnum, target, "unlink cancelled in-flight URB");
                STATUS_OK
            }
            Err(error) => {
                // The transfer reached a non-cancellable phase; the submit
                // path will still complete it
                debug!(seqnum = request.seqnum, target, %error, "backend rejected cancel");
                STATUS_INVALID
            }
        }
    } else {
        // Already completed (or never existed): -ENOENT
        debug!(seqnum = request.seqnum, target, "unlink target not in flight");
        STATUS_CANCELLED
    };

    let reply = UnlinkReply {
        seqnum: request.seqnum,
        devid: request.devid,
        direction: request.direction,
        ep: request.ep,
        status,
    };
    write_reply(&ctx.writer, &reply.encode()?).await?;
    Ok(())
}
