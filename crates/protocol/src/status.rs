//! Signed wire status values for RET_SUBMIT / RET_UNLINK
//!
//! The URB status field carries negative Linux errno values; importing
//! peers hand them straight to their USB stack.

/// Success
pub const STATUS_OK: i32 = 0;
/// Request cancelled, or unlink target not found (ENOENT)
pub const STATUS_CANCELLED: i32 = -2;
/// Too many in-flight requests (EAGAIN)
pub const STATUS_AGAIN: i32 = -11;
/// Out of memory (ENOMEM)
pub const STATUS_NO_MEMORY: i32 = -12;
/// Duplicate seqnum (EEXIST)
pub const STATUS_EXISTS: i32 = -17;
/// Device gone or not available (ENODEV)
pub const STATUS_NO_DEVICE: i32 = -19;
/// Invalid parameters or bad URB (EINVAL)
pub const STATUS_INVALID: i32 = -22;
/// Stalled endpoint (EPIPE)
pub const STATUS_STALL: i32 = -32;
/// Generic protocol or request failure (EPROTO)
pub const STATUS_PROTOCOL: i32 = -71;
/// Buffer error (EMSGSIZE)
pub const STATUS_BUFFER: i32 = -90;
/// Transfer timed out (ETIMEDOUT)
pub const STATUS_TIMEOUT: i32 = -110;
/// Short packet on an IN transfer (EREMOTEIO)
pub const STATUS_SHORT_PACKET: i32 = -121;
