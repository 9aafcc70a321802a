//! Backend capability types
//!
//! The protocol engine drives the platform USB implementation through a
//! narrow surface: list devices, claim/release, open an interface, execute
//! a transfer, cancel by seqnum. Everything platform-specific hides behind
//! [`BackendError`] and [`TransferData`]; the engine never sees a platform
//! error type.

use bytes::Bytes;
use protocol::status;
use protocol::{Direction, TransferKind};
use std::time::Duration;
use thiserror::Error;

/// Token for a claimed device, issued by the backend
///
/// All transfer-path operations take the handle; dropping exclusivity goes
/// through the claim arbiter, which owns the handle's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimHandle(pub u32);

/// Errors surfaced by the platform USB backend
///
/// A closed sum: the engine maps each variant onto exactly one signed wire
/// status and inspects nothing else.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Device or endpoint not found
    #[error("device not found")]
    NotFound,
    /// Platform refused access (permissions, exclusivity held elsewhere)
    #[error("access denied")]
    AccessDenied,
    /// Device is busy
    #[error("device is busy")]
    Busy,
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled
    #[error("endpoint stalled")]
    Stalled,
    /// Device was disconnected
    #[error("device disconnected")]
    Disconnected,
    /// Invalid transfer parameters
    #[error("invalid argument")]
    InvalidArgument,
    /// Operation not supported by this backend
    #[error("operation not supported")]
    Unsupported,
    /// Other backend failure
    #[error("backend error: {0}")]
    Internal(String),
}

impl BackendError {
    /// The signed wire status this error translates to in RET_SUBMIT
    pub fn wire_status(&self) -> i32 {
        match self {
            BackendError::NotFound => status::STATUS_NO_DEVICE,
            BackendError::AccessDenied => status::STATUS_PROTOCOL,
            BackendError::Busy => status::STATUS_AGAIN,
            BackendError::Timeout => status::STATUS_TIMEOUT,
            BackendError::Stalled => status::STATUS_STALL,
            BackendError::Disconnected => status::STATUS_NO_DEVICE,
            BackendError::InvalidArgument => status::STATUS_INVALID,
            BackendError::Unsupported => status::STATUS_INVALID,
            BackendError::Internal(_) => status::STATUS_PROTOCOL,
        }
    }
}

/// Isochronous scheduling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoSchedule {
    pub start_frame: u32,
    pub num_packets: u32,
    pub interval: u32,
}

/// One transfer handed to the backend
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Seqnum of the owning URB, used for cancellation
    pub seqnum: u32,
    pub kind: TransferKind,
    /// Endpoint address, bits 0-6
    pub endpoint: u8,
    pub direction: Direction,
    /// Control setup packet; all zeros for non-control transfers
    pub setup: [u8; 8],
    /// Requested transfer length
    pub buffer_length: u32,
    /// Out-buffer payload for OUT transfers
    pub data: Option<Bytes>,
    pub timeout_ms: u32,
    pub iso: Option<IsoSchedule>,
}

/// Completion value of a backend transfer
#[derive(Debug, Clone)]
pub struct TransferData {
    /// Bytes actually moved; may be less than requested for short transfers
    pub actual_length: u32,
    /// In-buffer bytes for IN transfers
    pub data: Option<Bytes>,
    /// Isochronous per-packet error count
    pub error_count: u32,
    /// Frame the transfer started on (isochronous only)
    pub start_frame: u32,
    /// Wall time the backend spent on the transfer
    pub completion_time: Duration,
}

/// Result of a backend transfer call
pub type TransferOutcome = std::result::Result<TransferData, BackendError>;
