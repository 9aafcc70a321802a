//! URB model, validation and transfer-kind inference
//!
//! A [`Urb`] is built from a decoded CMD_SUBMIT before anything touches the
//! backend; validation failures translate straight into a RET_SUBMIT status
//! and never reach the device.

use common::{IsoSchedule, TransferRequest};
use bytes::Bytes;
use protocol::status;
use protocol::{Direction, SubmitRequest, TransferKind};
use thiserror::Error;

/// Longest accepted URB timeout in milliseconds
pub const MAX_URB_TIMEOUT_MS: u32 = 30_000;

/// Request-level errors on the SUBMIT/UNLINK path
///
/// Each variant maps onto one signed wire status; none of them closes the
/// connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("invalid URB: {0}")]
    InvalidUrb(String),

    #[error("device {0} is not claimed by this session")]
    DeviceNotClaimed(String),

    #[error("endpoint {0:#04x} not found")]
    EndpointNotFound(u8),

    #[error("transfer type not supported")]
    TransferTypeUnsupported,

    #[error("buffer size mismatch: expected at most {expected}, got {actual}")]
    BufferSizeMismatch { expected: u32, actual: u32 },

    #[error("control transfer requires a setup packet")]
    SetupPacketRequired,

    #[error("setup packet is invalid")]
    SetupPacketInvalid,

    #[error("timeout {0} ms is out of range (1..=30000)")]
    TimeoutInvalid(u32),

    #[error("concurrent request limit reached")]
    ConcurrentRequestLimit,

    #[error("duplicate request seqnum")]
    DuplicateRequest,

    #[error("request timed out")]
    Timeout,

    #[error("device is gone")]
    DeviceGone,

    #[error("request was cancelled")]
    Cancelled,
}

impl RequestError {
    /// The signed wire status this error translates to
    pub fn wire_status(&self) -> i32 {
        match self {
            RequestError::InvalidUrb(_) => status::STATUS_INVALID,
            RequestError::DeviceNotClaimed(_) => status::STATUS_NO_DEVICE,
            RequestError::EndpointNotFound(_) => status::STATUS_INVALID,
            RequestError::TransferTypeUnsupported => status::STATUS_INVALID,
            RequestError::BufferSizeMismatch { .. } => status::STATUS_BUFFER,
            RequestError::SetupPacketRequired => status::STATUS_INVALID,
            RequestError::SetupPacketInvalid => status::STATUS_INVALID,
            RequestError::TimeoutInvalid(_) => status::STATUS_INVALID,
            RequestError::ConcurrentRequestLimit => status::STATUS_AGAIN,
            RequestError::DuplicateRequest => status::STATUS_EXISTS,
            RequestError::Timeout => status::STATUS_TIMEOUT,
            RequestError::DeviceGone => status::STATUS_NO_DEVICE,
            RequestError::Cancelled => status::STATUS_CANCELLED,
        }
    }
}

/// Lifecycle state of an in-flight URB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

/// An in-flight USB request block
///
/// Owned by the tracker from insertion until completion, cancellation or
/// connection teardown.
#[derive(Debug, Clone)]
pub struct Urb {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    /// Wire endpoint byte: address in bits 0-6, direction in bit 7
    pub endpoint: u8,
    pub kind: TransferKind,
    pub transfer_flags: u32,
    pub buffer_len: u32,
    /// Setup packet; zeroed for non-control transfers
    pub setup: [u8; 8],
    /// Present iff direction is OUT and `buffer_len > 0`
    pub out_buffer: Option<Bytes>,
    pub timeout_ms: u32,
    /// Present iff the transfer is isochronous
    pub iso: Option<IsoSchedule>,
    pub status: UrbStatus,
}

impl Urb {
    /// Validate a decoded CMD_SUBMIT and build the URB
    ///
    /// `timeout_ms` is the engine-assigned watchdog for this URB; the wire
    /// format does not carry one.
    pub fn from_submit(request: &SubmitRequest, timeout_ms: u32) -> Result<Self, RequestError> {
        if request.ep > 0xff {
            return Err(RequestError::InvalidUrb(format!(
                "endpoint word {:#x} out of range",
                request.ep
            )));
        }
        let endpoint = request.ep as u8;
        let address = endpoint & 0x7f;

        let Some(direction) = Direction::from_wire(request.direction) else {
            return Err(RequestError::InvalidUrb(format!(
                "direction word {} is neither IN nor OUT",
                request.direction
            )));
        };

        if direction == Direction::Out {
            if let Some(ref data) = request.data {
                if data.len() as u32 > request.transfer_buffer_length {
                    return Err(RequestError::BufferSizeMismatch {
                        expected: request.transfer_buffer_length,
                        actual: data.len() as u32,
                    });
                }
            }
        }

        if timeout_ms == 0 || timeout_ms > MAX_URB_TIMEOUT_MS {
            return Err(RequestError::TimeoutInvalid(timeout_ms));
        }

        let kind = if address == 0 {
            if request.number_of_packets > 0 {
                return Err(RequestError::InvalidUrb(
                    "isochronous transfer on the control endpoint".to_string(),
                ));
            }
            if request.setup == [0u8; 8] {
                return Err(RequestError::SetupPacketRequired);
            }
            // bmRequestType bit 7 must agree with the direction word
            let setup_in = request.setup[0] & 0x80 != 0;
            if setup_in != (direction == Direction::In) {
                return Err(RequestError::SetupPacketInvalid);
            }
            TransferKind::Control
        } else if request.number_of_packets > 0 {
            TransferKind::Isochronous
        } else {
            // Interrupt endpoints are indistinguishable from bulk here;
            // the backend routes by the endpoint's real attributes
            TransferKind::Bulk
        };

        let iso = (kind == TransferKind::Isochronous).then_some(IsoSchedule {
            start_frame: request.start_frame,
            num_packets: request.number_of_packets,
            interval: request.interval,
        });

        let out_buffer = if direction == Direction::Out {
            request.data.clone().filter(|d| !d.is_empty())
        } else {
            None
        };

        Ok(Self {
            seqnum: request.seqnum,
            devid: request.devid,
            direction,
            endpoint,
            kind,
            transfer_flags: request.transfer_flags,
            buffer_len: request.transfer_buffer_length,
            setup: request.setup,
            out_buffer,
            timeout_ms,
            iso,
            status: UrbStatus::Pending,
        })
    }

    /// Endpoint address, bits 0-6 of the wire endpoint byte
    pub fn endpoint_address(&self) -> u8 {
        self.endpoint & 0x7f
    }

    /// What the backend needs to execute this URB
    pub fn to_transfer_request(&self) -> TransferRequest {
        TransferRequest {
            seqnum: self.seqnum,
            kind: self.kind,
            endpoint: self.endpoint_address(),
            direction: self.direction,
            setup: self.setup,
            buffer_length: self.buffer_len,
            data: self.out_buffer.clone(),
            timeout_ms: self.timeout_ms,
            iso: self.iso,
        }
    }
}
