//! USB transfer execution
//!
//! Runs one transfer synchronously against a rusb device handle and maps
//! rusb errors onto the closed backend error sum. Each transfer runs on its
//! own thread (libusb's synchronous API is thread-safe), so the worker
//! keeps servicing commands while transfers are in flight.

use bytes::Bytes;
use common::{BackendError, TransferData, TransferOutcome, TransferRequest};
use protocol::{Direction, TransferKind};
use rusb::{Context, DeviceHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Execute a transfer and return its outcome
pub fn execute_transfer(
    handle: &DeviceHandle<Context>,
    request: &TransferRequest,
) -> TransferOutcome {
    let started = Instant::now();
    let timeout = Duration::from_millis(request.timeout_ms as u64);

    let result = match request.kind {
        TransferKind::Control => execute_control(handle, request, timeout),
        TransferKind::Bulk => execute_bulk(handle, request, timeout),
        TransferKind::Interrupt => execute_interrupt(handle, request, timeout),
        // The synchronous libusb API has no isochronous entry point
        TransferKind::Isochronous => Err(BackendError::Unsupported),
    };

    match result {
        Ok((actual_length, data)) => {
            debug!(
                seqnum = request.seqnum,
                actual_length,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "transfer complete"
            );
            Ok(TransferData {
                actual_length,
                data,
                error_count: 0,
                start_frame: 0,
                completion_time: started.elapsed(),
            })
        }
        Err(error) => {
            warn!(seqnum = request.seqnum, %error, "transfer failed");
            Err(error)
        }
    }
}

fn execute_control(
    handle: &DeviceHandle<Context>,
    request: &TransferRequest,
    timeout: Duration,
) -> Result<(u32, Option<Bytes>), BackendError> {
    // Setup packet fields are little-endian on the bus
    let request_type = request.setup[0];
    let request_code = request.setup[1];
    let value = u16::from_le_bytes([request.setup[2], request.setup[3]]);
    let index = u16::from_le_bytes([request.setup[4], request.setup[5]]);

    match request.direction {
        Direction::In => {
            let mut buffer = vec![0u8; request.buffer_length as usize];
            let len = handle
                .read_control(request_type, request_code, value, index, &mut buffer, timeout)
                .map_err(map_rusb_error)?;
            buffer.truncate(len);
            Ok((len as u32, Some(Bytes::from(buffer))))
        }
        Direction::Out => {
            let data = request.data.as_deref().unwrap_or(&[]);
            let len = handle
                .write_control(request_type, request_code, value, index, data, timeout)
                .map_err(map_rusb_error)?;
            Ok((len as u32, None))
        }
    }
}

fn execute_bulk(
    handle: &DeviceHandle<Context>,
    request: &TransferRequest,
    timeout: Duration,
) -> Result<(u32, Option<Bytes>), BackendError> {
    match request.direction {
        Direction::In => {
            let endpoint = request.endpoint | 0x80;
            let mut buffer = vec![0u8; request.buffer_length as usize];
            let len = handle
                .read_bulk(endpoint, &mut buffer, timeout)
                .map_err(map_rusb_error)?;
            buffer.truncate(len);
            Ok((len as u32, Some(Bytes::from(buffer))))
        }
        Direction::Out => {
            let data = request.data.as_deref().unwrap_or(&[]);
            let len = handle
                .write_bulk(request.endpoint, data, timeout)
                .map_err(map_rusb_error)?;
            Ok((len as u32, None))
        }
    }
}

fn execute_interrupt(
    handle: &DeviceHandle<Context>,
    request: &TransferRequest,
    timeout: Duration,
) -> Result<(u32, Option<Bytes>), BackendError> {
    match request.direction {
        Direction::In => {
            let endpoint = request.endpoint | 0x80;
            let mut buffer = vec![0u8; request.buffer_length as usize];
            let len = handle
                .read_interrupt(endpoint, &mut buffer, timeout)
                .map_err(map_rusb_error)?;
            buffer.truncate(len);
            Ok((len as u32, Some(Bytes::from(buffer))))
        }
        Direction::Out => {
            let data = request.data.as_deref().unwrap_or(&[]);
            let len = handle
                .write_interrupt(request.endpoint, data, timeout)
                .map_err(map_rusb_error)?;
            Ok((len as u32, None))
        }
    }
}

/// Map `rusb::Error` onto the closed backend error sum
pub fn map_rusb_error(error: rusb::Error) -> BackendError {
    match error {
        rusb::Error::Timeout => BackendError::Timeout,
        rusb::Error::Pipe => BackendError::Stalled,
        rusb::Error::NoDevice => BackendError::Disconnected,
        rusb::Error::NotFound => BackendError::NotFound,
        rusb::Error::Busy => BackendError::Busy,
        rusb::Error::Access => BackendError::AccessDenied,
        rusb::Error::InvalidParam | rusb::Error::Overflow => BackendError::InvalidArgument,
        rusb::Error::NotSupported => BackendError::Unsupported,
        other => BackendError::Internal(other.to_string()),
    }
}
