//! USB/IP wire protocol for rust-usbipd
//!
//! This crate implements the server-relevant subset of the USB/IP wire
//! protocol: the op-phase device-list and import exchanges, and the
//! command-phase SUBMIT/UNLINK pairs. All integers are big-endian and all
//! layouts are byte-exact; see the module docs in [`messages`].
//!
//! # Example
//!
//! ```
//! use protocol::{DevlistRequest, Request, decode_request};
//!
//! let bytes = DevlistRequest.encode().unwrap();
//! assert_eq!(bytes.len(), 8);
//! assert_eq!(decode_request(&bytes).unwrap(), Request::Devlist);
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod status;
pub mod types;

pub use codec::{MAX_TRANSFER_BUFFER, Request, check_transfer_buffer, decode_request};
#[cfg(feature = "async")]
pub use codec::read_request_async;
pub use error::{ProtocolError, Result};
pub use messages::{
    CMD_SUBMIT, CMD_UNLINK, DevlistReply, DevlistRequest, ExportedDevice, Header, ImportReply,
    ImportRequest, OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_DEVLIST, OP_REQ_IMPORT, RET_SUBMIT,
    RET_UNLINK, ST_DEVICE_BUSY, ST_DEVICE_ERROR, ST_ERROR, ST_NA, ST_NO_SUCH_DEVICE, ST_OK,
    SubmitReply, SubmitRequest, SYSFS_BUS_ID_SIZE, SYSFS_PATH_MAX, UnlinkReply, UnlinkRequest,
    USBIP_VERSION,
};
pub use types::{
    DeviceSpeed, Direction, TransferKind, UsbDevice, is_valid_bus_id, is_valid_device_key,
};
