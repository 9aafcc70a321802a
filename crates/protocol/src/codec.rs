//! Request decoding and socket framing
//!
//! The wire format has no length prefix: each message is a fixed layout
//! plus an optional buffer whose length is declared inside the fixed part.
//! The decoder therefore routes on the 8-byte header first (op messages by
//! the version word `0x0111`, CMD messages by the command word under a zero
//! version word) and then pulls exactly the bytes the layout calls for.

use crate::error::{ProtocolError, Result};
use crate::messages::{
    CMD_SUBMIT, CMD_UNLINK, Header, ImportRequest, OP_REQ_DEVLIST, OP_REQ_IMPORT, SubmitRequest,
    SYSFS_BUS_ID_SIZE, UnlinkRequest, USBIP_VERSION,
};
use std::io::Cursor;

#[cfg(feature = "async")]
use bytes::Bytes;
#[cfg(feature = "async")]
use tokio::io::AsyncReadExt;

/// Maximum accepted transfer buffer length (16 MiB)
///
/// Declared lengths above this are refused before any allocation happens.
pub const MAX_TRANSFER_BUFFER: usize = 16 * 1024 * 1024;

/// Refuse transfer buffer lengths above [`MAX_TRANSFER_BUFFER`]
pub fn check_transfer_buffer(length: u32) -> Result<()> {
    if length as usize > MAX_TRANSFER_BUFFER {
        return Err(ProtocolError::BufferTooLarge {
            size: length as usize,
            max: MAX_TRANSFER_BUFFER,
        });
    }
    Ok(())
}

/// Any client-to-server request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Devlist,
    Import(ImportRequest),
    Submit(SubmitRequest),
    Unlink(UnlinkRequest),
}

impl Request {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Request::Devlist => "OP_REQ_DEVLIST",
            Request::Import(_) => "OP_REQ_IMPORT",
            Request::Submit(_) => "CMD_SUBMIT",
            Request::Unlink(_) => "CMD_UNLINK",
        }
    }
}

/// Decode one complete request from a byte buffer
///
/// Used by tests and by peers that already hold a full message; the server
/// read path uses [`read_request_async`] instead.
pub fn decode_request(buf: &[u8]) -> Result<Request> {
    if buf.len() < Header::SIZE {
        return Err(ProtocolError::InvalidDataLength {
            needed: Header::SIZE,
            actual: buf.len(),
        });
    }
    let header = Header::read_from(&mut Cursor::new(buf))?;
    match header.version {
        USBIP_VERSION => match header.command {
            OP_REQ_DEVLIST => Ok(Request::Devlist),
            OP_REQ_IMPORT => Ok(Request::Import(ImportRequest::decode(buf)?)),
            command => Err(ProtocolError::InvalidMessageFormat { command }),
        },
        0 => match header.command {
            CMD_SUBMIT => Ok(Request::Submit(SubmitRequest::decode(buf)?)),
            CMD_UNLINK => Ok(Request::Unlink(UnlinkRequest::decode(buf)?)),
            command => Err(ProtocolError::InvalidMessageFormat { command }),
        },
        version => Err(ProtocolError::UnsupportedVersion(version)),
    }
}

/// Async: read exactly one request off a socket
///
/// Reads the 8-byte header, routes on it, then reads the remainder of the
/// fixed layout and any declared out-buffer. Returns `Ok(None)` on a clean
/// EOF at a message boundary (the peer closed the connection).
#[cfg(feature = "async")]
pub async fn read_request_async<R>(reader: &mut R) -> Result<Option<Request>>
where
    R: AsyncReadExt + Unpin,
{
    let mut header_bytes = [0u8; Header::SIZE];
    match reader.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = Header::read_from(&mut Cursor::new(&header_bytes))?;

    match header.version {
        USBIP_VERSION => match header.command {
            OP_REQ_DEVLIST => Ok(Some(Request::Devlist)),
            OP_REQ_IMPORT => {
                let mut bus_id = [0u8; SYSFS_BUS_ID_SIZE];
                reader.read_exact(&mut bus_id).await?;
                let mut buf = Vec::with_capacity(ImportRequest::SIZE);
                buf.extend_from_slice(&header_bytes);
                buf.extend_from_slice(&bus_id);
                Ok(Some(Request::Import(ImportRequest::decode(&buf)?)))
            }
            command => Err(ProtocolError::InvalidMessageFormat { command }),
        },
        0 => match header.command {
            CMD_SUBMIT => {
                let mut body = [0u8; SubmitRequest::FIXED_SIZE - Header::SIZE];
                reader.read_exact(&mut body).await?;
                let mut message = SubmitRequest::decode_parts(&body, None)?;
                if message.direction == 0 && message.transfer_buffer_length > 0 {
                    check_transfer_buffer(message.transfer_buffer_length)?;
                    let mut data = vec![0u8; message.transfer_buffer_length as usize];
                    reader.read_exact(&mut data).await?;
                    message.data = Some(Bytes::from(data));
                }
                Ok(Some(Request::Submit(message)))
            }
            CMD_UNLINK => {
                let mut body = [0u8; UnlinkRequest::SIZE - Header::SIZE];
                reader.read_exact(&mut body).await?;
                Ok(Some(Request::Unlink(UnlinkRequest::decode_parts(&body)?)))
            }
            command => Err(ProtocolError::InvalidMessageFormat { command }),
        },
        version => Err(ProtocolError::UnsupportedVersion(version)),
    }
}
