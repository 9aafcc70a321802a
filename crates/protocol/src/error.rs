//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
///
/// Every variant is connection-fatal: the codec boundary is the only place
/// where an error closes the connection instead of becoming a wire reply.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Input shorter than the fixed layout requires
    #[error("Invalid data length: needed {needed} bytes, got {actual}")]
    InvalidDataLength { needed: usize, actual: usize },

    /// Header version word does not identify a known message space
    #[error("Unsupported protocol version: {0:#06x} (expected 0x0111)")]
    UnsupportedVersion(u16),

    /// Command word does not match the decoder being invoked
    #[error("Invalid message format: unexpected command {command:#06x}")]
    InvalidMessageFormat { command: u16 },

    /// A fixed-slot string is not valid UTF-8
    #[error("String field is not valid UTF-8")]
    StringEncoding,

    /// Declared transfer buffer length exceeds the codec cap
    #[error("Transfer buffer too large: {size} bytes (max: {max})")]
    BufferTooLarge { size: usize, max: usize },

    /// I/O error while reading a message off a socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
