//! Common utilities for rust-usbipd
//!
//! This crate provides the shared layer between the protocol engine and the
//! platform USB backend: error handling, logging setup, the backend
//! capability types, and the async channel bridge the engine drives the
//! backend worker through. `test_utils` carries the scripted mock backend
//! used by the engine and end-to-end tests.

pub mod backend;
pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use backend::{
    BackendError, ClaimHandle, IsoSchedule, TransferData, TransferOutcome, TransferRequest,
};
pub use channel::{BackendCommand, BackendHandle, BackendWorker, create_backend_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
