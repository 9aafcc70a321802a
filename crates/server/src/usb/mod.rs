//! USB engine: registry, claims, URB lifecycle and the rusb backend

pub mod claim;
pub mod device;
pub mod manager;
pub mod registry;
pub mod submit;
pub mod tracker;
pub mod transfers;
pub mod unlink;
pub mod urb;
pub mod worker;

pub use claim::{ClaimArbiter, ClaimError, ClaimToken};
pub use registry::DeviceRegistry;
pub use submit::{SharedWriter, TransferContext};
pub use tracker::{MAX_IN_FLIGHT, UrbTracker};
pub use urb::{RequestError, Urb, UrbStatus};
pub use worker::spawn_usb_worker;
