//! TCP listener and per-connection sessions

pub mod listener;
pub mod session;

pub use listener::{Listener, SHUTDOWN_GRACE};
pub use session::Session;
