//! usbipd server internals
//!
//! Exposed as a library so the integration suite can drive the listener,
//! sessions and the URB engine directly; `main.rs` is the CLI front-end.

pub mod config;
pub mod error;
pub mod network;
pub mod state;
pub mod usb;
