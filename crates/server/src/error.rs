//! Daemon lifecycle errors surfaced to the CLI

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// A daemon already owns the status file
    #[error("server is already running (pid {0})")]
    AlreadyRunning(u32),

    /// No daemon status snapshot found
    #[error("server is not running")]
    NotRunning,

    /// The TCP listener could not be bound
    #[error("failed to bind listener: {0}")]
    BindFailed(String),

    /// Startup failed before the listener came up
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
}
