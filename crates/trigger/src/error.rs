//! Error types for the trigger crate.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the connection manager, or reported by it to the host.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// The trigger configuration is unusable (bad URI, wrong shape, …).
    #[error("invalid trigger configuration: {0}")]
    Config(String),

    /// Opening the physical connection failed.
    #[error("failed to connect to {uri}: {message}")]
    Connect { uri: String, message: String },

    /// The transport reported an error on an open connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer closed the connection (or it dropped) without a manual close.
    #[error("connection closed (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },

    /// `send`/`await_message` was called while no connection is open.
    #[error("connection is not open")]
    NotOpen,

    /// The open-script failed; the connection carries on regardless.
    #[error("open script failed: {0}")]
    Script(#[from] SandboxError),

    /// `activate` was called on a trigger that is already running.
    #[error("trigger is already active")]
    AlreadyActive,

    /// The trigger was deactivated and cannot be used again.
    #[error("trigger has been deactivated")]
    Deactivated,
}

/// Failures of a single open-script invocation.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The Lua state could not be prepared.
    #[error("sandbox setup failed: {0}")]
    Setup(String),

    /// The script did not parse.
    #[error("script failed to compile: {0}")]
    Compile(String),

    /// The script raised an error while running.
    #[error("script raised an error: {0}")]
    Runtime(String),

    /// The script ran past its deadline.
    #[error("script exceeded its {0:?} deadline")]
    Timeout(Duration),

    /// The worker thread running the script panicked.
    #[error("sandbox worker panicked")]
    Panicked,
}

impl From<mlua::Error> for SandboxError {
    fn from(err: mlua::Error) -> Self {
        match err {
            mlua::Error::SyntaxError { message, .. } => SandboxError::Compile(message),
            other => SandboxError::Runtime(other.to_string()),
        }
    }
}

/// Errors a credential provider may return. Never fatal to the trigger.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credentials unavailable: {0}")]
    Unavailable(String),

    #[error("malformed credentials: {0}")]
    Malformed(String),
}
