//! Error types for the load generator.
//!
//! Every failure a worker or a stage can run into is one of the variants of
//! [`Error`]. Worker-level variants end up inside a
//! [`WorkerReport`](crate::pool::WorkerReport) and never cancel sibling
//! workers; `Setup` is the only kind that aborts a stage before fan-out.
//!
//! ## Error Cases
//! - `Setup`: transport or client construction failed before any worker ran.
//! - `Connection`: a single worker could not connect or complete a handshake.
//! - `Command`: a single worker failed to build or write its request.
//! - `Close`: releasing a connection failed during cleanup.
//! - `Interrupted`: a worker observed the stage cancellation signal.
//! - `Abandoned`: a worker did not yield after cancellation and was aborted.

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Stage-wide configuration could not be built.
    #[error("Setup error: {reason}")]
    Setup { reason: String },

    /// Connect, DNS or handshake failure for one worker.
    #[error("Connection error ({target}): {reason}")]
    Connection { target: String, reason: String },

    /// Write, `SET` or value construction failure for one worker.
    #[error("Command error for {key}: {reason}")]
    Command { key: String, reason: String },

    /// Releasing a connection or client handle failed.
    #[error("Close error ({resource}): {reason}")]
    Close { resource: String, reason: String },

    /// The worker stopped because the stage deadline passed.
    #[error("Worker for {key} interrupted")]
    Interrupted { key: String },

    /// The worker was aborted, or panicked, before it could report.
    #[error("Worker for {key} abandoned")]
    Abandoned { key: String },
}

impl Error {
    /// Short, stable name of the variant, used for outcome tallies.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Setup { .. } => "setup",
            Self::Connection { .. } => "connection",
            Self::Command { .. } => "command",
            Self::Close { .. } => "close",
            Self::Interrupted { .. } => "interrupted",
            Self::Abandoned { .. } => "abandoned",
        }
    }

    pub(crate) fn connection(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn command(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Command {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn close(resource: impl Into<String>, reason: impl ToString) -> Self {
        Self::Close {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn setup(reason: impl ToString) -> Self {
        Self::Setup {
            reason: reason.to_string(),
        }
    }
}
