//! Error types shared by the supervisor, the Procfile loader and the control protocol.
//!
//! Errors that concern one instance (a failed spawn during restart, a crash) are
//! absorbed into that instance's state; the variants here are what callers see.

use std::path::PathBuf;

use thiserror::Error;

use crate::process::ExitResult;

/// Errors produced by pitcrew.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// The Procfile is missing.
    #[error("procfile does not exist: {}", path.display())]
    MissingProcfile { path: PathBuf },

    /// The Procfile or config file could not be read or parsed.
    #[error("{0}")]
    Config(String),

    /// The Procfile has no entries.
    #[error("no valid entry")]
    EmptySpec,

    /// Two entries share one name.
    #[error("duplicate process name: {0}")]
    DuplicateName(String),

    /// The OS refused to create a child process.
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A command named a process that is not in the registry.
    #[error("unknown proc: {0}")]
    UnknownProcess(String),

    /// `start` was issued for an instance that already has a live child.
    #[error("{0} is already running")]
    AlreadyRunning(String),

    /// `stop` was issued for an instance without a live child.
    #[error("{0} is not running")]
    NotRunning(String),

    /// A start was requested after group shutdown began.
    #[error("cannot start {0}: shutting down")]
    ShuttingDown(String),

    /// An instance exited on its own with a failure while exit-on-error was set.
    #[error("{name} {exit}")]
    ProcessFailed { name: String, exit: ExitResult },

    /// The control protocol connection failed.
    #[error("cannot reach control server at {addr}: {reason}")]
    Communication { addr: String, reason: String },

    /// A control protocol message could not be decoded.
    #[error("malformed request: {0}")]
    Protocol(String),
}

impl Error {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::MissingProcfile { .. } | Error::Config(_) => "config_error",
            Error::EmptySpec => "empty_spec",
            Error::DuplicateName(_) => "duplicate_name",
            Error::Spawn { .. } => "spawn_error",
            Error::UnknownProcess(_) => "unknown_target",
            Error::AlreadyRunning(_) => "already_running",
            Error::NotRunning(_) => "not_running",
            Error::ShuttingDown(_) => "shutting_down",
            Error::ProcessFailed { .. } => "process_failure",
            Error::Communication { .. } => "communication_error",
            Error::Protocol(_) => "protocol_error",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
