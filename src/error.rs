//! Error types for the git sandbox engine.
//!
//! Policy rejections and command timeouts are not errors: they are reported
//! as [`CommandOutcome`](crate::sandbox::CommandOutcome) values so callers can
//! show them as in-game feedback. Everything here is either a malformed input
//! or an infrastructure fault.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for sandbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The state descriptor is malformed or inconsistent.
    #[error("invalid repository state: {0}")]
    State(String),

    /// No live sandbox has this id.
    #[error("sandbox not found: {0}")]
    NotFound(String),

    /// `initialize` was called on a sandbox that already has a repository.
    #[error("sandbox {0} is already initialized")]
    AlreadyInitialized(String),

    /// An operation needed a repository but the sandbox has none yet.
    #[error("sandbox {0} is not initialized")]
    NotInitialized(String),

    /// A sandbox id was used before, either live or already destroyed.
    #[error("sandbox id {0} has already been used")]
    IdReused(String),

    /// A sandbox id is not usable as a single directory name.
    #[error("invalid sandbox id: {0}")]
    InvalidId(String),

    /// Failed to clean up a sandbox.
    #[error("failed to clean up sandbox at {path}: {reason}")]
    SandboxCleanup { path: PathBuf, reason: String },

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// IO error during sandbox operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true for filesystem and git failures the caller cannot fix by
    /// changing its input.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::Git(_) | Error::Io(_) | Error::SandboxCleanup { .. }
        )
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;
