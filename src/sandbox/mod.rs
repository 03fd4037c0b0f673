//! Sandbox module: one disposable repository per learner attempt.
//!
//! A [`Sandbox`] owns its root directory, the repository inside it and a
//! [`Transcript`] of every submitted command. Commands pass through the
//! [`CommandPolicy`](crate::policy::CommandPolicy) before anything is spawned.

mod exec;
mod instance;
mod state;
mod transcript;

pub use instance::{CommandOutput, Sandbox};
pub(crate) use instance::validate_id;
pub use state::{CommitRecord, StateSnapshot, WorkingTreeStatus, MAX_SNAPSHOT_COMMITS};
pub use transcript::{CommandOutcome, Transcript, TranscriptEntry};
