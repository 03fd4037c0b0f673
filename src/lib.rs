//! Git Quest sandbox engine.
//!
//! Builds disposable git repositories from a declarative commit graph, runs
//! learner commands against them behind an allow-list policy and a hard
//! timeout, and scores the final repository against a rubric.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod evaluator;
pub mod manager;
pub mod policy;
pub mod repo;
pub mod sandbox;
pub mod scoring;
pub mod synth;

pub use config::{EngineConfig, Identity, Validate, ValidationResult};
pub use descriptor::{CommitSpec, StateDescriptor, SuccessCriteria};
pub use error::{Error, Result};
pub use evaluator::{evaluate, evaluate_state, EvaluationResult};
pub use manager::{SandboxManager, SharedSandbox};
pub use policy::{CommandPolicy, CommandShape, ParsedCommand, Rejection, Stage, Verdict};
pub use repo::GitRepo;
pub use sandbox::{
    CommandOutcome, CommandOutput, CommitRecord, Sandbox, StateSnapshot, Transcript,
    TranscriptEntry, WorkingTreeStatus,
};
pub use scoring::{award, score, AttemptContext, Award};
pub use synth::Synthesizer;
