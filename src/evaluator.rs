//! Criteria evaluator.
//!
//! Every predicate in a [`SuccessCriteria`] is checked independently and
//! reported as satisfied or unsatisfied; nothing short-circuits. Points are
//! not computed here (see [`crate::scoring`]).

use serde::{Deserialize, Serialize};

use crate::descriptor::SuccessCriteria;
use crate::error::Result;
use crate::sandbox::{Sandbox, StateSnapshot};

/// Outcome of evaluating a sandbox against its criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// True iff nothing is unsatisfied.
    pub success: bool,
    pub satisfied: Vec<String>,
    pub unsatisfied: Vec<String>,
    /// Free-text description copied from the criteria.
    pub description: String,
}

impl EvaluationResult {
    /// Number of satisfied predicates.
    pub fn met(&self) -> usize {
        self.satisfied.len()
    }

    /// Number of evaluated predicates.
    pub fn total(&self) -> usize {
        self.satisfied.len() + self.unsatisfied.len()
    }
}

/// Evaluates `sandbox` against `criteria`.
pub fn evaluate(sandbox: &Sandbox, criteria: &SuccessCriteria) -> Result<EvaluationResult> {
    let state = sandbox.current_state()?;
    let result = evaluate_state(&state, sandbox.transcript().accepted_commands(), criteria);

    tracing::info!(
        sandbox_id = %sandbox.id(),
        success = result.success,
        met = result.met(),
        total = result.total(),
        "evaluated sandbox"
    );

    Ok(result)
}

/// Evaluates a captured state and the accepted commands that led to it.
pub fn evaluate_state<'a>(
    state: &StateSnapshot,
    accepted_commands: impl IntoIterator<Item = &'a str>,
    criteria: &SuccessCriteria,
) -> EvaluationResult {
    let commands: Vec<&str> = accepted_commands.into_iter().collect();
    let mut satisfied = Vec::new();
    let mut unsatisfied = Vec::new();

    let mut record = |ok: bool, met: String, failed: String| {
        if ok {
            satisfied.push(met);
        } else {
            unsatisfied.push(failed);
        }
    };

    for required in &criteria.required_commands {
        record(
            commands.iter().any(|c| c.contains(required.as_str())),
            format!("Executed required command: {}", required),
            format!("Missing required command: {}", required),
        );
    }

    // Counted over the snapshot, which lists at most MAX_SNAPSHOT_COMMITS.
    if let Some(min) = criteria.min_commits.filter(|n| *n > 0) {
        let count = state.commits.len();
        record(
            count >= min,
            format!("Has {} commits (required: {})", count, min),
            format!("Only {} commits (required: {})", count, min),
        );
    }

    for branch in &criteria.required_branches {
        record(
            state.branches.iter().any(|b| b == branch),
            format!("Branch exists: {}", branch),
            format!("Missing branch: {}", branch),
        );
    }

    if criteria.clean_working_directory {
        record(
            !state.status.is_dirty,
            "Working directory is clean".to_string(),
            "Working directory has uncommitted changes".to_string(),
        );
    }

    EvaluationResult {
        success: unsatisfied.is_empty(),
        satisfied,
        unsatisfied,
        description: criteria.description.clone(),
    }
}
