//! Caller-side scoring of an evaluation.
//!
//! The evaluator only reports counts. This module turns them into points
//! and experience the way the challenge service awards them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::evaluator::EvaluationResult;

/// Experience deducted per hint used.
pub const HINT_PENALTY: u32 = 5;

/// Experience deducted when the attempt exceeds the time limit.
pub const OVERTIME_PENALTY: u32 = 10;

/// Points and experience awarded for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Award {
    pub score: u32,
    /// Zero unless the attempt succeeded.
    pub xp: u32,
}

/// How an attempt was played.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptContext {
    pub max_score: u32,
    pub hints_used: u32,
    pub time_taken: Duration,
    pub time_limit: Option<Duration>,
}

/// Full `max_score` on success, otherwise credit proportional to the
/// satisfied predicates, rounded down.
pub fn score(result: &EvaluationResult, max_score: u32) -> u32 {
    if result.success {
        return max_score;
    }
    let total = result.total() as u64;
    if total == 0 {
        return 0;
    }
    let met = result.met() as u64;
    u32::try_from(met * u64::from(max_score) / total).unwrap_or(max_score)
}

/// Computes the award for an attempt.
pub fn award(result: &EvaluationResult, ctx: &AttemptContext) -> Award {
    let score = score(result, ctx.max_score);
    if !result.success {
        return Award { score, xp: 0 };
    }

    let overtime = ctx.time_limit.is_some_and(|limit| ctx.time_taken > limit);
    let penalty = ctx
        .hints_used
        .saturating_mul(HINT_PENALTY)
        .saturating_add(if overtime { OVERTIME_PENALTY } else { 0 });

    Award {
        score,
        xp: score.saturating_sub(penalty),
    }
}
