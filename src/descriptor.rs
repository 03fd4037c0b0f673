//! Declarative inputs supplied by the challenge content.
//!
//! A [`StateDescriptor`] describes the commit graph a sandbox starts from;
//! [`SuccessCriteria`] is the rubric its final state is scored against. Both
//! are JSON-shaped and deserialize with the defaults the challenge content
//! relies on.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::{Validate, ValidationResult};
use crate::error::{Error, Result};

/// One commit to synthesize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSpec {
    /// Synthetic id used by later commits' `parents`.
    pub id: String,

    /// Commit message.
    #[serde(default = "default_message")]
    pub message: String,

    /// Branch the commit lands on.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Synthetic ids of parent commits. Must already be materialized.
    #[serde(default)]
    pub parents: Vec<String>,

    /// Files written before committing (path relative to the root -> content).
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

fn default_message() -> String {
    "Commit".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

impl CommitSpec {
    /// Creates a commit on `branch` with no parents and no files.
    pub fn new(id: impl Into<String>, message: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            branch: branch.into(),
            parents: Vec::new(),
            files: BTreeMap::new(),
        }
    }

    /// Adds a parent by synthetic id.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parents.push(parent.into());
        self
    }

    /// Adds a file to write before committing.
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }
}

/// Initial repository state for a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDescriptor {
    /// Commits, processed in order.
    #[serde(default)]
    pub commits: Vec<CommitSpec>,

    /// Branches that must exist after synthesis.
    #[serde(default)]
    pub branches: Vec<String>,

    /// Branch checked out at the end. Falls back to the engine's default branch.
    #[serde(default)]
    pub current_branch: Option<String>,
}

impl StateDescriptor {
    /// Parses a descriptor from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::State(format!("failed to parse state descriptor: {}", e)))
    }

    /// Returns true if there is nothing to synthesize.
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty() && self.branches.is_empty() && self.current_branch.is_none()
    }

    /// Adds a commit.
    pub fn with_commit(mut self, commit: CommitSpec) -> Self {
        self.commits.push(commit);
        self
    }

    /// Adds a branch that must exist.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branches.push(branch.into());
        self
    }

    /// Sets the branch checked out at the end.
    pub fn with_current_branch(mut self, branch: impl Into<String>) -> Self {
        self.current_branch = Some(branch.into());
        self
    }
}

/// Returns true if `path` is a relative path that stays inside the root and
/// outside `.git`.
pub(crate) fn is_confined_path(path: &str) -> bool {
    let components: Vec<&str> = path
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();

    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && !components.is_empty()
        && !components.contains(&"..")
        && components[0] != ".git"
}

impl Validate for StateDescriptor {
    /// Checks id uniqueness, forward-only parent references and file paths.
    /// Branch name syntax is checked by git during synthesis.
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        let mut seen: HashSet<&str> = HashSet::new();

        for commit in &self.commits {
            if commit.id.trim().is_empty() {
                result.add_error("commit id cannot be empty");
            }

            for parent in &commit.parents {
                if !seen.contains(parent.as_str()) {
                    result.add_error(format!(
                        "commit '{}' references parent '{}' before it is materialized",
                        commit.id, parent
                    ));
                }
            }

            if !seen.insert(commit.id.as_str()) {
                result.add_error(format!("duplicate commit id '{}'", commit.id));
            }

            if commit.branch.trim().is_empty() {
                result.add_error(format!("commit '{}' has an empty branch name", commit.id));
            }

            for path in commit.files.keys() {
                if !is_confined_path(path) {
                    result.add_error(format!(
                        "commit '{}' writes outside the repository: {}",
                        commit.id, path
                    ));
                }
            }

            if commit.parents.len() > 1 && commit.files.is_empty() {
                result.add_warning(format!(
                    "merge commit '{}' has no files and will only touch the README",
                    commit.id
                ));
            }
        }

        if self.commits.is_empty() {
            let stray: Vec<&str> = self
                .branches
                .iter()
                .map(String::as_str)
                .filter(|b| Some(*b) != self.current_branch.as_deref())
                .collect();
            if !stray.is_empty() {
                result.add_warning(format!(
                    "branches {:?} cannot exist without commits and will be skipped",
                    stray
                ));
            }
        }

        result
    }
}

/// Rubric a finished sandbox is scored against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessCriteria {
    /// Substrings that must appear in some accepted command.
    #[serde(default)]
    pub required_commands: Vec<String>,

    /// Minimum number of commits reachable from HEAD. Zero means unset.
    #[serde(default)]
    pub min_commits: Option<usize>,

    /// Branches that must exist.
    #[serde(default)]
    pub required_branches: Vec<String>,

    /// Require no staged or unstaged changes to tracked files.
    #[serde(default)]
    pub clean_working_directory: bool,

    /// Free-text description shown with the result.
    #[serde(default)]
    pub description: String,
}

impl SuccessCriteria {
    /// Parses criteria from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("failed to parse success criteria: {}", e)))
    }

    /// Returns the number of predicates this rubric evaluates.
    pub fn predicate_count(&self) -> usize {
        self.required_commands.len()
            + usize::from(self.min_commits.is_some_and(|n| n > 0))
            + self.required_branches.len()
            + usize::from(self.clean_working_directory)
    }
}

impl Validate for SuccessCriteria {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.required_commands.iter().any(|c| c.trim().is_empty()) {
            result.add_error("required command substrings cannot be empty");
        }

        if self.min_commits == Some(0) {
            result.add_warning("min_commits = 0 is ignored");
        }

        if self.predicate_count() == 0 {
            result.add_warning("criteria have no predicates and always succeed");
        }

        result
    }
}
