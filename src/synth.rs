//! Repository state synthesizer.
//!
//! Turns a [`StateDescriptor`] into a real repository whose history matches
//! it. Commits are processed in descriptor order; each one is built with
//! `git commit-tree` so every mapped parent is honoured, which also makes
//! merge commits possible. A merge commit's tree holds the files of all its
//! parents plus its own.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::config::{EngineConfig, Identity, Validate};
use crate::descriptor::{CommitSpec, StateDescriptor};
use crate::error::{Error, Result};
use crate::repo::GitRepo;

/// File that receives the commit message when a commit lists no files.
pub const FALLBACK_FILE: &str = "README.md";

/// Builds repositories from state descriptors.
#[derive(Debug, Clone)]
pub struct Synthesizer {
    default_branch: String,
    identity: Identity,
}

/// Hands out strictly increasing commit timestamps ending just before now,
/// so synthesized history always sorts before anything the learner commits.
struct SyntheticClock {
    next: i64,
}

impl SyntheticClock {
    fn new(commits: usize) -> Self {
        let span = i64::try_from(commits).unwrap_or(i64::MAX / 2);
        Self {
            next: chrono::Utc::now().timestamp() - span - 1,
        }
    }

    fn tick(&mut self) -> String {
        let ts = self.next;
        self.next += 1;
        format!("@{} +0000", ts)
    }
}

impl Synthesizer {
    /// Creates a synthesizer.
    pub fn new(default_branch: impl Into<String>, identity: Identity) -> Self {
        Self {
            default_branch: default_branch.into(),
            identity,
        }
    }

    /// Creates a synthesizer using the engine's branch and identity settings.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.default_branch.clone(), config.identity.clone())
    }

    /// Creates `root` and materializes `descriptor` into it.
    ///
    /// Fails with [`Error::State`] if `root` already exists or the descriptor
    /// is inconsistent. On any failure the partially built root is removed.
    pub fn materialize(&self, root: &Path, descriptor: Option<&StateDescriptor>) -> Result<GitRepo> {
        if root.exists() {
            return Err(Error::State(format!(
                "sandbox root already exists: {}",
                root.display()
            )));
        }
        if let Some(descriptor) = descriptor {
            descriptor.validate().into_result_with(Error::State)?;
        }

        std::fs::create_dir(root)?;

        match self.build(root, descriptor) {
            Ok(repo) => Ok(repo),
            Err(e) => {
                if let Err(rm) = std::fs::remove_dir_all(root) {
                    tracing::warn!(path = ?root, error = %rm, "failed to remove partial sandbox root");
                }
                Err(e)
            }
        }
    }

    fn build(&self, root: &Path, descriptor: Option<&StateDescriptor>) -> Result<GitRepo> {
        let Some(descriptor) = descriptor else {
            return GitRepo::init(root, &self.default_branch, &self.identity);
        };

        let initial_branch = descriptor
            .commits
            .first()
            .map(|c| c.branch.as_str())
            .or(descriptor.current_branch.as_deref())
            .unwrap_or(&self.default_branch);

        self.check_branch_names(&GitRepo::open(root), descriptor)?;
        let repo = GitRepo::init(root, initial_branch, &self.identity)?;

        let mut clock = SyntheticClock::new(descriptor.commits.len());
        let mut commit_map: HashMap<&str, String> = HashMap::new();

        for spec in &descriptor.commits {
            let oid = self.apply_commit(&repo, spec, &commit_map, clock.tick())?;
            tracing::debug!(id = %spec.id, oid = %oid, branch = %spec.branch, "materialized commit");
            commit_map.insert(spec.id.as_str(), oid);
        }

        self.ensure_branches(&repo, descriptor)?;
        self.checkout_current(&repo, descriptor)?;

        tracing::info!(
            path = ?root,
            commits = descriptor.commits.len(),
            "synthesized repository state"
        );

        Ok(repo)
    }

    fn check_branch_names(&self, repo: &GitRepo, descriptor: &StateDescriptor) -> Result<()> {
        let names = descriptor
            .commits
            .iter()
            .map(|c| c.branch.as_str())
            .chain(descriptor.branches.iter().map(String::as_str))
            .chain(descriptor.current_branch.as_deref());

        for name in names {
            if !repo.is_valid_branch_name(name)? {
                return Err(Error::State(format!("invalid branch name '{}'", name)));
            }
        }
        Ok(())
    }

    fn apply_commit(
        &self,
        repo: &GitRepo,
        spec: &CommitSpec,
        commit_map: &HashMap<&str, String>,
        date: String,
    ) -> Result<String> {
        let parents = spec
            .parents
            .iter()
            .map(|p| {
                commit_map.get(p.as_str()).cloned().ok_or_else(|| {
                    Error::State(format!(
                        "commit '{}' references unknown parent '{}'",
                        spec.id, p
                    ))
                })
            })
            .collect::<Result<Vec<String>>>()?;

        self.checkout_branch(repo, &spec.branch, parents.first().map(String::as_str))?;

        // Merge trees are the union of all parents, later parents winning
        // on paths they share, before the commit's own files are applied.
        for other in parents.iter().skip(1) {
            repo.git(["checkout", other.as_str(), "--", "."])?;
        }

        let mut staged = Vec::with_capacity(spec.files.len().max(1));
        if spec.files.is_empty() {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(repo.path().join(FALLBACK_FILE))?;
            writeln!(file, "\n{}", spec.message)?;
            staged.push(FALLBACK_FILE.to_string());
        } else {
            for (rel, content) in &spec.files {
                let full = repo.path().join(rel);
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&full, content)?;
                staged.push(rel.clone());
            }
        }

        let mut add = vec!["add".to_string(), "-f".to_string(), "--".to_string()];
        add.extend(staged);
        repo.git(add)?;

        let tree = repo.git(["write-tree"])?.trim().to_string();

        let mut parent_oids = parents;
        if parent_oids.is_empty() {
            if let Some(head) = repo.head_commit()? {
                parent_oids.push(head);
            }
        }

        let mut args = vec!["commit-tree".to_string(), tree];
        for oid in &parent_oids {
            args.push("-p".to_string());
            args.push(oid.clone());
        }
        args.push("-m".to_string());
        args.push(spec.message.clone());

        let oid = repo
            .git_with_env(
                args,
                [("GIT_AUTHOR_DATE", &date), ("GIT_COMMITTER_DATE", &date)],
            )?
            .trim()
            .to_string();

        repo.git(["update-ref", &format!("refs/heads/{}", spec.branch), &oid])?;

        Ok(oid)
    }

    /// Puts `HEAD` on `branch`, creating it at `start` (or the current commit)
    /// when missing. An existing branch whose tip is not `start` is moved there.
    fn checkout_branch(&self, repo: &GitRepo, branch: &str, start: Option<&str>) -> Result<()> {
        if repo.branch_exists(branch)? {
            if repo.symbolic_head()?.as_deref() != Some(branch) {
                repo.git(["checkout", "-q", branch])?;
            }
            if let Some(start) = start {
                if repo.head_commit()?.as_deref() != Some(start) {
                    repo.git(["reset", "-q", "--hard", start])?;
                }
            }
            return Ok(());
        }

        let base = match start {
            Some(oid) => Some(oid.to_string()),
            None => repo.head_commit()?,
        };

        match base {
            Some(base) => {
                repo.git(["checkout", "-q", "-b", branch, &base])?;
            }
            None => {
                // Nothing committed yet: the next commit creates the branch.
                repo.git(["symbolic-ref", "HEAD", &format!("refs/heads/{}", branch)])?;
            }
        }
        Ok(())
    }

    fn ensure_branches(&self, repo: &GitRepo, descriptor: &StateDescriptor) -> Result<()> {
        let head = repo.head_commit()?;

        for branch in &descriptor.branches {
            if repo.branch_exists(branch)? {
                continue;
            }
            match &head {
                Some(oid) => {
                    repo.git(["branch", branch, oid])?;
                }
                None => {
                    tracing::warn!(branch = %branch, "skipping branch in repository without commits");
                }
            }
        }
        Ok(())
    }

    fn checkout_current(&self, repo: &GitRepo, descriptor: &StateDescriptor) -> Result<()> {
        let current = match descriptor.current_branch.as_deref() {
            Some(name) => name,
            None if repo.branch_exists(&self.default_branch)? => &self.default_branch,
            None => return Ok(()),
        };

        if repo.head_commit()?.is_none() {
            repo.git(["symbolic-ref", "HEAD", &format!("refs/heads/{}", current)])?;
            return Ok(());
        }

        if repo.branch_exists(current)? {
            if repo.symbolic_head()?.as_deref() != Some(current) {
                repo.git(["checkout", "-q", current])?;
            }
        } else {
            repo.git(["checkout", "-q", "-b", current])?;
        }
        Ok(())
    }
}
