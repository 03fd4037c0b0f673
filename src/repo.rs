//! Handle to an on-disk git repository.
//!
//! All repository access goes through the `git` binary so that the result is
//! an ordinary repository any external tooling can inspect.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::config::Identity;
use crate::error::{Error, Result};

/// Environment applied to every git invocation made by the engine, so that
/// host-level git configuration never leaks into a sandbox.
pub(crate) const ISOLATED_GIT_ENV: &[(&str, &str)] = &[
    ("GIT_CONFIG_NOSYSTEM", "1"),
    ("GIT_CONFIG_GLOBAL", "/dev/null"),
    ("GIT_TERMINAL_PROMPT", "0"),
    ("GIT_PAGER", "cat"),
    ("GIT_EDITOR", "true"),
];

/// A git repository rooted at a directory.
#[derive(Debug, Clone)]
pub struct GitRepo {
    path: PathBuf,
}

impl GitRepo {
    /// Wraps an existing repository without checking it.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Runs `git init` in `path`, points `HEAD` at `branch` and writes the
    /// committer identity into the local config.
    pub fn init(path: impl Into<PathBuf>, branch: &str, identity: &Identity) -> Result<Self> {
        let repo = Self::open(path);

        repo.git(["init", "-q"])?;
        repo.git(["symbolic-ref", "HEAD", &format!("refs/heads/{}", branch)])?;
        repo.git(["config", "user.name", &identity.name])?;
        repo.git(["config", "user.email", &identity.email])?;
        repo.git(["config", "commit.gpgsign", "false"])?;

        tracing::debug!(path = ?repo.path, branch = %branch, "initialized repository");

        Ok(repo)
    }

    /// Returns the repository root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.path)
            .args(args)
            .envs(ISOLATED_GIT_ENV.iter().copied());
        cmd
    }

    fn finish(args: &[String], output: Output) -> Result<String> {
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Runs git and returns stdout, failing on a non-zero exit.
    pub fn git<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.git_with_env(args, std::iter::empty::<(&str, &str)>())
    }

    /// Runs git with extra environment variables.
    pub fn git_with_env<I, S, E, K, V>(&self, args: I, envs: E) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        E: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        let output = self.command(&args).envs(envs).output()?;
        Self::finish(&args, output)
    }

    /// Runs git and returns stdout, or `None` on a non-zero exit.
    ///
    /// Used for probes such as "does this ref exist".
    pub fn try_git<I, S>(&self, args: I) -> Result<Option<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.command(args).output()?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
        } else {
            Ok(None)
        }
    }

    /// Returns the full hash of `HEAD`, or `None` if there are no commits.
    pub fn head_commit(&self) -> Result<Option<String>> {
        Ok(self
            .try_git(["rev-parse", "--verify", "-q", "HEAD^{commit}"])?
            .map(|s| s.trim().to_string()))
    }

    /// Returns true if `refs/heads/<name>` exists.
    pub fn branch_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .try_git([
                "show-ref",
                "--verify",
                "-q",
                &format!("refs/heads/{}", name),
            ])?
            .is_some())
    }

    /// Returns local branch names.
    pub fn branches(&self) -> Result<Vec<String>> {
        let out = self.git(["for-each-ref", "--format=%(refname:short)", "refs/heads/"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Returns the branch `HEAD` points at (possibly unborn), or `None` when
    /// `HEAD` is detached.
    pub fn symbolic_head(&self) -> Result<Option<String>> {
        Ok(self
            .try_git(["symbolic-ref", "-q", "--short", "HEAD"])?
            .map(|s| s.trim().to_string()))
    }

    /// Returns true if `name` is a valid branch name.
    pub fn is_valid_branch_name(&self, name: &str) -> Result<bool> {
        Ok(!name.starts_with('-')
            && self
                .try_git(["check-ref-format", "--branch", name])?
                .is_some())
    }
}
