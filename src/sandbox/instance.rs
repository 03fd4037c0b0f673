//! A single disposable sandbox.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::exec::{self, ExecLimits, ProcessOutput};
use super::state::StateSnapshot;
use super::transcript::{CommandOutcome, Transcript, TranscriptEntry};
use crate::config::EngineConfig;
use crate::descriptor::StateDescriptor;
use crate::error::{Error, Result};
use crate::policy::{CommandPolicy, CommandShape, ParsedCommand, Verdict};
use crate::repo::GitRepo;
use crate::synth::Synthesizer;

/// Longest accepted sandbox id.
const MAX_ID_LEN: usize = 128;

/// Result of one `execute` call, as shown to the learner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// True only if the command was accepted and exited with status zero.
    pub success: bool,
    pub stdout: String,
    /// Process stderr, or the rejection or timeout notice.
    pub stderr: String,
    pub duration_ms: u64,
    pub outcome: CommandOutcome,
}

impl CommandOutput {
    /// Wall-clock time spent on the command.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Returns true if the command policy refused the command.
    pub fn is_rejected(&self) -> bool {
        matches!(self.outcome, CommandOutcome::Rejected { .. })
    }

    /// Returns true if the command was killed by the timeout.
    pub fn is_timed_out(&self) -> bool {
        matches!(self.outcome, CommandOutcome::TimedOut { .. })
    }
}

/// Checks that `id` is usable as a single directory name.
pub(crate) fn validate_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidId(id.to_string()))
    }
}

/// One disposable repository with its command transcript.
///
/// The root directory exists from [`Sandbox::initialize`] until
/// [`Sandbox::cleanup`] (or drop). Commands run one at a time through
/// `&mut self`.
#[derive(Debug)]
pub struct Sandbox {
    id: String,
    root: PathBuf,
    created_at: DateTime<Utc>,
    config: EngineConfig,
    policy: CommandPolicy,
    repo: Option<GitRepo>,
    transcript: Transcript,
    cleaned_up: bool,
}

impl Sandbox {
    /// Creates a sandbox under `base_dir` with default settings.
    ///
    /// Allocates a fresh id if none is given. Does not touch the filesystem.
    pub fn create(id: Option<String>, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let config = EngineConfig::default().with_base_dir(base_dir);
        Self::with_config(id, &config)
    }

    /// Creates a sandbox under `config.base_dir`.
    pub fn with_config(id: Option<String>, config: &EngineConfig) -> Result<Self> {
        let id = match id {
            Some(id) => {
                validate_id(&id)?;
                id
            }
            None => uuid::Uuid::new_v4().simple().to_string(),
        };
        let root = config.base_dir.join(&id);

        Ok(Self {
            id,
            root,
            created_at: Utc::now(),
            config: config.clone(),
            policy: CommandPolicy::new(),
            repo: None,
            transcript: Transcript::new(),
            cleaned_up: false,
        })
    }

    /// Unique id, also the root directory name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Filesystem root of the repository.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// When the sandbox was created. Used by the manager's reaper.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Every command executed so far, in order.
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Returns true between a successful [`Sandbox::initialize`] and cleanup.
    pub fn is_initialized(&self) -> bool {
        self.repo.is_some()
    }

    /// Returns true once [`Sandbox::cleanup`] has run.
    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up
    }

    fn repo(&self) -> Result<&GitRepo> {
        self.repo
            .as_ref()
            .ok_or_else(|| Error::NotInitialized(self.id.clone()))
    }

    /// Creates the root and materializes `descriptor` into it.
    pub fn initialize(&mut self, descriptor: Option<&StateDescriptor>) -> Result<()> {
        if self.cleaned_up {
            return Err(Error::IdReused(self.id.clone()));
        }
        if self.repo.is_some() {
            return Err(Error::AlreadyInitialized(self.id.clone()));
        }

        std::fs::create_dir_all(&self.config.base_dir)?;
        let repo = Synthesizer::from_config(&self.config).materialize(&self.root, descriptor)?;
        self.repo = Some(repo);

        tracing::info!(sandbox_id = %self.id, path = ?self.root, "initialized sandbox");
        Ok(())
    }

    /// Runs `command` with the configured timeout.
    pub async fn run(&mut self, command: &str) -> Result<CommandOutput> {
        let timeout = self.config.command_timeout();
        self.execute(command, timeout).await
    }

    /// Classifies and runs `command`, appending exactly one transcript entry.
    ///
    /// Rejections, non-zero exits and timeouts are reported in the returned
    /// [`CommandOutput`]. An uninitialized sandbox is an error with nothing
    /// recorded. A root that disappeared is recorded as a failed entry and
    /// then returned as [`Error::NotFound`].
    pub async fn execute(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.repo()?;

        let started_at = Utc::now();
        if !self.root.is_dir() {
            let reason = format!("sandbox root {} is gone", self.root.display());
            tracing::error!(sandbox_id = %self.id, command = %command, path = ?self.root, "sandbox root is gone");
            self.transcript.push(TranscriptEntry {
                command: command.to_string(),
                accepted: false,
                outcome: CommandOutcome::Failed {
                    reason: reason.clone(),
                },
                stdout: String::new(),
                stderr: format!("{}\n", reason),
                started_at,
                duration_ms: 0,
            });
            return Err(Error::NotFound(format!("{} ({})", self.id, reason)));
        }

        let clock = Instant::now();

        let (accepted, outcome, stdout, stderr) = match self.policy.classify(command) {
            Verdict::Rejected(rejection) => {
                tracing::warn!(
                    sandbox_id = %self.id,
                    command = %command,
                    stage = ?rejection.stage,
                    reason = %rejection.reason,
                    "command rejected"
                );
                let stderr = rejection.stderr_message();
                let outcome = CommandOutcome::Rejected {
                    stage: rejection.stage,
                    reason: rejection.reason,
                };
                (false, outcome, String::new(), stderr)
            }
            Verdict::Allowed(parsed) => {
                let (outcome, stdout, stderr) = self.dispatch(&parsed, timeout).await;
                (true, outcome, stdout, stderr)
            }
        };

        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::debug!(
            sandbox_id = %self.id,
            command = %command,
            outcome = ?outcome,
            duration_ms = duration_ms,
            "command finished"
        );

        let output = CommandOutput {
            success: outcome.is_success(),
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            duration_ms,
            outcome: outcome.clone(),
        };

        self.transcript.push(TranscriptEntry {
            command: command.to_string(),
            accepted,
            outcome,
            stdout,
            stderr,
            started_at,
            duration_ms,
        });

        Ok(output)
    }

    async fn dispatch(
        &self,
        parsed: &ParsedCommand,
        timeout: Duration,
    ) -> (CommandOutcome, String, String) {
        let result = match (&parsed.shape, &parsed.redirect) {
            (CommandShape::Write { .. }, Some(redirect)) => {
                Ok(exec::write_echo(&self.root, parsed.args(), redirect))
            }
            (CommandShape::Utility { name }, _) if name == "cd" => {
                Ok(exec::change_directory(&self.root, parsed.args()))
            }
            _ => {
                let limits = ExecLimits::from_config(&self.config, timeout);
                exec::run_process(&self.root, &self.config.base_dir, &parsed.argv, &limits).await
            }
        };

        match result {
            Ok(ProcessOutput {
                timed_out: true,
                stdout,
                mut stderr,
                ..
            }) => {
                let after_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!(
                    "Command timed out after {:.1} seconds\n",
                    timeout.as_secs_f64()
                ));
                (CommandOutcome::TimedOut { after_ms }, stdout, stderr)
            }
            Ok(out) => (
                CommandOutcome::Completed {
                    exit_code: out.exit_code,
                },
                out.stdout,
                out.stderr,
            ),
            Err(e) => {
                let reason = if e.kind() == std::io::ErrorKind::NotFound {
                    format!("{}: command not found", parsed.program())
                } else {
                    format!("{}: {}", parsed.program(), e)
                };
                tracing::warn!(sandbox_id = %self.id, error = %e, "failed to start command");
                let stderr = format!("{}\n", reason);
                (CommandOutcome::Failed { reason }, String::new(), stderr)
            }
        }
    }

    /// Returns a read-only snapshot of the repository.
    pub fn current_state(&self) -> Result<StateSnapshot> {
        StateSnapshot::capture(self.repo()?)
    }

    /// Removes the root directory. Safe to call more than once.
    ///
    /// A sandbox that never initialized owns no directory and removes nothing.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.repo.is_some() && self.root.exists() {
            std::fs::remove_dir_all(&self.root).map_err(|e| Error::SandboxCleanup {
                path: self.root.clone(),
                reason: e.to_string(),
            })?;
            tracing::info!(sandbox_id = %self.id, path = ?self.root, "cleaned up sandbox");
        }
        self.repo = None;
        self.cleaned_up = true;
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.cleanup() {
                tracing::error!(error = %e, path = ?self.root, "failed to cleanup sandbox on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::CommitSpec;
    use tempfile::TempDir;

    fn project() -> StateDescriptor {
        StateDescriptor::default()
            .with_commit(
                CommitSpec::new("c1", "Initial commit", "main").with_file("README.md", "# Project"),
            )
            .with_branch("main")
            .with_current_branch("main")
    }

    #[test]
    fn create_allocates_id_without_touching_disk() {
        let base = TempDir::new().unwrap();
        let sandbox = Sandbox::create(None, base.path()).unwrap();

        assert_eq!(sandbox.id().len(), 32);
        assert_eq!(sandbox.root(), base.path().join(sandbox.id()));
        assert!(!sandbox.root().exists());
        assert!(!sandbox.is_initialized());
    }

    #[test]
    fn ids_must_be_single_path_components() {
        let base = TempDir::new().unwrap();
        for bad in ["", "..", "../x", "a/b", ".hidden", "has space"] {
            let err = Sandbox::create(Some(bad.to_string()), base.path()).unwrap_err();
            assert!(matches!(err, Error::InvalidId(_)), "{}", bad);
        }
        assert!(Sandbox::create(Some("lesson-3_attempt.2".to_string()), base.path()).is_ok());
    }

    #[test]
    fn initialize_twice_fails() {
        let base = TempDir::new().unwrap();
        let mut sandbox = Sandbox::create(None, base.path()).unwrap();

        sandbox.initialize(Some(&project())).unwrap();
        assert!(sandbox.root().join("README.md").exists());

        let err = sandbox.initialize(None).unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized(_)));
    }

    #[tokio::test]
    async fn execute_before_initialize_fails() {
        let base = TempDir::new().unwrap();
        let mut sandbox = Sandbox::create(None, base.path()).unwrap();

        let err = sandbox.run("git status").await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));
        assert!(sandbox.transcript().is_empty());
    }

    #[tokio::test]
    async fn rejected_command_spawns_nothing_and_is_recorded() {
        let base = TempDir::new().unwrap();
        let mut sandbox = Sandbox::create(None, base.path()).unwrap();
        sandbox.initialize(Some(&project())).unwrap();

        let out = sandbox.run("git status; rm -rf /").await.unwrap();

        assert!(!out.success);
        assert!(out.is_rejected());
        assert_eq!(out.stdout, "");
        assert!(out.stderr.contains(crate::policy::REJECTION_MARKER));

        let entry = &sandbox.transcript().entries()[0];
        assert!(!entry.accepted);
        assert_eq!(entry.command, "git status; rm -rf /");
    }

    #[tokio::test]
    async fn accepted_commands_run_in_the_root() {
        let base = TempDir::new().unwrap();
        let mut sandbox = Sandbox::create(None, base.path()).unwrap();
        sandbox.initialize(Some(&project())).unwrap();

        let out = sandbox.run("git status").await.unwrap();
        assert!(out.success, "{}", out.stderr);
        assert!(out.stdout.contains("main"));

        let out = sandbox.run("cat README.md").await.unwrap();
        assert_eq!(out.stdout, "# Project");

        let out = sandbox.run("git checkout does-not-exist").await.unwrap();
        assert!(!out.success);
        assert!(matches!(out.outcome, CommandOutcome::Completed { exit_code } if exit_code != 0));

        assert_eq!(sandbox.transcript().len(), 3);
    }

    #[tokio::test]
    async fn echo_redirect_and_commit_flow() {
        let base = TempDir::new().unwrap();
        let mut sandbox = Sandbox::create(None, base.path()).unwrap();
        sandbox.initialize(Some(&project())).unwrap();

        assert!(sandbox.run("echo test > test.txt").await.unwrap().success);
        assert_eq!(
            std::fs::read_to_string(sandbox.root().join("test.txt")).unwrap(),
            "test\n"
        );
        assert!(sandbox.run("git add test.txt").await.unwrap().success);
        let out = sandbox.run("git commit -m 'Add test file'").await.unwrap();
        assert!(out.success, "{}", out.stderr);

        let state = sandbox.current_state().unwrap();
        assert_eq!(state.commits.len(), 2);
        assert_eq!(state.commits[0].message, "Add test file");
        assert_eq!(state.commits[0].author, "Git Quest Player");
        assert!(!state.status.is_dirty);
    }

    #[tokio::test]
    async fn timeout_is_reported_not_raised() {
        let base = TempDir::new().unwrap();
        let mut sandbox = Sandbox::create(None, base.path()).unwrap();
        sandbox.initialize(Some(&project())).unwrap();

        let out = sandbox
            .execute("tail -f README.md", Duration::from_millis(300))
            .await
            .unwrap();

        assert!(out.is_timed_out());
        assert!(!out.success);
        assert!(out.stderr.contains("timed out"));
        assert_eq!(sandbox.transcript().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let base = TempDir::new().unwrap();
        let mut sandbox = Sandbox::create(None, base.path()).unwrap();
        sandbox.initialize(None).unwrap();
        let root = sandbox.root().to_path_buf();

        sandbox.cleanup().unwrap();
        sandbox.cleanup().unwrap();

        assert!(!root.exists());
        assert!(matches!(
            sandbox.initialize(None),
            Err(Error::IdReused(_))
        ));
        assert!(matches!(
            sandbox.run("ls").await,
            Err(Error::NotInitialized(_))
        ));
    }

    #[test]
    fn uninitialized_sandbox_never_removes_a_directory() {
        let base = TempDir::new().unwrap();
        let mut live = Sandbox::create(Some("shared".to_string()), base.path()).unwrap();
        live.initialize(None).unwrap();

        let mut twin = Sandbox::create(Some("shared".to_string()), base.path()).unwrap();
        assert!(matches!(twin.initialize(None), Err(Error::State(_))));
        drop(twin);

        assert!(live.root().join(".git").is_dir());
    }

    #[tokio::test]
    async fn vanished_root_is_recorded_and_reported() {
        let base = TempDir::new().unwrap();
        let mut sandbox = Sandbox::create(None, base.path()).unwrap();
        sandbox.initialize(Some(&project())).unwrap();
        std::fs::remove_dir_all(sandbox.root()).unwrap();

        let err = sandbox.run("git status").await.unwrap_err();

        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(sandbox.transcript().len(), 1);
        let entry = &sandbox.transcript().entries()[0];
        assert_eq!(entry.command, "git status");
        assert!(!entry.accepted);
        assert!(matches!(entry.outcome, CommandOutcome::Failed { .. }));
    }

    #[test]
    fn drop_removes_root() {
        let base = TempDir::new().unwrap();
        let root = {
            let mut sandbox = Sandbox::create(None, base.path()).unwrap();
            sandbox.initialize(None).unwrap();
            sandbox.root().to_path_buf()
        };

        assert!(!root.exists());
    }
}
