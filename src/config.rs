//! Engine configuration and validation.
//!
//! Configuration is loaded from TOML, optionally overlaid with `GITQUEST_*`
//! environment variables, and validated before the manager is built.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing with a configuration error.
    pub fn into_result(self) -> Result<Vec<String>> {
        self.into_result_with(Error::Config)
    }

    /// Converts to a Result, building the error from the joined messages.
    pub fn into_result_with(self, make_err: impl FnOnce(String) -> Error) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(make_err(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Identity written into every sandbox repository's local config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default = "default_identity_name")]
    pub name: String,
    #[serde(default = "default_identity_email")]
    pub email: String,
}

fn default_identity_name() -> String {
    "Git Quest Player".to_string()
}

fn default_identity_email() -> String {
    "player@gitquest.com".to_string()
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            name: default_identity_name(),
            email: default_identity_email(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory under which every sandbox root is created.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Wall-clock limit for a single command.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Time between SIGTERM and SIGKILL for a timed-out command.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_ms: u64,

    /// Sandboxes older than this are reaped.
    #[serde(default = "default_reap_age")]
    pub reap_age_secs: u64,

    /// How often the background reaper sweeps.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Cap on captured stdout and stderr per command.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Branch used for the first commit and for empty repositories.
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Committer identity for synthesized and learner commits.
    #[serde(default)]
    pub identity: Identity,
}

fn default_base_dir() -> PathBuf {
    std::env::temp_dir().join("gitquest_sandboxes")
}

fn default_command_timeout() -> u64 {
    30
}

fn default_kill_grace() -> u64 {
    2000
}

fn default_reap_age() -> u64 {
    24 * 60 * 60
}

fn default_reap_interval() -> u64 {
    60 * 60
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_branch() -> String {
    "main".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            command_timeout_secs: default_command_timeout(),
            kill_grace_ms: default_kill_grace(),
            reap_age_secs: default_reap_age(),
            reap_interval_secs: default_reap_interval(),
            max_output_bytes: default_max_output_bytes(),
            default_branch: default_branch(),
            identity: Identity::default(),
        }
    }
}

impl EngineConfig {
    /// Loads a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;

        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Returns a copy with `GITQUEST_*` environment overrides applied.
    ///
    /// Recognized variables: `GITQUEST_BASE_DIR`, `GITQUEST_COMMAND_TIMEOUT_SECS`,
    /// `GITQUEST_REAP_AGE_SECS`.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var("GITQUEST_BASE_DIR") {
            self.base_dir = PathBuf::from(dir);
        }
        if let Ok(secs) = std::env::var("GITQUEST_COMMAND_TIMEOUT_SECS") {
            self.command_timeout_secs = parse_env_u64("GITQUEST_COMMAND_TIMEOUT_SECS", &secs)?;
        }
        if let Ok(secs) = std::env::var("GITQUEST_REAP_AGE_SECS") {
            self.reap_age_secs = parse_env_u64("GITQUEST_REAP_AGE_SECS", &secs)?;
        }
        Ok(self)
    }

    /// Sets the base directory.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Sets the per-command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_secs = timeout.as_secs();
        self
    }

    /// Returns the per-command timeout as a Duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Returns the SIGTERM to SIGKILL grace period.
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Returns the reap age threshold.
    pub fn reap_age(&self) -> Duration {
        Duration::from_secs(self.reap_age_secs)
    }

    /// Returns the background reaper interval.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

fn parse_env_u64(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a number, got '{}'", name, value)))
}

impl Validate for EngineConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.base_dir.as_os_str().is_empty() {
            result.add_error("base_dir cannot be empty");
        } else if !self.base_dir.is_absolute() {
            result.add_warning("base_dir is relative and depends on the working directory");
        }

        if self.command_timeout_secs == 0 {
            result.add_error("command_timeout_secs must be at least 1");
        }

        if self.command_timeout_secs > 300 {
            result.add_warning("command_timeout_secs over 5 minutes lets a learner pin a worker");
        }

        if self.reap_age_secs == 0 {
            result.add_error("reap_age_secs must be at least 1");
        }

        if self.reap_interval_secs == 0 {
            result.add_error("reap_interval_secs must be at least 1");
        }

        if self.max_output_bytes < 1024 {
            result.add_warning("max_output_bytes under 1 KiB will truncate most git output");
        }

        if self.default_branch.trim().is_empty() {
            result.add_error("default_branch cannot be empty");
        }

        if self.identity.name.trim().is_empty() || self.identity.email.trim().is_empty() {
            result.add_error("identity name and email are required for commits");
        }

        result
    }
}
