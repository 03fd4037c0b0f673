//! Process execution for accepted commands.
//!
//! Commands are spawned directly from their argument vector with no shell,
//! in a fresh process group, with a scrubbed environment and the sandbox root
//! as working directory. Timeouts escalate from SIGTERM on the whole group to
//! a forced kill after a grace period.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::config::EngineConfig;
use crate::policy::Redirect;

/// Config overrides passed ahead of every learner `git` invocation so that
/// repository-local settings cannot run programs or reach the network.
const HARDENED_GIT_ARGS: &[&str] = &[
    "-c",
    "core.hooksPath=/dev/null",
    "-c",
    "core.fsmonitor=false",
    "-c",
    "protocol.allow=never",
];

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// System and global config file for learner `git`. Nothing can be created
/// under `/proc/self`, so writes to those scopes fail instead of reaching
/// the host.
const UNWRITABLE_CONFIG: &str = "/proc/self/gitquest/gitconfig";

const READ_CHUNK: usize = 8192;

/// Limits applied to one spawned command.
#[derive(Debug, Clone)]
pub(crate) struct ExecLimits {
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub max_output_bytes: usize,
}

impl ExecLimits {
    pub fn from_config(config: &EngineConfig, timeout: Duration) -> Self {
        Self {
            timeout,
            kill_grace: config.kill_grace(),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// Captured result of a spawned command or builtin.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessOutput {
    fn builtin(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            timed_out: false,
        }
    }
}

/// Environment for sandboxed children. The parent environment is cleared
/// first, so nothing else (tokens, credential helpers, `GIT_DIR`) leaks in.
pub(crate) fn sandbox_env(root: &Path, ceiling: &Path) -> Vec<(&'static str, String)> {
    vec![
        (
            "PATH",
            std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
        ),
        ("HOME", root.to_string_lossy().into_owned()),
        ("TERM", "dumb".to_string()),
        (
            "LANG",
            std::env::var("LANG").unwrap_or_else(|_| "C.UTF-8".to_string()),
        ),
        ("GIT_TERMINAL_PROMPT", "0".to_string()),
        ("GIT_ASKPASS", String::new()),
        ("SSH_ASKPASS", String::new()),
        ("GIT_PAGER", "cat".to_string()),
        ("PAGER", "cat".to_string()),
        ("GIT_EDITOR", "true".to_string()),
        ("GIT_CONFIG_NOSYSTEM", "1".to_string()),
        ("GIT_CONFIG_SYSTEM", UNWRITABLE_CONFIG.to_string()),
        ("GIT_CONFIG_GLOBAL", UNWRITABLE_CONFIG.to_string()),
        (
            "GIT_CEILING_DIRECTORIES",
            ceiling.to_string_lossy().into_owned(),
        ),
    ]
}

/// Truncate a UTF-8 string at or before `max_bytes`, respecting char boundaries.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Reads a stream to EOF, keeping at most `cap` bytes. Returns the kept
/// bytes and the total length seen.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, usize) {
    let mut kept = Vec::new();
    let mut total = 0usize;
    let mut buf = [0u8; READ_CHUNK];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if kept.len() < cap {
                    let take = (cap - kept.len()).min(n);
                    kept.extend_from_slice(&buf[..take]);
                }
                total += n;
            }
            Err(e) => {
                tracing::debug!(error = %e, "stopped reading child output");
                break;
            }
        }
    }

    (kept, total)
}

fn render_output(bytes: &[u8], total: usize, cap: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut out = truncate_utf8(&text, cap).to_string();
    if total > cap {
        out.push_str(&format!("\n[output truncated, {} bytes total]", total));
    }
    out
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), signal) {
        tracing::debug!(pid = pid, signal = ?signal, error = %e, "failed to signal process group");
    }
}

/// Stops a child that outlived its timeout. The group gets SIGTERM, then
/// SIGKILL if it is still alive after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;

        signal_group(child, Signal::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        signal_group(child, Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill timed-out command");
    }
}

/// Spawns `argv` in `root` and waits for it under `limits`.
///
/// Returns an IO error only if the process could not be started.
pub(crate) async fn run_process(
    root: &Path,
    ceiling: &Path,
    argv: &[String],
    limits: &ExecLimits,
) -> std::io::Result<ProcessOutput> {
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"))?;

    let mut cmd = Command::new(program);
    if program == "git" {
        cmd.args(HARDENED_GIT_ARGS);
    }
    cmd.args(rest)
        .current_dir(root)
        .env_clear()
        .envs(sandbox_env(root, ceiling))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;

    let cap = limits.max_output_bytes;
    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(read_capped(out, cap)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(read_capped(err, cap)));

    let (exit_code, timed_out) = match tokio::time::timeout(limits.timeout, child.wait()).await {
        Ok(status) => (status?.code().unwrap_or(-1), false),
        Err(_) => {
            tracing::warn!(program = %program, timeout = ?limits.timeout, "command timed out");
            terminate(&mut child, limits.kill_grace).await;
            (-1, true)
        }
    };

    let stdout = collect(stdout_task, limits).await;
    let stderr = collect(stderr_task, limits).await;

    Ok(ProcessOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
    })
}

async fn collect(
    task: Option<tokio::task::JoinHandle<(Vec<u8>, usize)>>,
    limits: &ExecLimits,
) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    // A grandchild that escaped the process group can hold the pipe open.
    match tokio::time::timeout(limits.kill_grace, &mut task).await {
        Ok(Ok((bytes, total))) => render_output(&bytes, total, limits.max_output_bytes),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "output reader task failed");
            String::new()
        }
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

/// Resolves `target` under `root`, refusing anything whose canonical parent
/// lies outside the root.
fn resolve_inside(root: &Path, target: &str) -> Option<PathBuf> {
    let canonical_root = root.canonicalize().ok()?;
    let joined = root.join(target);
    let parent = joined.parent()?.canonicalize().ok()?;
    if !parent.starts_with(&canonical_root) {
        return None;
    }
    Some(parent.join(joined.file_name()?))
}

/// `cd` builtin. The working directory never changes; this only reports
/// whether the target is a directory inside the root.
pub(crate) fn change_directory(root: &Path, args: &[String]) -> ProcessOutput {
    let target = match args {
        [] => return ProcessOutput::builtin(0, String::new(), String::new()),
        [target] => target,
        _ => {
            return ProcessOutput::builtin(1, String::new(), "cd: too many arguments\n".to_string())
        }
    };

    let inside = root
        .canonicalize()
        .ok()
        .zip(root.join(target).canonicalize().ok())
        .is_some_and(|(root, dir)| dir.starts_with(&root) && dir.is_dir());

    if inside {
        ProcessOutput::builtin(0, String::new(), String::new())
    } else {
        ProcessOutput::builtin(
            1,
            String::new(),
            format!("cd: {}: No such file or directory\n", target),
        )
    }
}

/// `echo ... > file` builtin. Writes the echoed words plus a newline
/// (omitted for `-n`) to the redirect target.
pub(crate) fn write_echo(root: &Path, args: &[String], redirect: &Redirect) -> ProcessOutput {
    let (newline, words) = match args.split_first() {
        Some((flag, rest)) if flag == "-n" => (false, rest),
        _ => (true, args),
    };
    let mut text = words.join(" ");
    if newline {
        text.push('\n');
    }

    let fail = |msg: &str| {
        ProcessOutput::builtin(
            1,
            String::new(),
            format!("echo: {}: {}\n", redirect.target, msg),
        )
    };

    let Some(path) = resolve_inside(root, &redirect.target) else {
        return fail("No such file or directory");
    };
    if let Ok(meta) = std::fs::symlink_metadata(&path) {
        if meta.file_type().is_symlink() {
            return fail("refusing to write through a symbolic link");
        }
        if meta.is_dir() {
            return fail("Is a directory");
        }
    }

    let result = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(redirect.append)
        .truncate(!redirect.append)
        .open(&path)
        .and_then(|mut file| std::io::Write::write_all(&mut file, text.as_bytes()));

    match result {
        Ok(()) => ProcessOutput::builtin(0, String::new(), String::new()),
        Err(e) => fail(&e.to_string()),
    }
}
