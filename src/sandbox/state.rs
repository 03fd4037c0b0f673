//! Read-only snapshot of a sandbox repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::repo::GitRepo;

/// Number of commits included in a snapshot.
pub const MAX_SNAPSHOT_COMMITS: usize = 50;

const FIELD_SEP: char = '\x1f';
const RECORD_SEP: char = '\x1e';

/// One commit as seen in `git log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub hash: String,
    pub short_hash: String,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    /// Abbreviated parent hashes.
    pub parents: Vec<String>,
}

/// Working tree status.
///
/// `is_dirty` covers staged and unstaged changes to tracked files only;
/// untracked files are listed but do not make the tree dirty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingTreeStatus {
    pub is_dirty: bool,
    pub untracked_files: Vec<String>,
    pub unstaged_changes: Vec<String>,
    pub staged_changes: Vec<String>,
}

/// Repository state at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub branches: Vec<String>,
    /// Checked-out branch, or the short hash when `HEAD` is detached.
    pub current_branch: String,
    pub detached: bool,
    /// Most recent commits reachable from `HEAD`, newest first.
    pub commits: Vec<CommitRecord>,
    /// Number of commits reachable from `HEAD`, not capped.
    pub total_commits: usize,
    pub status: WorkingTreeStatus,
}

impl StateSnapshot {
    /// Captures the current state of `repo`.
    pub fn capture(repo: &GitRepo) -> Result<Self> {
        let branches = repo.branches()?;
        let has_commits = repo.head_commit()?.is_some();

        let (current_branch, detached) = match repo.symbolic_head()? {
            Some(name) => (name, false),
            None => {
                let short = repo.git(["rev-parse", "--short", "HEAD"])?;
                (short.trim().to_string(), true)
            }
        };

        let (commits, total_commits) = if has_commits {
            let total = repo.git(["rev-list", "--count", "HEAD"])?;
            let total = total
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::Git(format!("unexpected rev-list output: {}", total.trim())))?;
            (read_log(repo)?, total)
        } else {
            (Vec::new(), 0)
        };

        let status = read_status(repo)?;

        Ok(Self {
            branches,
            current_branch,
            detached,
            commits,
            total_commits,
            status,
        })
    }
}

fn read_log(repo: &GitRepo) -> Result<Vec<CommitRecord>> {
    let out = repo.git([
        "log",
        &format!("--max-count={}", MAX_SNAPSHOT_COMMITS),
        "--format=%H%x1f%h%x1f%an%x1f%at%x1f%p%x1f%B%x1e",
        "HEAD",
    ])?;

    out.split(RECORD_SEP)
        .map(str::trim_start)
        .filter(|r| !r.is_empty())
        .map(parse_commit)
        .collect()
}

fn parse_commit(record: &str) -> Result<CommitRecord> {
    let fields: Vec<&str> = record.splitn(6, FIELD_SEP).collect();
    let [hash, short_hash, author, timestamp, parents, message] = fields.as_slice() else {
        return Err(Error::Git(format!("unexpected log record: {:?}", record)));
    };

    let secs: i64 = timestamp
        .parse()
        .map_err(|_| Error::Git(format!("bad commit timestamp: {}", timestamp)))?;
    let timestamp = DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| Error::Git(format!("commit timestamp out of range: {}", secs)))?;

    Ok(CommitRecord {
        hash: hash.to_string(),
        short_hash: short_hash.to_string(),
        message: message.trim_end().to_string(),
        author: author.to_string(),
        timestamp,
        parents: parents.split_whitespace().map(String::from).collect(),
    })
}

fn read_status(repo: &GitRepo) -> Result<WorkingTreeStatus> {
    let out = repo.git(["status", "--porcelain=v1", "-z", "--untracked-files=all"])?;
    Ok(parse_porcelain(&out))
}

/// Parses `git status --porcelain=v1 -z` output.
fn parse_porcelain(out: &str) -> WorkingTreeStatus {
    let mut status = WorkingTreeStatus::default();
    let mut entries = out.split('\0').filter(|e| !e.is_empty());

    while let Some(entry) = entries.next() {
        let Some(path) = entry.get(3..) else {
            continue;
        };
        let mut codes = entry.chars();
        let index = codes.next().unwrap_or(' ');
        let worktree = codes.next().unwrap_or(' ');

        if index == '?' {
            status.untracked_files.push(path.to_string());
            continue;
        }
        if index == '!' {
            continue;
        }
        if index != ' ' {
            status.staged_changes.push(path.to_string());
        }
        if worktree != ' ' {
            status.unstaged_changes.push(path.to_string());
        }
        // Renames and copies carry the source path as a separate entry.
        if matches!(index, 'R' | 'C') {
            entries.next();
        }
    }

    status.is_dirty = !status.staged_changes.is_empty() || !status.unstaged_changes.is_empty();
    status
}
