//! Command policy for learner-submitted commands.
//!
//! Classification runs as a fixed sequence of stages, each of which can only
//! narrow what is accepted:
//!
//! 1. [`Stage::Scan`] rejects shell metacharacters and git transport escape
//!    hatches anywhere in the raw string, and splits off the single supported
//!    redirection shape (`echo ... > file`).
//! 2. [`Stage::Split`] tokenizes with shell quoting rules.
//! 3. [`Stage::Base`] checks the base command against the allow-lists.
//! 4. [`Stage::Subcommand`] checks the git subcommand or tool-level flag.
//! 5. [`Stage::Arguments`] confines path arguments to the sandbox root and
//!    applies per-command argument rules.
//!
//! Every accepted command maps to exactly one [`CommandShape`].

use serde::{Deserialize, Serialize};

/// Prefix placed on stderr when a command is rejected.
pub const REJECTION_MARKER: &str = "Command not allowed";

/// Git subcommands a learner may run.
pub const ALLOWED_GIT_SUBCOMMANDS: &[&str] = &[
    "init",
    "status",
    "add",
    "commit",
    "log",
    "diff",
    "show",
    "branch",
    "checkout",
    "switch",
    "merge",
    "rebase",
    "reset",
    "restore",
    "revert",
    "tag",
    "stash",
    "fetch",
    "pull",
    "push",
    "clone",
    "remote",
    "reflog",
    "cherry-pick",
    "bisect",
    "config",
    "mv",
    "rm",
    "clean",
    "blame",
    "grep",
    "describe",
    "worktree",
    "submodule",
    "ls-files",
    "ls-tree",
    "cat-file",
    "rev-parse",
    "shortlog",
    "whatchanged",
    "for-each-ref",
];

/// Tool-level git flags accepted in place of a subcommand.
pub const GIT_TOOL_FLAGS: &[&str] = &["--version", "--help", "-h", "-v"];

/// Shell utilities a learner may run.
pub const ALLOWED_UTILITIES: &[&str] = &[
    "pwd", "ls", "cd", "cat", "echo", "mkdir", "touch", "rm", "cp", "mv", "find", "tree", "head",
    "tail", "wc", "grep",
];

/// Sequences rejected anywhere in the raw command.
///
/// `>` is handled separately by the redirection split.
pub const BLOCKED_SEQUENCES: &[&str] = &[
    "|",
    ";",
    "&",
    "`",
    "$",
    "<",
    "--exec",
    "--upload-pack",
    "--receive-pack",
    "ext::",
    "fd::",
];

/// Utilities that create, modify or delete files.
const MUTATING_UTILITIES: &[&str] = &["mkdir", "touch", "rm", "cp", "mv"];

/// `find` primaries that run programs or write files.
const FIND_ACTION_FLAGS: &[&str] = &[
    "-exec", "-execdir", "-ok", "-okdir", "-delete", "-fprint", "-fprint0", "-fprintf", "-fls",
];

/// Config sections `git config` may read or write. Everything else (aliases,
/// core, filters, diff and merge drivers, includes, credentials, urls) can
/// make git run programs or reach the network.
const GIT_CONFIG_SECTIONS: &[&str] = &[
    "user", "color", "init", "advice", "branch", "push", "pull", "log", "status", "rebase", "tag",
    "grep",
];

/// Long git options whose value names a program to run. Git accepts any
/// unambiguous abbreviation, so every prefix of these is rejected.
const GIT_PROGRAM_OPTIONS: &[&str] = &[
    "exec",
    "upload-pack",
    "receive-pack",
    "open-files-in-pager",
];

/// Short flags that run a program, per subcommand, with the short flags of
/// that subcommand which take the rest of a cluster as their value.
const GIT_PROGRAM_SHORT_FLAGS: &[(&str, char, &str)] = &[
    ("rebase", 'x', "sXC"),
    ("grep", 'O', "efABCm"),
    ("clone", 'u', "obcj"),
];

/// `git config` scopes that would write outside the repository.
const GIT_CONFIG_SCOPES: &[&str] = &["system", "global", "file"];

/// The policy stage that produced a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scan,
    Split,
    Base,
    Subcommand,
    Arguments,
}

/// Why a command was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Stage that rejected the command.
    pub stage: Stage,
    /// Human-readable reason, safe to show to the learner.
    pub reason: String,
}

impl Rejection {
    fn new(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }

    /// Text written to stderr for a rejected command.
    pub fn stderr_message(&self) -> String {
        format!("{}: {}", REJECTION_MARKER, self.reason)
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

/// The documented shapes of an accepted command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandShape {
    /// `git` with no arguments.
    GitBare,
    /// `git --version`, `git --help` and friends.
    GitFlag { flag: String },
    /// `git <subcommand> ...`.
    Git { subcommand: String },
    /// An allow-listed shell utility.
    Utility { name: String },
    /// `echo ... > file` or `echo ... >> file`.
    Write { append: bool },
}

/// Output redirection attached to an `echo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    /// Target path relative to the sandbox root.
    pub target: String,
    /// `>>` rather than `>`.
    pub append: bool,
}

/// A command that passed every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Which documented shape the command has.
    pub shape: CommandShape,
    /// Argument vector, already unquoted. Never contains the redirection.
    pub argv: Vec<String>,
    /// Present only for [`CommandShape::Write`].
    pub redirect: Option<Redirect>,
}

impl ParsedCommand {
    /// The base command (`git`, `ls`, ...).
    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    /// Arguments after the base command.
    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }
}

/// Outcome of classifying a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed(ParsedCommand),
    Rejected(Rejection),
}

impl Verdict {
    /// Returns true if the command may run.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed(_))
    }
}

/// Allow-list based classifier for raw command lines.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    git_subcommands: &'static [&'static str],
    git_flags: &'static [&'static str],
    utilities: &'static [&'static str],
    blocked_sequences: &'static [&'static str],
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandPolicy {
    /// Creates a policy with the standard allow-lists.
    pub fn new() -> Self {
        Self {
            git_subcommands: ALLOWED_GIT_SUBCOMMANDS,
            git_flags: GIT_TOOL_FLAGS,
            utilities: ALLOWED_UTILITIES,
            blocked_sequences: BLOCKED_SEQUENCES,
        }
    }

    /// Decides whether `command` may run. Never spawns anything.
    pub fn classify(&self, command: &str) -> Verdict {
        match self.parse(command) {
            Ok(parsed) => Verdict::Allowed(parsed),
            Err(rejection) => Verdict::Rejected(rejection),
        }
    }

    fn parse(&self, command: &str) -> Result<ParsedCommand, Rejection> {
        let raw = command.trim();
        if raw.is_empty() {
            return Err(Rejection::new(Stage::Scan, "empty command"));
        }
        if raw.chars().any(char::is_control) {
            return Err(Rejection::new(
                Stage::Scan,
                "control characters are not allowed",
            ));
        }
        if let Some(seq) = self.blocked_sequences.iter().find(|s| raw.contains(*s)) {
            return Err(Rejection::new(
                Stage::Scan,
                format!("command contains blocked pattern: {}", seq),
            ));
        }
        let (body, redirect) = split_redirect(raw)?;

        let argv = shell_words::split(body)
            .map_err(|_| Rejection::new(Stage::Split, "malformed command (unbalanced quotes)"))?;
        let Some(base) = argv.first() else {
            return Err(Rejection::new(Stage::Split, "empty command"));
        };

        let shape = if base == "git" {
            self.classify_git(&argv)?
        } else if self.utilities.contains(&base.as_str()) {
            CommandShape::Utility { name: base.clone() }
        } else {
            return Err(Rejection::new(
                Stage::Base,
                format!("command not allowed: {}", base),
            ));
        };

        check_arguments(&shape, &argv)?;

        let shape = match &redirect {
            Some(r) => {
                if base != "echo" {
                    return Err(Rejection::new(
                        Stage::Scan,
                        "output redirection is only supported for echo",
                    ));
                }
                check_path(&r.target, true)?;
                CommandShape::Write { append: r.append }
            }
            None => shape,
        };

        Ok(ParsedCommand {
            shape,
            argv,
            redirect,
        })
    }

    fn classify_git(&self, argv: &[String]) -> Result<CommandShape, Rejection> {
        let Some(second) = argv.get(1) else {
            return Ok(CommandShape::GitBare);
        };

        if second.starts_with('-') {
            if self.git_flags.contains(&second.as_str())
                || self.git_subcommands.contains(&strip_option(second))
            {
                return Ok(CommandShape::GitFlag {
                    flag: second.clone(),
                });
            }
            return Err(Rejection::new(
                Stage::Subcommand,
                format!("git option not allowed: {}", second),
            ));
        }

        let subcommand = strip_option(second);
        if !self.git_subcommands.contains(&subcommand) {
            return Err(Rejection::new(
                Stage::Subcommand,
                format!("git subcommand not allowed: {}", subcommand),
            ));
        }

        check_git_subcommand(subcommand, &argv[2..])?;

        Ok(CommandShape::Git {
            subcommand: subcommand.to_string(),
        })
    }
}

/// Strips leading dashes and any `=value` suffix.
fn strip_option(token: &str) -> &str {
    token
        .trim_start_matches('-')
        .split('=')
        .next()
        .unwrap_or_default()
}

/// Splits `echo ... > file` into the echo part and the redirect.
///
/// The operator must be its own whitespace-separated token, appear exactly
/// once, and be followed by exactly one plain file name.
fn split_redirect(raw: &str) -> Result<(&str, Option<Redirect>), Rejection> {
    let Some(op_start) = raw.find('>') else {
        return Ok((raw, None));
    };

    let tokens: Vec<&str> = raw.split_whitespace().collect();
    let positions: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| t.contains('>'))
        .map(|(i, _)| i)
        .collect();

    let reject = |reason: &str| Err(Rejection::new(Stage::Scan, reason));

    if positions.len() != 1 {
        return reject("redirection is only allowed once, as `echo <text> > <file>`");
    }
    let pos = positions[0];
    let append = match tokens[pos] {
        ">" => false,
        ">>" => true,
        _ => return reject("redirection operator must stand alone"),
    };
    if pos + 2 != tokens.len() {
        return reject("redirection must be followed by exactly one file name");
    }
    let target = tokens[pos + 1];
    if !target
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
    {
        return reject("redirection target must be a plain file name");
    }

    Ok((
        raw[..op_start].trim_end(),
        Some(Redirect {
            target: target.to_string(),
            append,
        }),
    ))
}

/// Rejects paths that leave the sandbox root, and optionally paths into `.git`.
fn check_path(path: &str, forbid_git_dir: bool) -> Result<(), Rejection> {
    if path.starts_with('/') || path.starts_with('~') || path.split('/').any(|c| c == "..") {
        return Err(Rejection::new(
            Stage::Arguments,
            format!("path outside the repository: {}", path),
        ));
    }
    if forbid_git_dir
        && path
            .split('/')
            .find(|c| !c.is_empty() && *c != ".")
            .is_some_and(|first| first == ".git")
    {
        return Err(Rejection::new(
            Stage::Arguments,
            format!("modifying the .git directory is not allowed: {}", path),
        ));
    }
    Ok(())
}

fn check_arguments(shape: &CommandShape, argv: &[String]) -> Result<(), Rejection> {
    let mutating = matches!(shape, CommandShape::Utility { name } if MUTATING_UTILITIES.contains(&name.as_str()));

    for arg in &argv[1..] {
        check_path(arg, mutating && !arg.starts_with('-'))?;
        if arg.starts_with('-') {
            if let Some((_, value)) = arg.split_once('=') {
                check_path(value, false)?;
            }
        }
    }

    if let CommandShape::Utility { name } = shape {
        if name == "find" {
            if let Some(flag) = argv[1..]
                .iter()
                .find(|a| FIND_ACTION_FLAGS.contains(&a.as_str()))
            {
                return Err(Rejection::new(
                    Stage::Arguments,
                    format!("find action not allowed: {}", flag),
                ));
            }
        }
    }

    Ok(())
}

/// Returns true if `token` is `--name` or `--name=value` and `name` is a
/// prefix of one of `options`.
fn abbreviates_any(token: &str, options: &[&str]) -> bool {
    let Some(rest) = token.strip_prefix("--") else {
        return false;
    };
    let name = strip_value(rest);
    !name.is_empty() && options.iter().any(|o| o.starts_with(name))
}

/// Returns true if the short-flag cluster `token` (`-ix`, `-Ovim`) sets
/// `flag`. Scanning stops at the first flag in `takes_value`.
fn cluster_sets(token: &str, flag: char, takes_value: &str) -> bool {
    let Some(cluster) = token.strip_prefix('-') else {
        return false;
    };
    if cluster.starts_with('-') {
        return false;
    }
    for c in cluster.chars() {
        if c == flag {
            return true;
        }
        if takes_value.contains(c) {
            return false;
        }
    }
    false
}

/// Argument rules for subcommands that can run arbitrary programs.
fn check_git_subcommand(subcommand: &str, args: &[String]) -> Result<(), Rejection> {
    let forbid = |what: &str| {
        Err(Rejection::new(
            Stage::Arguments,
            format!("git {} {} is not allowed", subcommand, what),
        ))
    };

    if let Some(arg) = args.iter().find(|a| abbreviates_any(a, GIT_PROGRAM_OPTIONS)) {
        return forbid(strip_value(arg));
    }
    for (name, flag, takes_value) in GIT_PROGRAM_SHORT_FLAGS {
        if *name == subcommand && args.iter().any(|a| cluster_sets(a, *flag, takes_value)) {
            return forbid(format!("-{}", flag).as_str());
        }
    }

    match subcommand {
        "bisect" if args.first().is_some_and(|a| a == "run") => forbid("run"),
        "submodule" if args.iter().any(|a| a == "foreach") => forbid("foreach"),
        "config" => {
            if let Some(flag) = args
                .iter()
                .find(|a| abbreviates_any(a, GIT_CONFIG_SCOPES) || cluster_sets(a, 'f', ""))
            {
                return forbid(strip_value(flag));
            }
            match args.iter().find(|a| !a.starts_with('-')) {
                Some(key) => {
                    let section = key.split('.').next().unwrap_or_default().to_lowercase();
                    if GIT_CONFIG_SECTIONS.contains(&section.as_str()) {
                        Ok(())
                    } else {
                        forbid(format!("for section '{}'", section).as_str())
                    }
                }
                None => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

fn strip_value(token: &str) -> &str {
    token.split('=').next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(command: &str) -> ParsedCommand {
        match CommandPolicy::new().classify(command) {
            Verdict::Allowed(parsed) => parsed,
            Verdict::Rejected(r) => panic!("expected '{}' to be allowed, got: {}", command, r),
        }
    }

    fn rejected(command: &str) -> Rejection {
        match CommandPolicy::new().classify(command) {
            Verdict::Rejected(r) => r,
            Verdict::Allowed(p) => panic!("expected '{}' to be rejected, got {:?}", command, p),
        }
    }

    #[test]
    fn every_git_subcommand_alone_is_allowed() {
        for sub in ALLOWED_GIT_SUBCOMMANDS {
            let parsed = allowed(&format!("git {}", sub));
            assert_eq!(
                parsed.shape,
                CommandShape::Git {
                    subcommand: sub.to_string()
                }
            );
        }
    }

    #[test]
    fn every_utility_alone_is_allowed() {
        for util in ALLOWED_UTILITIES {
            let parsed = allowed(util);
            assert_eq!(
                parsed.shape,
                CommandShape::Utility {
                    name: util.to_string()
                }
            );
        }
    }

    #[test]
    fn blocked_sequences_are_rejected_after_any_allowed_prefix() {
        let prefixes = ["git status", "git log", "ls", "echo hi"];
        let suffixes = [
            "; rm -rf /",
            " | cat",
            " && ls",
            " || ls",
            " `whoami`",
            " $(whoami)",
            " $HOME",
            " < file",
            " &",
            " --exec=sh",
            " --upload-pack=x",
            " --receive-pack=x",
            " ext::sh",
            " fd::3",
        ];
        for prefix in prefixes {
            for suffix in suffixes {
                let command = format!("{}{}", prefix, suffix);
                let r = rejected(&command);
                assert_eq!(r.stage, Stage::Scan, "{}", command);
            }
        }
    }

    #[test]
    fn semicolon_chain_is_rejected() {
        let r = rejected("git status; rm -rf /");
        assert!(r.reason.contains(";"));
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert_eq!(rejected("git filter-branch").stage, Stage::Subcommand);
        assert_eq!(rejected("python x.py").stage, Stage::Base);
        assert_eq!(rejected("sh -c ls").stage, Stage::Base);
        assert_eq!(rejected("/bin/ls").stage, Stage::Base);
    }

    #[test]
    fn root_escaping_paths_are_rejected() {
        let r = rejected("rm -rf /");
        assert_eq!(r.stage, Stage::Arguments);
        assert!(r.stderr_message().starts_with(REJECTION_MARKER));

        rejected("cat /etc/passwd");
        rejected("ls ../");
        rejected("cp notes.txt ~/notes.txt");
        rejected("git log --output=/tmp/log.txt");
        rejected("git add ../outside.txt");
    }

    #[test]
    fn mutating_utilities_cannot_touch_git_dir() {
        rejected("rm -rf .git");
        rejected("touch ./.git/hooks/pre-commit");
        rejected("mv .git/HEAD x");
        allowed("cat .git/HEAD");
        allowed("ls .git");
    }

    #[test]
    fn git_tool_flags() {
        assert_eq!(
            allowed("git --version").shape,
            CommandShape::GitFlag {
                flag: "--version".to_string()
            }
        );
        allowed("git --help");
        allowed("git -h");
        assert_eq!(allowed("git").shape, CommandShape::GitBare);
        assert_eq!(rejected("git --git-dir=x status").stage, Stage::Subcommand);
        assert_eq!(rejected("git -C sub status").stage, Stage::Subcommand);
        assert_eq!(rejected("git -c core.pager=less log").stage, Stage::Subcommand);
    }

    #[test]
    fn quoted_arguments_are_unquoted() {
        let parsed = allowed("git commit -m 'Add test file'");
        assert_eq!(parsed.argv, vec!["git", "commit", "-m", "Add test file"]);
        assert_eq!(parsed.program(), "git");
        assert_eq!(parsed.args().len(), 3);
    }

    #[test]
    fn unbalanced_quotes_are_rejected() {
        assert_eq!(rejected("git commit -m 'oops").stage, Stage::Split);
    }

    #[test]
    fn echo_redirect_is_the_only_write_shape() {
        let parsed = allowed("echo test > test.txt");
        assert_eq!(parsed.shape, CommandShape::Write { append: false });
        assert_eq!(parsed.argv, vec!["echo", "test"]);
        assert_eq!(
            parsed.redirect,
            Some(Redirect {
                target: "test.txt".to_string(),
                append: false
            })
        );

        let parsed = allowed("echo 'more text' >> notes/log.md");
        assert_eq!(parsed.shape, CommandShape::Write { append: true });
        assert_eq!(parsed.argv, vec!["echo", "more text"]);

        rejected("cat a > b");
        rejected("git log > log.txt");
        rejected("echo a>b");
        rejected("echo a > b c");
        rejected("echo a > b > c");
        rejected("echo a > /etc/passwd");
        rejected("echo a > ../escape");
        rejected("echo a > .git/config");
        rejected("echo a > 'b'");
        rejected("> file");
    }

    #[test]
    fn program_running_arguments_are_rejected() {
        rejected("git bisect run make");
        rejected("git submodule foreach ls");
        rejected("git rebase -x make main");
        rejected("git grep -Ovim pattern");
        rejected("find . -exec cat {} +");
        rejected("find . -delete");
        allowed("git bisect start");
        allowed("find . -name '*.md'");
    }

    #[test]
    fn abbreviated_program_options_are_rejected() {
        for command in [
            "git rebase --exe='touch owned' HEAD~1",
            "git rebase --ex=make HEAD~1",
            "git push --e=sh origin main",
            "git fetch --upload=sh origin",
            "git push --rec=sh origin",
            "git grep --open=touch one",
            "git grep --op pattern",
        ] {
            assert_eq!(rejected(command).stage, Stage::Arguments, "{}", command);
        }
        allowed("git rebase --continue");
        allowed("git fetch --prune origin");
        allowed("git push --recurse-submodules=check origin main");
        allowed("git grep --only-matching pattern");
    }

    #[test]
    fn clustered_program_flags_are_rejected() {
        for command in [
            "git rebase -ix'touch owned' HEAD~1",
            "git rebase -ixmake HEAD~1",
            "git grep -iO pattern",
            "git grep -nOvim pattern",
            "git clone -qu sh repo",
        ] {
            assert_eq!(rejected(command).stage, Stage::Arguments, "{}", command);
        }
        allowed("git rebase -i HEAD~2");
        allowed("git rebase -Xtheirs main");
        allowed("git grep -e Oops");
        allowed("git grep -eOops");
        allowed("git grep -in pattern");
    }

    #[test]
    fn git_config_is_limited_to_safe_sections() {
        allowed("git config user.name 'Ada Lovelace'");
        allowed("git config --list");
        allowed("git config color.ui auto");
        rejected("git config alias.st status");
        rejected("git config core.fsmonitor evil");
        rejected("git config filter.x.clean cat");
        rejected("git config --global user.name Ada");
    }

    #[test]
    fn git_config_scope_abbreviations_are_rejected() {
        for command in [
            "git config --sys user.name Evil",
            "git config --glo user.name Evil",
            "git config --g user.name Evil",
            "git config --fil=other.cfg user.name Evil",
            "git config -f other.cfg user.name Evil",
            "git config -lf other.cfg",
        ] {
            assert_eq!(rejected(command).stage, Stage::Arguments, "{}", command);
        }
        allowed("git config --local user.name Ada");
        allowed("git config --get user.name");
        allowed("git config --list --show-origin");
    }

    #[test]
    fn control_characters_and_empty_commands_are_rejected() {
        rejected("git status\nrm -rf /");
        rejected("");
        rejected("   ");
    }

    #[test]
    fn shapes_serialize_with_kind_tag() {
        let json = serde_json::to_string(&CommandShape::Git {
            subcommand: "log".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"git","subcommand":"log"}"#);
    }
}
