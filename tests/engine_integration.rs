//! End-to-end tests for the sandbox engine.
//!
//! Each test uses its own temp base directory and real git repositories.

use std::time::Duration;

use tempfile::TempDir;

use gitquest_sandbox::policy::REJECTION_MARKER;
use gitquest_sandbox::{
    evaluate, CommandOutcome, CommandPolicy, EngineConfig, SandboxManager, StateDescriptor,
    SuccessCriteria,
};

fn manager(base: &TempDir) -> SandboxManager {
    SandboxManager::new(EngineConfig::default().with_base_dir(base.path()))
}

fn project_descriptor() -> StateDescriptor {
    StateDescriptor::from_json(
        r##"{
            "commits": [
                {
                    "id": "c1",
                    "message": "Initial commit",
                    "branch": "main",
                    "parents": [],
                    "files": {"README.md": "# Project"}
                }
            ],
            "branches": ["main"],
            "current_branch": "main"
        }"##,
    )
    .expect("descriptor should parse")
}

#[tokio::test]
async fn stage_and_commit_scenario_passes() {
    let base = TempDir::new().unwrap();
    let manager = manager(&base);
    let shared = manager
        .create_sandbox(Some(&project_descriptor()))
        .await
        .unwrap();
    let mut sandbox = shared.lock().await;

    for command in [
        "echo test > test.txt",
        "git add test.txt",
        "git commit -m 'Add test file'",
    ] {
        let out = sandbox.run(command).await.unwrap();
        assert!(out.success, "{} failed: {}", command, out.stderr);
    }

    let criteria = SuccessCriteria::from_json(
        r#"{"required_commands": ["git add", "git commit"], "min_commits": 2, "clean_working_directory": true}"#,
    )
    .unwrap();
    let result = evaluate(&sandbox, &criteria).unwrap();

    assert!(result.success, "unsatisfied: {:?}", result.unsatisfied);
    assert!(result.unsatisfied.is_empty());
    assert_eq!(result.met(), result.total());
    assert_eq!(result.total(), criteria.predicate_count());

    let state = sandbox.current_state().unwrap();
    let messages: Vec<&str> = state.commits.iter().map(|c| c.message.as_str()).collect();
    assert_eq!(messages, vec!["Add test file", "Initial commit"]);
    assert_eq!(sandbox.transcript().len(), 3);
}

#[tokio::test]
async fn destructive_command_is_rejected_without_side_effects() {
    let base = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    std::fs::write(outside.path().join("keep.txt"), "keep").unwrap();

    let manager = manager(&base);
    let shared = manager
        .create_sandbox(Some(&project_descriptor()))
        .await
        .unwrap();
    let mut sandbox = shared.lock().await;

    let out = sandbox.run("rm -rf /").await.unwrap();

    assert!(!out.success);
    assert_eq!(out.stdout, "");
    assert!(out.stderr.contains(REJECTION_MARKER));
    assert!(matches!(out.outcome, CommandOutcome::Rejected { .. }));

    assert!(outside.path().join("keep.txt").exists());
    assert!(sandbox.root().join("README.md").exists());
    assert!(!sandbox.transcript().entries()[0].accepted);

    let criteria = SuccessCriteria {
        required_commands: vec!["rm -rf".to_string()],
        ..Default::default()
    };
    assert!(!evaluate(&sandbox, &criteria).unwrap().success);
}

#[tokio::test]
async fn manager_counts_remaining_sandboxes() {
    let base = TempDir::new().unwrap();
    let manager = manager(&base);

    let first = manager.create_sandbox(None).await.unwrap();
    manager.create_sandbox(None).await.unwrap();
    manager.create_sandbox(None).await.unwrap();

    let first_id = first.lock().await.id().to_string();
    assert!(manager.cleanup_sandbox(&first_id).await.unwrap());

    assert_eq!(manager.cleanup_all().await.unwrap(), 2);
    assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn synthesized_history_round_trips() {
    let base = TempDir::new().unwrap();
    let manager = manager(&base);

    let mut descriptor = StateDescriptor::default().with_current_branch("main");
    for i in 1..=7 {
        let mut commit = gitquest_sandbox::CommitSpec::new(
            format!("c{}", i),
            format!("Step {}", i),
            "main",
        )
        .with_file(format!("step{}.txt", i), format!("{}\n", i));
        if i > 1 {
            commit = commit.with_parent(format!("c{}", i - 1));
        }
        descriptor = descriptor.with_commit(commit);
    }

    let shared = manager.create_sandbox(Some(&descriptor)).await.unwrap();
    let sandbox = shared.lock().await;
    let state = sandbox.current_state().unwrap();

    let messages: Vec<String> = state.commits.iter().map(|c| c.message.clone()).collect();
    let expected: Vec<String> = (1..=7).rev().map(|i| format!("Step {}", i)).collect();
    assert_eq!(messages, expected);
    assert_eq!(state.current_branch, "main");
}

#[tokio::test]
async fn branch_graph_is_visible_to_learner_commands() {
    let base = TempDir::new().unwrap();
    let manager = manager(&base);
    let descriptor = StateDescriptor::from_json(
        r#"{
            "commits": [
                {"id": "c1", "message": "Initial", "files": {"app.txt": "v1\n"}},
                {"id": "c2", "message": "Feature", "branch": "feature", "parents": ["c1"],
                 "files": {"feature.txt": "new\n"}}
            ],
            "branches": ["main", "feature", "release"],
            "current_branch": "main"
        }"#,
    )
    .unwrap();

    let shared = manager.create_sandbox(Some(&descriptor)).await.unwrap();
    let mut sandbox = shared.lock().await;

    let out = sandbox.run("git merge feature").await.unwrap();
    assert!(out.success, "{}", out.stderr);
    assert!(sandbox.root().join("feature.txt").exists());

    let state = sandbox.current_state().unwrap();
    assert_eq!(state.branches, vec!["feature", "main", "release"]);

    let criteria = SuccessCriteria {
        required_commands: vec!["git merge".to_string()],
        min_commits: Some(2),
        required_branches: vec!["feature".to_string(), "hotfix".to_string()],
        ..Default::default()
    };
    let result = evaluate(&sandbox, &criteria).unwrap();
    assert!(!result.success);
    assert_eq!((result.met(), result.total()), (3, 4));
    assert_eq!(result.unsatisfied, vec!["Missing branch: hotfix"]);
}

#[tokio::test]
async fn long_running_command_times_out_and_is_recorded() {
    let base = TempDir::new().unwrap();
    let manager = manager(&base);
    let shared = manager
        .create_sandbox(Some(&project_descriptor()))
        .await
        .unwrap();
    let mut sandbox = shared.lock().await;

    let started = std::time::Instant::now();
    let out = sandbox
        .execute("tail -f README.md", Duration::from_millis(500))
        .await
        .unwrap();

    assert!(out.is_timed_out());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(sandbox.transcript().len(), 1);

    let after = sandbox.run("git status").await.unwrap();
    assert!(after.success);
}

#[tokio::test]
async fn cleanup_twice_leaves_no_trace() {
    let base = TempDir::new().unwrap();
    let manager = manager(&base);
    let shared = manager.create_sandbox(None).await.unwrap();

    let root = {
        let mut sandbox = shared.lock().await;
        let root = sandbox.root().to_path_buf();
        sandbox.cleanup().unwrap();
        sandbox.cleanup().unwrap();
        root
    };

    assert!(!root.exists());
    let id = root.file_name().unwrap().to_string_lossy().into_owned();
    assert!(manager.cleanup_sandbox(&id).await.unwrap());
    assert!(manager.get_sandbox(&id).is_none());
}

#[test]
fn blocked_sequences_reject_any_prefix() {
    let policy = CommandPolicy::new();
    for command in [
        "git status; rm -rf /",
        "git log | head",
        "git add . && git commit -m x",
        "git status || true",
        "echo `whoami`",
        "echo $(whoami)",
        "git fetch --upload-pack=evil origin",
        "git clone ext::sh",
        "cat < /etc/passwd",
    ] {
        assert!(!policy.classify(command).is_allowed(), "{}", command);
    }
}

#[test]
fn allow_listed_commands_are_accepted() {
    let policy = CommandPolicy::new();
    for command in ["git status", "git log", "git --version", "ls", "pwd", "git"] {
        assert!(policy.classify(command).is_allowed(), "{}", command);
    }
    for command in ["git filter-branch", "python x.py", "curl http://x", "sh"] {
        assert!(!policy.classify(command).is_allowed(), "{}", command);
    }
}
