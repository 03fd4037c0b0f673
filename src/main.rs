//! Git Quest sandbox CLI
//!
//! Creates one sandbox, reads commands from stdin, runs each through the
//! engine and optionally scores the result.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};

use gitquest_sandbox::{
    evaluate, EngineConfig, SandboxManager, StateDescriptor, SuccessCriteria, Validate,
};

struct Args {
    state: Option<PathBuf>,
    criteria: Option<PathBuf>,
    config: Option<PathBuf>,
    logs: PathBuf,
}

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} [--state <state.json>] [--criteria <criteria.json>] [--config <engine.toml>] [--logs <dir>]",
        program
    );
    eprintln!("\nReads one command per line from stdin and runs it in a fresh sandbox.");
    eprintln!("\nEnvironment variables:");
    eprintln!("  GITQUEST_BASE_DIR               Directory for sandbox roots");
    eprintln!("  GITQUEST_COMMAND_TIMEOUT_SECS   Per-command timeout (default: 30)");
    eprintln!("  GITQUEST_REAP_AGE_SECS          Reap age for abandoned sandboxes");
    std::process::exit(1);
}

fn parse_args() -> Args {
    let mut argv = std::env::args();
    let program = argv.next().unwrap_or_else(|| "gitquest-sandbox".to_string());

    let mut args = Args {
        state: None,
        criteria: None,
        config: None,
        logs: PathBuf::from(".gitquest/sessions"),
    };

    while let Some(flag) = argv.next() {
        let Some(value) = argv.next() else {
            usage(&program);
        };
        match flag.as_str() {
            "--state" => args.state = Some(PathBuf::from(value)),
            "--criteria" => args.criteria = Some(PathBuf::from(value)),
            "--config" => args.config = Some(PathBuf::from(value)),
            "--logs" => args.logs = PathBuf::from(value),
            _ => usage(&program),
        }
    }

    args
}

async fn run(args: Args) -> gitquest_sandbox::Result<bool> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    }
    .with_env_overrides()?;

    for warning in config.validate().into_result()? {
        tracing::warn!(warning = %warning, "engine config");
    }

    let descriptor = match &args.state {
        Some(path) => Some(StateDescriptor::from_json(&std::fs::read_to_string(path)?)?),
        None => None,
    };
    let criteria = match &args.criteria {
        Some(path) => Some(SuccessCriteria::from_json(&std::fs::read_to_string(path)?)?),
        None => None,
    };

    let manager = SandboxManager::new(config);
    let shared = manager.create_sandbox(descriptor.as_ref()).await?;
    let mut sandbox = shared.lock().await;
    let session_dir = args.logs.join(sandbox.id());

    tracing::info!(sandbox_id = %sandbox.id(), path = ?sandbox.root(), "sandbox ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = line.trim();
        if command.is_empty() {
            continue;
        }

        let output = sandbox.run(command).await?;
        println!("$ {}", command);
        if !output.stdout.is_empty() {
            print!("{}", output.stdout);
        }
        if !output.stderr.is_empty() {
            eprint!("{}", output.stderr);
        }
    }

    sandbox
        .transcript()
        .write_json(&session_dir.join("transcript.json"))?;

    let mut passed = true;
    if let Some(criteria) = &criteria {
        let result = evaluate(&sandbox, criteria)?;
        passed = result.success;

        println!("\n{}", "=".repeat(60));
        println!(
            "Result: {} ({}/{} criteria met)",
            if result.success { "PASS" } else { "FAIL" },
            result.met(),
            result.total()
        );
        println!("{}", "=".repeat(60));
        for item in &result.satisfied {
            println!("  [x] {}", item);
        }
        for item in &result.unsatisfied {
            println!("  [ ] {}", item);
        }

        let json = serde_json::to_string_pretty(&result)
            .map_err(|e| gitquest_sandbox::Error::State(format!("failed to serialize result: {}", e)))?;
        std::fs::write(session_dir.join("evaluation.json"), json)?;
    }

    println!("\nLogs: {}", session_dir.display());

    drop(sandbox);
    let cleaned = manager.cleanup_all().await?;
    tracing::info!(count = cleaned, "cleaned up sandboxes");

    Ok(passed)
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args();

    match run(args).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("gitquest-sandbox failed: {}", e);
            std::process::exit(1);
        }
    }
}
