//! tako - dependency-aware multi-repository orchestrator.

mod output;

use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use tako_core::ErrorCode;
use tako_engine::workflow::ExecOptions;
use tako_engine::{EngineError, GraphRunner, Resolver, RunnerConfig};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Exit code for user-facing failures (workflow or validation).
const EXIT_FAILURE: i32 = 1;
/// Exit code for misconfiguration (unknown workflow, bad flags).
const EXIT_MISCONFIGURATION: i32 = 2;

#[derive(Parser)]
#[command(name = "tako")]
#[command(about = "Dependency-aware multi-repository workflow orchestrator")]
#[command(version)]
struct Cli {
    /// Root repository directory (default: current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Root repository reference (owner/name[:ref]) resolved via the cache
    #[arg(long, global = true)]
    repo: Option<String>,

    /// Repository cache directory (default: ~/.cache/tako)
    #[arg(long, global = true, env = "TAKO_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Never touch the network; cached checkouts must already exist
    #[arg(long, global = true)]
    local: bool,

    /// Restrict execution to these repositories and their descendants
    #[arg(long, global = true, value_delimiter = ',')]
    only: Vec<String>,

    /// Exclude these repositories and their descendants
    #[arg(long, global = true, value_delimiter = ',')]
    ignore: Vec<String>,

    /// Execute repositories one at a time instead of level-parallel
    #[arg(long, global = true)]
    serial: bool,

    /// Log what would run without executing anything
    #[arg(long, global = true)]
    dry_run: bool,

    /// Record failures and keep going through independent branches
    #[arg(long, global = true)]
    continue_on_error: bool,

    /// Print a failure table at the end of the run
    #[arg(long, global = true)]
    summarize_errors: bool,

    /// Keep child workspaces on disk after the run
    #[arg(long, global = true)]
    preserve_tmp: bool,

    /// Pause for inspection between steps
    #[arg(long, global = true)]
    debug: bool,

    /// Cap on concurrently executing repositories (0 = unbounded)
    #[arg(long, global = true)]
    max_concurrent_repos: Option<usize>,

    /// Use a throwaway cache for this invocation
    #[arg(long, global = true)]
    no_cache: bool,

    /// Workflow input as name=value (repeatable)
    #[arg(long = "inputs", global = true, value_parser = parse_input)]
    inputs: Vec<(String, String)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the dependents graph of the root repository
    Graph,

    /// Run an ad-hoc shell command across the graph in dependency order
    Run {
        /// The shell command to execute in each repository
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Execute a workflow in the root repository and propagate
    Exec {
        /// Workflow name (omit when resuming)
        workflow: Option<String>,

        /// Resume a previously failed run by id. Completed steps keep
        /// their captured outputs; the failed step and everything after
        /// re-run.
        #[arg(long)]
        resume: Option<String>,
    },

    /// Load and validate the reachable manifests
    Validate,

    /// Repository cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Remove every cached checkout
    Clean,
    /// Remove cached checkouts older than the threshold
    Prune {
        /// Age threshold in days
        #[arg(long, default_value_t = 30)]
        max_age_days: u64,
    },
}

fn parse_input(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("`{raw}` is not name=value")),
    }
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TAKO_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let exit_code = runtime.block_on(run(cli));
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> i32 {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received interrupt, cancelling");
                cancel.cancel();
            }
        });
    }

    match dispatch(cli, cancel).await {
        Ok(code) => code,
        Err(e) => {
            let code = e.code();
            output::print_error(code, &e.to_string());
            match code {
                ErrorCode::WorkflowNotFound | ErrorCode::FilterNotFound => EXIT_MISCONFIGURATION,
                _ => EXIT_FAILURE,
            }
        }
    }
}

async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<i32, EngineError> {
    let config = build_config(&cli)?;
    let runner = GraphRunner::new(config, cancel);

    match cli.command {
        Command::Graph => {
            let graph = runner.build_graph()?;
            print!("{}", graph.render());
            Ok(0)
        }
        Command::Run { command } => {
            let command = command.join(" ");
            let report = runner.run_command(&command).await?;
            output::print_report(&report, cli.summarize_errors);
            Ok(if report.ok() { 0 } else { EXIT_FAILURE })
        }
        Command::Exec { workflow, resume } => {
            let report = match (workflow, resume) {
                (_, Some(run_id)) => runner.resume_run(&run_id).await?,
                (Some(workflow), None) => {
                    let inputs: IndexMap<String, String> = cli.inputs.into_iter().collect();
                    runner.exec_workflow(&workflow, &inputs).await?
                }
                (None, None) => {
                    output::print_error(
                        ErrorCode::WorkflowNotFound,
                        "exec requires a workflow name or --resume <run-id>",
                    );
                    return Ok(EXIT_MISCONFIGURATION);
                }
            };
            output::print_report(&report, cli.summarize_errors);
            Ok(if report.ok() { 0 } else { EXIT_FAILURE })
        }
        Command::Validate => {
            runner.validate()?;
            println!("OK");
            Ok(0)
        }
        Command::Cache { command } => match command {
            CacheCommand::Clean => {
                let removed = runner.cache_clean()?;
                println!("removed {removed} cached checkouts");
                Ok(0)
            }
            CacheCommand::Prune { max_age_days } => {
                let removed = runner
                    .cache_prune(Duration::from_secs(max_age_days * 24 * 60 * 60))?;
                println!("pruned {removed} cached checkouts");
                Ok(0)
            }
        },
    }
}

fn build_config(cli: &Cli) -> Result<RunnerConfig, EngineError> {
    let cache_root = if cli.no_cache {
        std::env::temp_dir().join(format!("tako-cache-{:08x}", rand::random::<u32>()))
    } else {
        cli.cache_dir
            .clone()
            .unwrap_or_else(Resolver::default_cache_root)
    };

    let root = match (&cli.repo, &cli.root) {
        (Some(reference), _) => {
            let resolver = Resolver::new(cache_root.clone(), cli.local);
            let anchor = cli
                .root
                .clone()
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
            resolver.resolve(reference, &anchor)?
        }
        (None, Some(root)) => root.clone(),
        (None, None) => std::env::current_dir()?,
    };

    let mut config = RunnerConfig::new(root, cache_root);
    config.local_only = cli.local;
    config.only = cli.only.clone();
    config.ignore = cli.ignore.clone();
    config.serial = cli.serial;
    config.max_concurrent_repos = cli.max_concurrent_repos.unwrap_or(0);
    config.options = ExecOptions {
        dry_run: cli.dry_run,
        debug: cli.debug,
        continue_on_error: cli.continue_on_error,
        preserve_tmp: cli.preserve_tmp,
        global_resources: None,
    };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_input_accepts_name_value() {
        assert_eq!(
            parse_input("environment=prod").unwrap(),
            ("environment".to_string(), "prod".to_string())
        );
        assert!(parse_input("no-equals").is_err());
        assert!(parse_input("=value").is_err());
    }

    #[test]
    fn graph_command_parses() {
        let cli = Cli::try_parse_from(["tako", "graph", "--root", "/work/a"]).unwrap();
        assert!(matches!(cli.command, Command::Graph));
        assert_eq!(cli.root, Some(PathBuf::from("/work/a")));
    }

    #[test]
    fn exec_with_inputs_parses() {
        let cli = Cli::try_parse_from([
            "tako",
            "exec",
            "deploy",
            "--inputs",
            "environment=staging",
            "--inputs",
            "replicas=3",
        ])
        .unwrap();
        let Command::Exec { workflow, resume } = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(workflow.as_deref(), Some("deploy"));
        assert!(resume.is_none());
        assert_eq!(cli.inputs.len(), 2);
    }

    #[test]
    fn run_collects_trailing_command() {
        let cli = Cli::try_parse_from(["tako", "run", "git", "status"]).unwrap();
        let Command::Run { command } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(command.join(" "), "git status");
    }

    #[test]
    fn cache_prune_has_default_age() {
        let cli = Cli::try_parse_from(["tako", "cache", "prune"]).unwrap();
        let Command::Cache {
            command: CacheCommand::Prune { max_age_days },
        } = cli.command
        else {
            panic!("expected cache prune");
        };
        assert_eq!(max_age_days, 30);
    }

    #[test]
    fn filter_flags_split_on_commas() {
        let cli =
            Cli::try_parse_from(["tako", "graph", "--only", "a,b", "--ignore", "c"]).unwrap();
        assert_eq!(cli.only, ["a", "b"]);
        assert_eq!(cli.ignore, ["c"]);
    }
}
