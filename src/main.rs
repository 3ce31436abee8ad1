//! massert - main entry point

use anyhow::{Context, Result};
use crossterm::style::Stylize;
use machassert::cli::{Cli, Commands};
use machassert::config::{AssertionGroup, MachineSpec};
use machassert::console::{ConsoleReporter, TerminalPrompter};
use machassert::engine::Executor;
use machassert::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Log to stderr, `warn` unless RUST_LOG says otherwise
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_targets(path: Option<&Path>) -> Result<MachineSpec> {
    match path {
        Some(path) => {
            info!("Loading targets from {:?}", path);
            MachineSpec::load_from_file(path)
                .with_context(|| format!("Could not load targets {}", path.display()))
        }
        None => {
            debug!("No targets file given, using the local machine");
            Ok(MachineSpec::local_default())
        }
    }
}

fn load_assertions(paths: &[PathBuf]) -> Result<Vec<AssertionGroup>> {
    paths
        .iter()
        .map(|path| {
            info!("Loading assertions from {:?}", path);
            AssertionGroup::load_from_file(path)
                .with_context(|| format!("Could not load assertions {}", path.display()))
        })
        .collect()
}

fn run(cli: Cli) -> Result<()> {
    let targets = load_targets(cli.targets.as_deref())?;
    let groups = load_assertions(cli.command.assertion_files())?;

    match cli.command {
        Commands::Run { .. } | Commands::Assert { .. } => {
            let executor = Executor::new(targets, groups);
            let mut reporter = ConsoleReporter::stdout();
            executor.run(&mut reporter, &mut TerminalPrompter)?;
        }
        Commands::Print { .. } => {
            let document = serde_json::json!({
                "targets": targets,
                "assertions": groups,
            });
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    init_logger();
    let cli = Cli::parse_args();
    debug!("CLI arguments parsed: {:?}", cli);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<Error>() {
                Some(e) if e.is_assertion_failure() => {
                    println!("{}: assertions failed", "Error".red());
                }
                _ => {
                    error!("{:#}", err);
                    eprintln!("Error: {:#}", err);
                }
            }
            ExitCode::FAILURE
        }
    }
}
