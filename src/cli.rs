use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// massert - assert (and fix) the state of files across machines
#[derive(Parser, Debug)]
#[command(name = "massert")]
#[command(about = "Check files on local and SSH machines, remediating any that don't match")]
#[command(version)]
pub struct Cli {
    /// Machine spec file to run against; the local machine when omitted
    #[arg(long, global = true, value_name = "FILE")]
    pub targets: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Evaluate assertion files, running remediation actions as needed
    Run {
        /// Assertion files, applied in the order given
        #[arg(required = true)]
        assertions: Vec<PathBuf>,
    },
    /// Alias of `run`
    Assert {
        /// Assertion files, applied in the order given
        #[arg(required = true)]
        assertions: Vec<PathBuf>,
    },
    /// Print the parsed machine and assertion specs as JSON
    Print {
        /// Assertion files to print
        #[arg(required = true)]
        assertions: Vec<PathBuf>,
    },
}

impl Commands {
    /// Assertion files named on the command line
    pub fn assertion_files(&self) -> &[PathBuf] {
        match self {
            Self::Run { assertions } | Self::Assert { assertions } | Self::Print { assertions } => {
                assertions
            }
        }
    }
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_with_targets() {
        let cli = Cli::try_parse_from([
            "massert",
            "--targets",
            "machines.toml",
            "run",
            "base.toml",
            "web.json",
        ])
        .unwrap();
        assert_eq!(cli.targets, Some(PathBuf::from("machines.toml")));
        assert!(matches!(cli.command, Commands::Run { .. }));
        assert_eq!(
            cli.command.assertion_files(),
            &[PathBuf::from("base.toml"), PathBuf::from("web.json")]
        );
    }

    #[test]
    fn test_targets_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["massert", "assert", "base.toml", "--targets", "m.json"]).unwrap();
        assert_eq!(cli.targets, Some(PathBuf::from("m.json")));
        assert!(matches!(cli.command, Commands::Assert { .. }));
    }

    #[test]
    fn test_assertion_files_required() {
        assert!(Cli::try_parse_from(["massert", "run"]).is_err());
        assert!(Cli::try_parse_from(["massert"]).is_err());
    }

    #[test]
    fn test_print_without_targets() {
        let cli = Cli::try_parse_from(["massert", "print", "base.toml"]).unwrap();
        assert!(cli.targets.is_none());
        assert!(matches!(cli.command, Commands::Print { .. }));
    }
}
