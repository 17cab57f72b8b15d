//! Command-line interface definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// paperflow - paper-analysis pipeline daemon
#[derive(Debug, Parser)]
#[command(name = "pd", version, about)]
pub struct Cli {
    /// Path to a config file (defaults to .paperflow.yml, then
    /// ~/.config/paperflow/paperflow.yml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the core and serve until interrupted
    Run,

    /// Run one pipeline over a local text file and print the results
    Submit {
        /// Path to the paper (plain text for the demo path)
        #[arg(short, long)]
        file: PathBuf,

        /// Requesting user id
        #[arg(short, long, default_value = "local")]
        user: String,

        /// Stage kinds to run, comma-separated; defaults to all
        #[arg(short, long, value_delimiter = ',')]
        stages: Vec<String>,

        /// Overall deadline in milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["pd", "run"]);
        assert!(matches!(cli.command, Command::Run));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_submit_with_stages() {
        let cli = Cli::parse_from([
            "pd",
            "submit",
            "--file",
            "paper.txt",
            "--stages",
            "text-extractor,summarizer",
        ]);

        match cli.command {
            Command::Submit { file, stages, user, .. } => {
                assert_eq!(file, PathBuf::from("paper.txt"));
                assert_eq!(stages, vec!["text-extractor", "summarizer"]);
                assert_eq!(user, "local");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["pd", "--config", "custom.yml", "run"]);
        assert_eq!(cli.config, Some(PathBuf::from("custom.yml")));
    }
}
