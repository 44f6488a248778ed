// linkwise CLI - probabilistic record linkage from a settings file

mod exit_codes;
mod link;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};

use exit_codes::{link_exit_code, EXIT_SUCCESS, EXIT_USAGE};
use linkwise_linkage::LinkError;

#[derive(Parser)]
#[command(name = "linkwise")]
#[command(about = "Fellegi-Sunter record linkage (train, block, score)")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a settings file and build its model without reading any data
    #[command(after_help = "\
Examples:
  linkwise validate people.settings.toml")]
    Validate {
        /// Path to the .settings.toml file
        settings: PathBuf,
    },

    /// Count candidate pairs per prediction blocking rule
    #[command(after_help = "\
Examples:
  linkwise count people.settings.toml people.csv
  linkwise count customers.settings.toml customers_a.csv customers_b.csv")]
    Count {
        /// Path to the .settings.toml file
        settings: PathBuf,

        /// Input CSV files, one table each (named after the file stem)
        #[arg(required = true)]
        csv: Vec<PathBuf>,
    },

    /// Train the model and score candidate pairs
    #[command(after_help = "\
Runs u estimation by random sampling, m estimation from a label column,
then every [[training]] session in file order, reconciles the prior and
scores the pairs of the prediction blocking rules.

Examples:
  linkwise run people.settings.toml people.csv --json
  linkwise run people.settings.toml people.csv --output predictions.json
  linkwise run people.settings.toml people.csv --threshold 0.95 -v")]
    Run {
        /// Path to the .settings.toml file
        settings: PathBuf,

        /// Input CSV files, one table each (named after the file stem)
        #[arg(required = true)]
        csv: Vec<PathBuf>,

        /// Output JSON to stdout
        #[arg(long)]
        json: bool,

        /// Write JSON output to file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Match probability at or above which a pair counts as a match in the summary
        #[arg(long, default_value = "0.9")]
        threshold: f64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Validate { settings } => link::cmd_validate(settings),
        Commands::Count { settings, csv } => link::cmd_count(settings, csv),
        Commands::Run { settings, csv, json, output, threshold } => {
            link::cmd_run(settings, csv, json, output, threshold)
        }
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

/// Warnings always reach stderr; each -v adds a level.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .target(env_logger::Target::Stderr)
        .init();
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn args(msg: impl Into<String>) -> Self {
        Self { code: EXIT_USAGE, message: msg.into(), hint: None }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Create error from an engine error with its registered exit code.
    pub fn link(err: LinkError) -> Self {
        let code = link_exit_code(&err);
        let hint = match &err {
            LinkError::BlockingExplosion { .. } => {
                Some("tighten the rule or raise max_candidate_pairs in the settings file".to_string())
            }
            LinkError::MissingColumn { column, .. } => {
                Some(format!("every input CSV needs a '{column}' header"))
            }
            LinkError::DegenerateParameter(_) => {
                Some("set u_probability explicitly or train u on more pairs".to_string())
            }
            _ => None,
        };
        Self { code, message: err.to_string(), hint }
    }
}

impl From<LinkError> for CliError {
    fn from(err: LinkError) -> Self {
        Self::link(err)
    }
}
