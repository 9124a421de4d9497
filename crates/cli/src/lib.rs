pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "signoff",
    about = "Signoff operator CLI",
    long_about = "Operate the approval engine: migrations, config inspection, tier file validation, escalation sweeps, and ledger verification.",
    after_help = "Examples:\n  signoff doctor --json\n  signoff validate-tiers config/tiers\n  signoff sweep --limit 100"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, directory and tier files, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Parse and validate a tier configuration file or directory")]
    ValidateTiers {
        #[arg(help = "A .toml/.json file, or a directory of them")]
        path: PathBuf,
    },
    #[command(about = "Run one escalation pass against the stored workflows")]
    Sweep {
        #[arg(long, help = "Maximum open instances to examine (defaults to scheduler.batch_limit)")]
        limit: Option<usize>,
    },
    #[command(about = "Verify every hash chain in the stored history ledger")]
    VerifyLedger,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::ValidateTiers { path } => commands::validate_tiers::run(&path),
        Command::Sweep { limit } => commands::sweep::run(limit),
        Command::VerifyLedger => commands::verify_ledger::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
