pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use countersign_core::config::{AppConfig, LoadOptions};

use crate::commands::category::CategoryCommand;
use crate::commands::request::RequestCommand;

#[derive(Debug, Parser)]
#[command(
    name = "countersign",
    about = "Countersign approval workflow operator CLI",
    long_about = "Operate the Countersign approval engine: migrations, readiness checks, demo data, categories and approval requests.",
    after_help = "Examples:\n  countersign migrate\n  countersign seed\n  countersign request create --as u-alice --category cat-leave --date-start 2026-11-02 --date-end 2026-11-06\n  countersign request approve <id> --as u-carol"
)]
pub struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Read configuration from this TOML file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo directory, payment methods and approval categories")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, DB connectivity and migration state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(subcommand, about = "Inspect and manage approval categories")]
    Category(CategoryCommand),
    #[command(subcommand, about = "Create, route and decide approval requests")]
    Request(RequestCommand),
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = LoadOptions { config_path: cli.config, ..LoadOptions::default() };

    // Configuration errors are reported by the command itself.
    if let Ok(config) = AppConfig::load(options.clone()) {
        init_logging(&config);
    }

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(&options),
        Command::Seed => commands::seed::run(&options),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(&options) }
        }
        Command::Doctor { json } => commands::doctor::run(&options, json),
        Command::Category(command) => commands::category::run(&options, command),
        Command::Request(command) => commands::request::run(&options, command),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Log records go to stderr; stdout carries the command payload.
fn init_logging(config: &AppConfig) {
    use countersign_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    let _ = match config.logging.format {
        Compact => builder.compact().try_init(),
        Pretty => builder.pretty().try_init(),
        Json => builder.json().try_init(),
    };
}
