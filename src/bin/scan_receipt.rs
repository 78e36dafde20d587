//! Scan receipt images from the command line and print the extracted fields as JSON.

use clap::{Parser, Subcommand};
use receipt_scanner_lib::commands;
use receipt_scanner_lib::config::ScannerConfig;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "scan_receipt", version, about = "Extract merchant and total from receipt photos")]
struct Cli {
    /// Dump every preprocessed image into this directory.
    #[arg(long, global = true)]
    diagnostics_dir: Option<PathBuf>,

    /// Override the processing history database location.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process one or more receipt images.
    Scan {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Show the most recent processing log entries.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Report which recognition engine is configured.
    Status,
}

fn main() -> ExitCode {
    receipt_scanner_lib::init_logging("info");
    let cli = Cli::parse();

    let mut config = match ScannerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(2);
        }
    };
    if cli.diagnostics_dir.is_some() {
        config.diagnostics_dir = cli.diagnostics_dir;
    }
    if cli.db.is_some() {
        config.database_path = cli.db;
    }

    match run(cli.command, &config) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, config: &ScannerConfig) -> Result<ExitCode, String> {
    match command {
        Command::Status => {
            print_json(&commands::get_engine_status(config))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::History { limit } => {
            let store = receipt_scanner_lib::db::LogStore::open(&config.database_path())
                .map_err(|e| e.to_string())?;
            print_json(&commands::get_history(&store, limit)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Scan { files } => {
            let (pipeline, _store) = receipt_scanner_lib::build_pipeline(config)?;
            let mut all_ok = true;
            for file in &files {
                let outcome = commands::scan_receipt_file(&pipeline, file);
                all_ok &= outcome.is_success();
                print_json(&outcome)?;
            }
            Ok(if all_ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let out = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", out);
    Ok(())
}
