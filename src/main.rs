//! # maestro
//!
//! Command-line front end for the orchestration engine: plans and runs JSON
//! workflow declarations against a simulated executor.

#![deny(unsafe_code)]

mod commands;
mod declaration;
mod simulate;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use maestro_core::WorkflowState;
use maestro_settings::MaestroSettings;

use crate::declaration::WorkflowDeclaration;

/// Maestro workflow orchestration.
#[derive(Parser, Debug)]
#[command(name = "maestro", about = "Maestro workflow orchestration engine")]
struct Cli {
    /// Settings file (defaults to `$MAESTRO_SETTINGS` or `~/.maestro/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a workflow file and print its execution levels.
    Plan {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Run a workflow file against the simulated executor.
    Run {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print the effective settings.
    Settings,
}

fn load_settings(explicit: Option<&Path>, log_level: Option<&str>) -> Result<MaestroSettings> {
    let path = explicit.map_or_else(maestro_settings::settings_path, Path::to_path_buf);
    let mut settings = maestro_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(level) = log_level {
        if maestro_telemetry::parse_level(level).is_none() {
            anyhow::bail!("unknown log level {level:?}");
        }
        settings.logging.level = level.to_string();
    }
    Ok(settings)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to encode output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = load_settings(args.settings.as_deref(), args.log_level.as_deref())?;
    let _ = maestro_telemetry::init_telemetry(&settings.logging);

    match args.command {
        Command::Plan { file, json } => {
            let decl = WorkflowDeclaration::load(&file)?;
            let report = commands::plan(&decl, &settings)?;
            if json {
                print_json(&report)?;
            } else {
                print!("{}", report.render_text());
            }
        }
        Command::Run { file, json } => {
            let decl = WorkflowDeclaration::load(&file)?;
            let report = commands::run(&decl, &settings).await?;
            if json {
                print_json(&report)?;
            } else {
                print!("{}", report.render_text());
            }
            if report.workflow.state == WorkflowState::Failed {
                anyhow::bail!(
                    "workflow {} failed: {}",
                    report.workflow.id,
                    report.workflow.failure_reason.as_deref().unwrap_or("unknown reason")
                );
            }
        }
        Command::Settings => print_json(&settings)?,
    }
    Ok(())
}
