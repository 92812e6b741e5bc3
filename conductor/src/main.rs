//! fwconductor - Entry Point
//!
//! Plans and runs firmware update campaigns against Redfish management
//! controllers.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use colored::Colorize;
use tracing::{error, info};

use fwconductor::app::run::{generate_plans, run, run_plan};
use fwconductor::app::{AppOptions, AppState};
use fwconductor::authn::StaticCredentials;
use fwconductor::errors::ConductorError;
use fwconductor::filesys::file::File;
use fwconductor::logs::init_logging;
use fwconductor::planner::{Inventory, StaticInventory};
use fwconductor::storage::layout::StorageLayout;
use fwconductor::storage::settings::load_settings;
use fwconductor::utils::version_info;

const USAGE: &str = "\
Usage:
  fwconductor --version
  fwconductor --plan --inventory=<file> [--settings=<file>]
  fwconductor --run --plan-id=<id> [--rollback] [--inventory=<file>] [--settings=<file>]
  fwconductor --serve [--inventory=<file>] [--settings=<file>]";

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        let version = version_info();
        match serde_json::to_string_pretty(&version) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    let is_command = ["plan", "run", "serve"]
        .iter()
        .any(|command| cli_args.contains_key(*command));
    if !is_command {
        println!("{}", USAGE);
        return;
    }

    if let Err(e) = execute(&cli_args).await {
        error!("{}", e);
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn execute(cli_args: &HashMap<String, String>) -> Result<(), ConductorError> {
    // Retrieve the settings file
    let settings_file = match cli_args.get("settings") {
        Some(path) => File::new(path),
        None => StorageLayout::default().settings_file(),
    };
    let settings = load_settings(&settings_file).await?;

    let options = AppOptions::from_settings(&settings)?;

    // Initialize logging; the guard flushes file output on exit
    let _log_guard = match init_logging(options.log.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let inventory = match cli_args.get("inventory") {
        Some(path) => StaticInventory::from_file(path).await?,
        None if cli_args.contains_key("plan") => {
            return Err(ConductorError::ConfigError(
                "--plan requires --inventory=<file>".to_string(),
            ))
        }
        None => StaticInventory::new(Inventory::default()),
    };
    let credentials = StaticCredentials::from_settings(&settings.credentials)?;

    let app_state = Arc::new(
        AppState::init(&options, Arc::new(credentials), Arc::new(inventory)).await?,
    );

    if cli_args.contains_key("plan") {
        let plans = generate_plans(&app_state).await?;
        print_plans(&plans);
        return Ok(());
    }

    if cli_args.contains_key("run") {
        let plan_id = cli_args.get("plan-id").ok_or_else(|| {
            ConductorError::ConfigError("--run requires --plan-id=<id>".to_string())
        })?;
        let rollback = cli_args.contains_key("rollback");

        let outcome = run_plan(app_state, plan_id, rollback).await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);

        let status = outcome.execution.status.as_str();
        if outcome.execution.has_failures() {
            println!("{} {}", "execution".bold(), status.red());
        } else {
            println!("{} {}", "execution".bold(), status.green());
        }
        return Ok(());
    }

    info!("Running fwconductor with options: {:?}", options);
    run(options, app_state, await_shutdown_signal()).await
}

fn print_plans(plans: &[fwconductor::planner::OrchestrationPlan]) {
    if plans.is_empty() {
        println!("{}", "No plans generated".yellow());
        return;
    }
    for plan in plans {
        println!(
            "{}  {}  {} devices  next {}",
            plan.id.bold(),
            plan.name,
            plan.device_ids.len(),
            plan.next_execution_date.to_rfc3339().cyan()
        );
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers, waiting for Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
