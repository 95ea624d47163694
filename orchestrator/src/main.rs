//! rollctl - Entry Point
//!
//! Deploys a registry image to this host with a snapshot taken first and an
//! automatic rollback when the new release does not become healthy.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;

use anyhow::Context;
use colored::Colorize;
use secrecy::SecretString;
use tracing::{error, info};

use rollctl::app::context::DeploymentContext;
use rollctl::app::options::DeployOptions;
use rollctl::app::run::{backup, deploy, list_snapshots, rollback};
use rollctl::deploy::runtime::RegistryCredentials;
use rollctl::errors::OrchestratorError;
use rollctl::logs::{init_logging, LogLevel, LogOptions};
use rollctl::manifest::model::TopologyKind;
use rollctl::storage::layout::DeploymentLayout;
use rollctl::storage::settings::Settings;
use rollctl::storage::state::RunRecord;
use rollctl::utils::version_info;

#[tokio::main]
async fn main() -> ExitCode {
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
        return match serde_json::to_string_pretty(&version_info()) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    let layout = match cli_args.get("dir") {
        Some(dir) => DeploymentLayout::new(dir),
        None => DeploymentLayout::default(),
    };

    // Retrieve the settings file
    let settings_file = layout.settings_file();
    let settings = match Settings::load(&settings_file)
        .await
        .with_context(|| format!("Unable to read settings file {}", settings_file.path().display()))
    {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let log_level = match cli_args.get("log-level").map(|l| l.parse::<LogLevel>()) {
        Some(Ok(level)) => level,
        Some(Err(e)) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return ExitCode::FAILURE;
        }
        None => settings.log_level.clone(),
    };
    let log_options = LogOptions {
        log_level,
        json_format: cli_args.contains_key("json-logs") || settings.json_logs,
        log_dir: settings.file_logging.then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = match build_options(layout, &settings, &cli_args) {
        Ok(options) => options,
        Err(e) => {
            error!("Invalid options: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if cli_args.contains_key("status") {
        return report_status(&options).await;
    }

    let ctx = match DeploymentContext::from_options(options).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if cli_args.contains_key("snapshots") {
        return report_snapshots(&ctx).await;
    }

    let result = if cli_args.contains_key("rollback") {
        info!("Running manual rollback");
        rollback(&ctx).await
    } else if cli_args.contains_key("backup") {
        info!("Running backup");
        backup(&ctx).await
    } else {
        deploy(&ctx, tokio::time::sleep).await
    };

    match result {
        Ok(record) => report(&record),
        Err(e) => {
            error!("{}", e);
            // A lock error means the saved record belongs to another run
            if !matches!(e, OrchestratorError::Lock(_)) {
                if let Ok(Some(record)) = RunRecord::load(&ctx.options.layout.state_file()).await {
                    report(&record);
                }
            }
            ExitCode::FAILURE
        }
    }
}

/// Settings plus command line and environment overrides
fn build_options(
    layout: DeploymentLayout,
    settings: &Settings,
    cli_args: &HashMap<String, String>,
) -> Result<DeployOptions, OrchestratorError> {
    let mut options = DeployOptions::from_settings(layout, settings);

    if let Some(registry) = cli_args.get("registry") {
        options.target.registry = registry.clone();
    }
    if let Some(repository) = cli_args.get("repository") {
        options.target.repository = repository.clone();
    }
    if let Some(tag) = cli_args.get("tag") {
        options.target.tag = tag.clone();
    }
    if let Some(topology) = cli_args.get("topology") {
        options.topology = topology.parse::<TopologyKind>()?;
    }
    if cli_args.contains_key("migrate-topology") {
        options.allow_topology_change = true;
    }
    options.force = cli_args.contains_key("force");

    let username = env::var("ROLLCTL_REGISTRY_USER")
        .ok()
        .or_else(|| settings.target.username.clone());
    if let (Some(username), Ok(password)) = (username, env::var("ROLLCTL_REGISTRY_PASSWORD")) {
        options.credentials = Some(RegistryCredentials {
            registry: options.target.registry.clone(),
            username,
            password: SecretString::from(password),
        });
    }

    Ok(options)
}

fn report(record: &RunRecord) -> ExitCode {
    let state = format!("{:?}", record.state);
    let state = if record.succeeded() {
        state.green().bold()
    } else {
        state.red().bold()
    };
    println!("{} {:?}: {}", "rollctl".bold(), record.operation, state);

    if let Some(image) = &record.image {
        println!("  image:    {}", image);
    }
    if let Some(id) = &record.snapshot {
        println!("  snapshot: {}", id);
    }
    if let Some(id) = &record.restored {
        println!("  restored: {}", id);
    }
    if let Some(error) = &record.error {
        println!("  {} {}", "error:".red(), error);
    }
    if !record.warnings.is_empty() {
        println!("  {} ({}):", "warnings".yellow(), record.warnings.len());
        for warning in &record.warnings {
            println!("    {}", warning.to_string().yellow());
        }
    }

    if record.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn report_status(options: &DeployOptions) -> ExitCode {
    match RunRecord::load(&options.layout.state_file()).await {
        Ok(Some(record)) => {
            report(&record);
            ExitCode::SUCCESS
        }
        Ok(None) => {
            println!("No run recorded in {}", options.layout.base_dir.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Unable to read run record: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn report_snapshots(ctx: &DeploymentContext) -> ExitCode {
    match list_snapshots(ctx).await {
        Ok(entries) if entries.is_empty() => {
            println!("No snapshots");
            ExitCode::SUCCESS
        }
        Ok(entries) => {
            for entry in entries {
                match entry.metadata {
                    Some(metadata) => println!(
                        "{}  {}  {}{}",
                        entry.id.to_string().bold(),
                        metadata.image.as_deref().unwrap_or("-"),
                        metadata.backend,
                        if metadata.data_artifact.is_some() { "" } else { " (no data)" }
                    ),
                    None => println!("{}  {}", entry.id.to_string().bold(), "(no metadata)".dimmed()),
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Unable to list snapshots: {}", e);
            ExitCode::FAILURE
        }
    }
}
