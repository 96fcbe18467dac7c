//! `hrm`: scan for, check, and monitor BLE heart-rate sensors.

mod cli;
mod commands;
mod config;
mod format;

use std::io;
use std::path::Path;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, ConfigAction};
use commands::{MonitorArgs, cmd_check, cmd_monitor, cmd_scan};
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle completions command early (before tracing init)
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "hrm", &mut io::stdout());
        return Ok(());
    }

    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let path = cli.config.clone().unwrap_or_else(Config::default_path);
    if let Commands::Config { action } = &cli.command {
        return cmd_config(action, &path, cli.config.is_some());
    }

    let config = Config::resolve(cli.config.as_deref())?;
    let manager_config = config.manager_config();

    match cli.command {
        Commands::Scan { timeout, format } => {
            cmd_scan(timeout, format, cli.quiet, manager_config).await?;
        }
        Commands::Check => cmd_check(manager_config).await?,
        Commands::Monitor {
            device,
            duration,
            format,
        } => {
            let devices = if device.is_empty() {
                config.devices.clone()
            } else {
                device
            };
            let args = MonitorArgs {
                devices,
                duration,
                format,
                quiet: cli.quiet,
            };
            cmd_monitor(args, manager_config).await?;
        }
        Commands::Config { .. } | Commands::Completions { .. } => {
            unreachable!("handled before loading config")
        }
    }

    Ok(())
}

fn cmd_config(action: &ConfigAction, path: &Path, explicit: bool) -> Result<()> {
    match action {
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Show => {
            let config = if explicit || path.exists() {
                Config::load(path)?
            } else {
                Config::default()
            };
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
