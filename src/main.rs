use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use emunet::config::load_settings_file;
use emunet::device::{spawn_supervisor, DeviceRegistry, OsCapabilityProbe, SupervisorConfig};
use emunet::notify::LogSink;
use emunet::SettingsUpdate;

/// Orchestration core for emulated network devices
#[derive(Parser, Debug)]
#[command(name = "emunet", version, about)]
struct Args {
    /// Path to a JSON settings file
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Path to a .env file to load
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Name of the device emulator binary to discover when none is
    /// configured
    #[arg(long, default_value = "vpcs")]
    binary_name: String,

    /// Verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    let settings = match &args.settings {
        Some(path) => match load_settings_file(path) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to load settings file {}: {}", path.display(), e);
                process::exit(1);
            }
        },
        None => Default::default(),
    };

    let registry = Arc::new(DeviceRegistry::new(
        settings.registry_settings(&args.binary_name),
        Arc::new(OsCapabilityProbe),
    ));

    // apply the configured port ranges before anything allocates
    registry
        .update_settings(SettingsUpdate {
            console_start_port: Some(settings.console_start_port),
            console_end_port: Some(settings.console_end_port),
            data_start_port: Some(settings.data_start_port),
            data_end_port: Some(settings.data_end_port),
            ..Default::default()
        })
        .await;

    let supervisor_shutdown = spawn_supervisor(
        registry.clone(),
        Arc::new(LogSink),
        SupervisorConfig::default(),
    );

    let current = registry.settings();
    info!("emunet core ready");
    info!("  device binary : {:?}", current.binary);
    info!("  working dir   : {}", current.working_dir.display());
    info!("  host          : {}", current.host);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    // explicit teardown: stop the supervisor first, then drain instances
    info!("shutting down");
    let _ = supervisor_shutdown.send(true);
    registry.shutdown().await;
    Ok(())
}
