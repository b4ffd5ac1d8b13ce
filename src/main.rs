use anyhow::{Context, Result};
use clap::Parser;
use irrigo::cli::{Args, ConfigDiscovery, ExecutionMode, RigConfig, RunConfig};
use irrigo::device::{HandleFactory, SimulatedBoard, SysfsDriver};
use irrigo::repository::{FileRepository, Repository};
use irrigo::weather::{OpenMeteoGate, WeatherGate};
use irrigo::{TaskManager, env};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match mode {
        ExecutionMode::Run(run) => run_controller(run).await,
        ExecutionMode::ShowConfig => {
            ConfigDiscovery::show_discovery_info();
            let effective = ConfigDiscovery::discover_config()?;
            println!();
            println!("Effective configuration:");
            println!("{}", effective.to_toml_string()?);
            Ok(())
        }
        ExecutionMode::InitConfig(path) => {
            RigConfig::default()
                .to_toml_file(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✓ Default configuration written to {}", path.display());
            Ok(())
        }
    }
}

fn init_logging(config: &RigConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.logging.filter.as_deref().unwrap_or(env::DEFAULT_LOG_FILTER))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_controller(run: RunConfig) -> Result<()> {
    let config = match &run.config_override {
        Some(path) => RigConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConfigDiscovery::discover_config()?,
    };
    init_logging(&config);

    info!("Starting irrigo {}", env!("CARGO_PKG_VERSION"));

    let state_file = run
        .state_file_override
        .clone()
        .or_else(|| config.storage.state_file.clone());
    let repository: Arc<dyn Repository> = match state_file {
        Some(path) => Arc::new(
            FileRepository::open(&path)
                .await
                .with_context(|| format!("Failed to open state file {}", path.display()))?,
        ),
        None => {
            warn!("No state file configured, rig state will not survive a restart");
            Arc::new(FileRepository::in_memory())
        }
    };

    let factory = if run.mock || config.gpio.mock {
        info!("Using simulated GPIO board");
        HandleFactory::simulated(Arc::new(SimulatedBoard::new()))
    } else {
        info!(root = %config.gpio.sysfs_root.display(), "Using sysfs GPIO");
        HandleFactory::gpio(Arc::new(SysfsDriver::new(config.gpio.sysfs_root.clone())))
    };

    let settings = config.weather.open_meteo();
    if settings.location.is_none() {
        info!(
            endpoint = %settings.geolocation_endpoint,
            "No coordinates configured, the weather gate will locate the rig by IP"
        );
    }
    let gate = OpenMeteoGate::new(settings).context("Failed to set up weather gate")?;
    info!(gate = gate.name(), "Weather gate configured");
    let manager = TaskManager::new(repository, factory).with_weather_gate(Arc::new(gate));

    let started = manager.initialize().await;
    if !started.is_success {
        error!(
            "Initialization failed: {}",
            started.message.as_deref().unwrap_or("unknown error")
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    let stopped = manager.shutdown().await;
    if !stopped.is_success {
        error!(
            "Shutdown left devices in an unknown state: {}",
            stopped.message.as_deref().unwrap_or("unknown error")
        );
    }

    info!("irrigo stopped");
    Ok(())
}
