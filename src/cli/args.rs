//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: Start the rig controller and keep it running until interrupted
//! - `show-config`: Show configuration discovery information
//! - `init-config`: Write a configuration file with the built-in defaults

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, PartialEq)]
pub enum ExecutionMode {
    Run(RunConfig),
    ShowConfig,
    InitConfig(PathBuf),
}

#[derive(Debug, Default, PartialEq)]
pub struct RunConfig {
    pub config_override: Option<PathBuf>,
    /// Forces the simulated board regardless of configuration
    pub mock: bool,
    pub state_file_override: Option<PathBuf>,
}

#[derive(Debug, Parser)]
#[command(name = "irrigo")]
#[command(author = "Irrigo Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Irrigation rig controller with daily valve schedules and a pump interlock")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the controller
    Run {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Drive a simulated board instead of GPIO pins
        #[arg(long = "mock")]
        mock: bool,
        /// JSON state file (overrides configuration)
        #[arg(short = 's', long = "state-file")]
        state_file: Option<PathBuf>,
    },
    /// Show configuration discovery information
    ShowConfig,
    /// Write default configuration to a file
    InitConfig {
        /// Destination path
        #[arg(default_value = "irrigo.toml")]
        path: PathBuf,
    },
}

impl Args {
    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                config,
                mock,
                state_file,
            }) => Ok(ExecutionMode::Run(RunConfig {
                config_override: config.clone(),
                mock: *mock,
                state_file_override: state_file.clone(),
            })),
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            Some(Commands::InitConfig { path }) => Ok(ExecutionMode::InitConfig(path.clone())),
            None => Err("No subcommand given. Use --help to see available commands.".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode() {
        let args = Args::try_parse_from([
            "irrigo",
            "run",
            "--config",
            "rig.toml",
            "--mock",
            "-s",
            "/var/lib/irrigo/state.json",
        ])
        .unwrap();

        assert_eq!(
            args.mode().unwrap(),
            ExecutionMode::Run(RunConfig {
                config_override: Some(PathBuf::from("rig.toml")),
                mock: true,
                state_file_override: Some(PathBuf::from("/var/lib/irrigo/state.json")),
            })
        );
    }

    #[test]
    fn test_run_mode_defaults() {
        let args = Args::try_parse_from(["irrigo", "run"]).unwrap();
        assert_eq!(args.mode().unwrap(), ExecutionMode::Run(RunConfig::default()));
    }

    #[test]
    fn test_config_subcommands() {
        let args = Args::try_parse_from(["irrigo", "show-config"]).unwrap();
        assert_eq!(args.mode().unwrap(), ExecutionMode::ShowConfig);

        let args = Args::try_parse_from(["irrigo", "init-config"]).unwrap();
        assert_eq!(
            args.mode().unwrap(),
            ExecutionMode::InitConfig(PathBuf::from("irrigo.toml"))
        );
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(Args::try_parse_from(["irrigo", "water-now"]).is_err());
    }
}
