//! Configuration CLI commands.

use chvirt::config::{DriverConfig, CONFIG_FILE_NAME};
use chvirt::{Error, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration commands
#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    /// Show the effective configuration
    Show(ShowCmd),

    /// Write the effective configuration to a file
    Init(InitCmd),
}

impl ConfigCmd {
    pub fn run(self, config: &DriverConfig, source: Option<&Path>) -> Result<()> {
        match self {
            ConfigCmd::Show(cmd) => cmd.run(config, source),
            ConfigCmd::Init(cmd) => cmd.run(config),
        }
    }
}

/// Show the effective configuration
#[derive(Args, Debug)]
pub struct ShowCmd {}

impl ShowCmd {
    pub fn run(self, config: &DriverConfig, source: Option<&Path>) -> Result<()> {
        let default_path = config.config_dir.join(CONFIG_FILE_NAME);
        let path = source.unwrap_or(default_path.as_path());
        if path.exists() {
            println!("# loaded from {}", path.display());
        } else {
            println!("# defaults ({} not found)", path.display());
        }
        println!("# uri = {}", config.uri());
        let raw = toml::to_string_pretty(config).map_err(|e| Error::ConfigSave(e.to_string()))?;
        print!("{}", raw);
        Ok(())
    }
}

/// Write the effective configuration to a file
#[derive(Args, Debug)]
pub struct InitCmd {
    /// Destination; `<config_dir>/ch.conf` when omitted.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}

impl InitCmd {
    pub fn run(self, config: &DriverConfig) -> Result<()> {
        let path = self
            .output
            .unwrap_or_else(|| config.config_dir.join(CONFIG_FILE_NAME));
        if path.exists() && !self.force {
            return Err(Error::operation_invalid(format!(
                "{} already exists (use --force to overwrite)",
                path.display()
            )));
        }
        config.save(&path)?;
        println!("Wrote {}", path.display());
        Ok(())
    }
}
