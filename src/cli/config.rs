//! CLI subcommand: `netguard config`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::config::{Config, DEFAULT_CONFIG_TEMPLATE};
use crate::security::mask_password;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration (device passwords masked)
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Get a configuration value
    Get {
        /// Config key (e.g., limits.max_commands_per_minute)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Config key (e.g., connection.liveness_interval)
        key: String,

        /// Value to set
        value: String,
    },

    /// Report out-of-range values and devices without credentials
    Check,

    /// Show config file path
    Path,

    /// Write the commented default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run(args: ConfigArgs, config_path: Option<&str>) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => {
            let config = masked(Config::load_with_override(config_path)?);
            let rendered = match format.as_str() {
                "json" => serde_json::to_string_pretty(&config)?,
                _ => toml::to_string_pretty(&config)?,
            };
            println!("{}", rendered);
        }
        ConfigCommands::Get { key } => {
            let config = Config::load_with_override(config_path)?;
            println!("{}", config.get_value(&key)?);
        }
        ConfigCommands::Set { key, value } => {
            let mut config = Config::load()?;
            config.set_value(&key, &value)?;
            config.save()?;
            println!("Set {} = {}", key, value);
        }
        ConfigCommands::Check => check(config_path)?,
        ConfigCommands::Path => println!("{}", file_path(config_path)?.display()),
        ConfigCommands::Init { force } => {
            let path = file_path(config_path)?;
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {}. Use --force to overwrite.",
                    path.display()
                );
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
            println!("Created config file at {}", path.display());
        }
    }
    Ok(())
}

fn file_path(config_path: Option<&str>) -> Result<PathBuf> {
    match config_path {
        Some(p) => Ok(PathBuf::from(shellexpand::tilde(p).to_string())),
        None => Config::config_path(),
    }
}

fn masked(mut config: Config) -> Config {
    for device in config.devices.values_mut() {
        device.password = mask_password(&device.password);
    }
    config
}

/// Parses the raw file so clamped values are reported instead of hidden.
fn check(config_path: Option<&str>) -> Result<()> {
    let path = file_path(config_path)?;
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Invalid config: {}", path.display()))?;

    let mut problems = config.validate();
    problems.extend(credential_problems(&config));

    if problems.is_empty() {
        println!("{}: OK ({} device(s))", path.display(), config.devices.len());
        return Ok(());
    }
    for problem in &problems {
        println!("  - {}", problem);
    }
    anyhow::bail!("{} problem(s) in {}", problems.len(), path.display())
}

fn credential_problems(config: &Config) -> Vec<String> {
    let env_fallback = std::env::var("NETGUARD_DEVICE_PASSWORD").is_ok();
    config
        .devices
        .iter()
        .filter_map(|(name, device)| {
            if device.host.trim().is_empty() {
                Some(format!("devices.{}: host is empty", name))
            } else if device.username.trim().is_empty() {
                Some(format!("devices.{}: username is empty", name))
            } else if device.resolved_password().is_empty() && !env_fallback {
                Some(format!(
                    "devices.{}: no password (set one or export NETGUARD_DEVICE_PASSWORD)",
                    name
                ))
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_reports_clamped_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[limits]\nmax_commands_per_minute = 0\n\n[security]\nmax_special_char_ratio = 2.0\n",
        )
        .unwrap();

        let err = check(path.to_str()).unwrap_err();
        assert!(err.to_string().contains("2 problem(s)"), "{}", err);
    }

    #[test]
    fn check_accepts_template() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE).unwrap();
        check(path.to_str()).unwrap();
    }

    #[test]
    fn show_masks_device_passwords() {
        let config: Config = toml::from_str(
            "[devices.core-1]\nhost = \"192.0.2.1\"\nusername = \"netops\"\npassword = \"s3cretpass\"\n",
        )
        .unwrap();
        let rendered = toml::to_string_pretty(&masked(config)).unwrap();
        assert!(!rendered.contains("s3cretpass"));
        assert!(rendered.contains("**********"));
    }

    #[test]
    fn missing_host_is_reported() {
        let config: Config = toml::from_str(
            "[devices.edge]\nhost = \"\"\nusername = \"netops\"\npassword = \"pw\"\n",
        )
        .unwrap();
        let problems = credential_problems(&config);
        assert_eq!(problems, ["devices.edge: host is empty"]);
    }
}
