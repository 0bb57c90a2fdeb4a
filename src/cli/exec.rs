//! CLI subcommand: `netguard exec`
//!
//! Runs commands on one device through the full pipeline: query screening,
//! rate limiting, policy, session, redaction and audit.

use anyhow::{Context, Result, anyhow};
use clap::Args;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::device::{DeviceSession, LivenessMonitor, OpenSshTransport, SessionSettings, Target};
use crate::gatekeeper::Gatekeeper;
use crate::security::{AuditLogger, AuditSettings};

const PASSWORD_ENV: &str = "NETGUARD_DEVICE_PASSWORD";

#[derive(Args)]
pub struct ExecArgs {
    /// Device name from the [devices] inventory
    #[arg(short, long)]
    pub device: Option<String>,

    /// Ad-hoc host (password from NETGUARD_DEVICE_PASSWORD)
    #[arg(long, conflicts_with = "device")]
    pub host: Option<String>,

    /// Username for an ad-hoc host
    #[arg(short, long)]
    pub user: Option<String>,

    /// SSH port for an ad-hoc host
    #[arg(short, long, default_value_t = 22)]
    pub port: u16,

    /// Free-text request to screen before the commands run
    #[arg(short, long)]
    pub query: Option<String>,

    /// Commands to run (quote each one)
    #[arg(required = true)]
    pub commands: Vec<String>,
}

pub async fn run(args: ExecArgs, config_path: Option<&str>) -> Result<()> {
    let config = Config::load_with_override(config_path)?;
    let target = resolve_target(&args, &config)?;

    let audit = Arc::new(AuditLogger::new(AuditSettings::from_config(
        &config.logging,
        config.audit_dir(),
    ))?);
    let transport = Arc::new(OpenSshTransport::from_config(&config.connection));
    let session = Arc::new(DeviceSession::new(
        transport,
        SessionSettings::from_config(&config.connection),
        Arc::clone(&audit),
    ));
    let gate = Gatekeeper::from_config(&config, Arc::clone(&session), Arc::clone(&audit));
    let monitor = LivenessMonitor::from_config(session, &config.connection)?
        .map(LivenessMonitor::spawn);

    info!("Audit session {}", audit.session_id());

    let mut failures = 0usize;
    let mut screened = true;
    if let Some(ref query) = args.query {
        match gate.validate_query(query) {
            Ok(sanitized) => eprintln!("Query accepted: {}", sanitized),
            Err(e) => {
                eprintln!("Query rejected ({}): {}", e.category(), e);
                failures += 1;
                screened = false;
            }
        }
    }

    if screened {
        match gate.connect(target).await {
            Ok(()) => {
                for command in &args.commands {
                    match gate.execute(command).await {
                        Ok(output) => {
                            println!("{}", output);
                        }
                        Err(e) => {
                            failures += 1;
                            eprintln!("Rejected ({}): {}", e.category(), e);
                            if e.is_fatal() {
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                failures += 1;
                eprintln!("{}", e);
            }
        }
    }

    if let Some(handle) = monitor {
        handle.abort();
    }
    let summary = gate.shutdown().await?;

    eprintln!();
    eprintln!(
        "Session {}: {} event(s) in {:.1}s",
        summary.session_id, summary.total_events, summary.duration_seconds
    );
    for path in [
        audit.text_path(),
        audit.json_path(),
        audit.summary_path(),
    ]
    .into_iter()
    .flatten()
    {
        eprintln!("  {}", path.display());
    }

    if failures > 0 {
        anyhow::bail!("{} step(s) failed", failures);
    }
    Ok(())
}

fn resolve_target(args: &ExecArgs, config: &Config) -> Result<Target> {
    if let Some(ref name) = args.device {
        let device = config.device(name).ok_or_else(|| {
            anyhow!(
                "Unknown device '{}'. Run `netguard devices` to list the inventory.",
                name
            )
        })?;
        let mut target = Target::from_device(device);
        if target.credentials.password().is_empty()
            && let Ok(password) = std::env::var(PASSWORD_ENV)
        {
            target = Target::new(&device.host, &device.username, password).with_port(device.port);
        }
        return Ok(target);
    }

    let host = args
        .host
        .as_deref()
        .ok_or_else(|| anyhow!("Pass --device <name> or --host <address>"))?;
    let user = args
        .user
        .as_deref()
        .context("--user is required with --host")?;
    let password = std::env::var(PASSWORD_ENV).unwrap_or_default();
    Ok(Target::new(host, user, password).with_port(args.port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    fn args(device: Option<&str>, host: Option<&str>, user: Option<&str>) -> ExecArgs {
        ExecArgs {
            device: device.map(str::to_string),
            host: host.map(str::to_string),
            user: user.map(str::to_string),
            port: 2222,
            query: None,
            commands: vec!["show version".to_string()],
        }
    }

    #[test]
    fn resolves_inventory_device() {
        let mut config = Config::default();
        config.devices.insert(
            "core-1".to_string(),
            DeviceConfig {
                host: "192.0.2.10".into(),
                username: "netops".into(),
                password: "pw".into(),
                port: 22,
                device_type: "cisco_ios".into(),
                role: Some("core".into()),
                description: None,
            },
        );

        let target = resolve_target(&args(Some("core-1"), None, None), &config).unwrap();
        assert_eq!(target.to_string(), "netops@192.0.2.10:22");

        let err = resolve_target(&args(Some("edge-9"), None, None), &config).unwrap_err();
        assert!(err.to_string().contains("Unknown device"));
    }

    #[test]
    fn ad_hoc_host_needs_user() {
        let config = Config::default();
        let target = resolve_target(&args(None, Some("10.0.0.1"), Some("admin")), &config).unwrap();
        assert_eq!(target.to_string(), "admin@10.0.0.1:2222");

        assert!(resolve_target(&args(None, Some("10.0.0.1"), None), &config).is_err());
        assert!(resolve_target(&args(None, None, None), &config).is_err());
    }
}
