//! CLI subcommand: `netguard audit`
//!
//! Lists, prints and verifies the per-session audit logs.

use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::security::{self, AuditEvent};

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// List audit sessions in the log directory
    List,

    /// Show a JSONL audit log
    Show {
        /// Path to audit_<session>.jsonl (or a session id)
        file: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Filter by event type (e.g., command_blocked, prompt_injection_detected)
        #[arg(long)]
        filter: Option<String>,
    },

    /// Verify the hash chain of a JSONL audit log
    Verify {
        /// Path to audit_<session>.jsonl (or a session id)
        file: String,
    },
}

pub async fn run(args: AuditArgs, config_path: Option<&str>) -> Result<()> {
    let config = Config::load_with_override(config_path)?;
    let log_dir = config.audit_dir();

    match args.command {
        AuditCommands::List => list_sessions(&log_dir),
        AuditCommands::Show { file, json, filter } => {
            show_audit(&resolve_log(&log_dir, &file), json, filter)
        }
        AuditCommands::Verify { file } => verify(&resolve_log(&log_dir, &file)),
    }
}

/// Accept either a path or a bare session id.
fn resolve_log(log_dir: &Path, file: &str) -> PathBuf {
    let path = PathBuf::from(shellexpand::tilde(file).to_string());
    if path.exists() || file.contains(std::path::MAIN_SEPARATOR) || file.ends_with(".jsonl") {
        path
    } else {
        log_dir.join(format!("audit_{}.jsonl", file))
    }
}

fn list_sessions(log_dir: &Path) -> Result<()> {
    let mut sessions: Vec<String> = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_prefix("audit_")
                    .and_then(|n| n.strip_suffix(".jsonl"))
                    .map(str::to_string)
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    sessions.sort();

    if sessions.is_empty() {
        println!("No audit sessions in {}", log_dir.display());
        return Ok(());
    }

    println!("Audit sessions in {}:", log_dir.display());
    for session in sessions {
        let summary = log_dir.join(format!("summary_{}.json", session));
        let marker = if summary.exists() { "" } else { " (open)" };
        println!("  {}{}", session, marker);
    }
    Ok(())
}

fn show_audit(path: &Path, json_output: bool, filter: Option<String>) -> Result<()> {
    let entries = security::read_audit_log(path)?;

    // Verify chain integrity on the full log, before filtering
    let broken = security::verify_audit_chain(path)?;

    let mut indexed: Vec<(usize, AuditEvent)> = entries.into_iter().enumerate().collect();
    if let Some(ref filter_type) = filter {
        indexed.retain(|(_, e)| e.event_type.as_str() == filter_type);
    }

    if indexed.is_empty() {
        if filter.is_some() {
            println!("No audit log entries matching filter.");
        } else {
            println!("No audit log entries.");
        }
        return Ok(());
    }

    if json_output {
        let entries: Vec<&AuditEvent> = indexed.iter().map(|(_, e)| e).collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    let label = match filter {
        Some(ref f) => format!("Audit Log ({} entries, filter: {}):", indexed.len(), f),
        None => format!("Audit Log ({} entries):", indexed.len()),
    };
    println!("{}", label);
    println!();

    for (i, entry) in &indexed {
        let chain_status = if broken.contains(i) {
            " [CHAIN BROKEN]"
        } else {
            ""
        };
        println!(
            "  {} {:<8} {} {}{}",
            entry.ts, entry.severity, entry.event_type, entry.message, chain_status
        );
    }

    println!();
    print_integrity(&broken);
    Ok(())
}

fn verify(path: &Path) -> Result<()> {
    let broken = security::verify_audit_chain(path)?;
    let total = security::read_audit_log(path)?.len();
    println!("{} ({} entries)", path.display(), total);
    print_integrity(&broken);
    if !broken.is_empty() {
        let positions: Vec<String> = broken.iter().map(|i| i.to_string()).collect();
        anyhow::bail!("Audit chain broken at entries: {}", positions.join(", "));
    }
    Ok(())
}

fn print_integrity(broken: &[usize]) {
    if broken.is_empty() {
        println!("Chain integrity: INTACT");
    } else {
        println!("Chain integrity: BROKEN at {} position(s)", broken.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_resolve_into_log_dir() {
        let dir = Path::new("/var/log/netguard");
        assert_eq!(
            resolve_log(dir, "20261019_120000_abcd1234"),
            PathBuf::from("/var/log/netguard/audit_20261019_120000_abcd1234.jsonl")
        );
        assert_eq!(
            resolve_log(dir, "/tmp/custom.jsonl"),
            PathBuf::from("/tmp/custom.jsonl")
        );
    }
}
