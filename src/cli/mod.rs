pub mod audit;
pub mod check;
pub mod config;
pub mod devices;
pub mod exec;
pub mod paths;
pub mod redact;
pub mod validate;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "netguard")]
#[command(
    author,
    version,
    about = "Security gatekeeper between natural-language automation and network devices"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "NETGUARD_CONFIG")]
    pub config: Option<String>,

    /// Diagnostic log format (written to stderr)
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check commands against the read-only policy
    Check(check::CheckArgs),

    /// Screen a free-text query for injection attempts
    Validate(validate::ValidateArgs),

    /// Redact secrets from text (argument or stdin)
    Redact(redact::RedactArgs),

    /// Run commands on a device through the full gatekeeper pipeline
    Exec(exec::ExecArgs),

    /// Inspect and verify audit logs
    Audit(audit::AuditArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// List the configured device inventory
    Devices,

    /// Show resolved XDG directory paths
    Paths,
}
