use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named device inventory
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub devices: BTreeMap<String, DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Longest free-text query accepted, in characters
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,

    /// Queries accepted per session before further input is refused
    #[serde(default = "default_max_queries_per_session")]
    pub max_queries_per_session: u32,

    /// Non-alphanumeric share above which a query is rejected (0.0 - 1.0)
    #[serde(default = "default_max_special_char_ratio")]
    pub max_special_char_ratio: f64,

    /// Read-only verb prefixes a command must start with
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,

    /// Substrings that reject a command anywhere they appear
    #[serde(default = "default_blocked_keywords")]
    pub blocked_keywords: Vec<String>,

    /// Output filters permitted after `|`
    #[serde(default = "default_allowed_pipe_filters")]
    pub allowed_pipe_filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Bound on a single command, separate from the connect timeout
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Benign command sent before each real one to confirm liveness
    #[serde(default = "default_liveness_probe")]
    pub liveness_probe: String,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Background liveness check interval (e.g. "60s", "5m"); empty disables it
    #[serde(default)]
    pub liveness_interval: String,

    /// SSH client binary used by the OpenSSH transport
    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,

    /// Accept unknown host keys on first connect
    #[serde(default)]
    pub accept_new_host_keys: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_commands_per_minute")]
    pub max_commands_per_minute: usize,

    #[serde(default = "default_rate_window")]
    pub rate_window_secs: u64,

    /// Device output handed back to the caller is cut at this many characters
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Human-readable audit log
    #[serde(default = "default_true")]
    pub enable_file: bool,

    /// JSONL audit log
    #[serde(default = "default_true")]
    pub enable_json: bool,

    /// Also redact private addresses and hostnames in audit sinks
    #[serde(default)]
    pub aggressive_redaction: bool,

    /// Audit directory; defaults to the state logs dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub host: String,

    pub username: String,

    /// Supports `${ENV_VAR}`; leave empty to use NETGUARD_DEVICE_PASSWORD
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_device_type")]
    pub device_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DeviceConfig {
    /// Password with `${VAR}` references expanded. The stored value keeps
    /// the reference so `save()` never writes the secret back to disk.
    pub fn resolved_password(&self) -> String {
        expand_env(&self.password)
    }
}

fn default_max_query_length() -> usize {
    500
}
fn default_max_queries_per_session() -> u32 {
    100
}
fn default_max_special_char_ratio() -> f64 {
    0.30
}
fn default_allowed_commands() -> Vec<String> {
    ["show", "display", "get", "dir", "more", "verify"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_blocked_keywords() -> Vec<String> {
    [
        "reload",
        "write",
        "erase",
        "delete",
        "no",
        "clear",
        "configure",
        "conf",
        "enable",
        "copy",
        "format",
        "shutdown",
        "boot",
        "username",
        "password",
        "crypto",
        "key",
        "certificate",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_allowed_pipe_filters() -> Vec<String> {
    ["include", "begin", "section", "exclude"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_reconnect_attempts() -> u32 {
    3
}
fn default_connection_timeout() -> u64 {
    30
}
fn default_command_timeout() -> u64 {
    60
}
fn default_liveness_probe() -> String {
    "show clock".to_string()
}
fn default_probe_timeout() -> u64 {
    10
}
fn default_ssh_command() -> String {
    "ssh".to_string()
}
fn default_max_commands_per_minute() -> usize {
    30
}
fn default_rate_window() -> u64 {
    60
}
fn default_max_output_chars() -> usize {
    20_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_ssh_port() -> u16 {
    22
}
fn default_device_type() -> String {
    "cisco_ios".to_string()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_query_length: default_max_query_length(),
            max_queries_per_session: default_max_queries_per_session(),
            max_special_char_ratio: default_max_special_char_ratio(),
            allowed_commands: default_allowed_commands(),
            blocked_keywords: default_blocked_keywords(),
            allowed_pipe_filters: default_allowed_pipe_filters(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connection_timeout_secs: default_connection_timeout(),
            command_timeout_secs: default_command_timeout(),
            liveness_probe: default_liveness_probe(),
            probe_timeout_secs: default_probe_timeout(),
            liveness_interval: String::new(),
            ssh_command: default_ssh_command(),
            accept_new_host_keys: false,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_commands_per_minute: default_max_commands_per_minute(),
            rate_window_secs: default_rate_window(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            enable_file: default_true(),
            enable_json: default_true(),
            aggressive_redaction: false,
            log_dir: None,
        }
    }
}

impl Config {
    /// Load from the default location, writing a commented template on
    /// first run.
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        let path = paths.config_file();

        if !path.exists() {
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        Self::load_from(&path, paths)
    }

    /// Load from an explicit file, or the default location when `None`.
    pub fn load_with_override(path: Option<&str>) -> Result<Self> {
        match path {
            Some(p) => {
                let expanded = PathBuf::from(shellexpand::tilde(p).to_string());
                let paths = Paths::resolve()?;
                paths.ensure_dirs()?;
                Self::load_from(&expanded, paths)
            }
            None => Self::load(),
        }
    }

    fn load_from(path: &Path, paths: Paths) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        config.paths = paths;
        Ok(config)
    }

    /// Parse TOML and clamp out-of-range values.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        for warning in config.validate() {
            warn!("{}", warning);
        }
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    /// `logging.level` straight from the file, for setting up tracing
    /// before the real load. Nothing is created, clamped or logged here.
    pub fn peek_log_level(path: Option<&str>) -> Option<String> {
        let path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
            None => Self::config_path().ok()?,
        };
        let content = fs::read_to_string(path).ok()?;
        let table: toml::Table = toml::from_str(&content).ok()?;
        table
            .get("logging")?
            .get("level")?
            .as_str()
            .map(str::to_string)
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    /// Directory the audit files go to.
    pub fn audit_dir(&self) -> PathBuf {
        match self.logging.log_dir {
            Some(ref dir) if !dir.trim().is_empty() => {
                PathBuf::from(shellexpand::tilde(dir.trim()).to_string())
            }
            _ => self.paths.logs_dir(),
        }
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.get(name)
    }

    /// Clamp invalid values back to defaults, returning what was changed.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.security.max_query_length == 0 {
            warnings.push(format!(
                "security.max_query_length must be positive, using {}",
                default_max_query_length()
            ));
            self.security.max_query_length = default_max_query_length();
        }
        if !(0.0..=1.0).contains(&self.security.max_special_char_ratio) {
            warnings.push(format!(
                "security.max_special_char_ratio must be within 0.0-1.0, using {}",
                default_max_special_char_ratio()
            ));
            self.security.max_special_char_ratio = default_max_special_char_ratio();
        }
        if self.security.allowed_commands.is_empty() {
            warnings.push("security.allowed_commands is empty, using defaults".to_string());
            self.security.allowed_commands = default_allowed_commands();
        }
        if self.connection.connection_timeout_secs == 0 {
            warnings.push(format!(
                "connection.connection_timeout_secs must be positive, using {}",
                default_connection_timeout()
            ));
            self.connection.connection_timeout_secs = default_connection_timeout();
        }
        if self.connection.command_timeout_secs == 0 {
            warnings.push(format!(
                "connection.command_timeout_secs must be positive, using {}",
                default_command_timeout()
            ));
            self.connection.command_timeout_secs = default_command_timeout();
        }
        if self.connection.probe_timeout_secs == 0 {
            warnings.push(format!(
                "connection.probe_timeout_secs must be positive, using {}",
                default_probe_timeout()
            ));
            self.connection.probe_timeout_secs = default_probe_timeout();
        }
        if self.limits.max_commands_per_minute == 0 {
            warnings.push(format!(
                "limits.max_commands_per_minute must be positive, using {}",
                default_max_commands_per_minute()
            ));
            self.limits.max_commands_per_minute = default_max_commands_per_minute();
        }
        if self.limits.rate_window_secs == 0 {
            warnings.push(format!(
                "limits.rate_window_secs must be positive, using {}",
                default_rate_window()
            ));
            self.limits.rate_window_secs = default_rate_window();
        }

        warnings
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["security", "max_query_length"] => Ok(self.security.max_query_length.to_string()),
            ["security", "max_queries_per_session"] => {
                Ok(self.security.max_queries_per_session.to_string())
            }
            ["security", "allowed_commands"] => Ok(self.security.allowed_commands.join(",")),
            ["security", "blocked_keywords"] => Ok(self.security.blocked_keywords.join(",")),
            ["connection", "max_reconnect_attempts"] => {
                Ok(self.connection.max_reconnect_attempts.to_string())
            }
            ["connection", "connection_timeout_secs"] => {
                Ok(self.connection.connection_timeout_secs.to_string())
            }
            ["connection", "command_timeout_secs"] => {
                Ok(self.connection.command_timeout_secs.to_string())
            }
            ["connection", "liveness_probe"] => Ok(self.connection.liveness_probe.clone()),
            ["limits", "max_commands_per_minute"] => {
                Ok(self.limits.max_commands_per_minute.to_string())
            }
            ["limits", "rate_window_secs"] => Ok(self.limits.rate_window_secs.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            ["logging", "aggressive_redaction"] => {
                Ok(self.logging.aggressive_redaction.to_string())
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["security", "max_query_length"] => self.security.max_query_length = value.parse()?,
            ["security", "max_queries_per_session"] => {
                self.security.max_queries_per_session = value.parse()?
            }
            ["connection", "max_reconnect_attempts"] => {
                self.connection.max_reconnect_attempts = value.parse()?
            }
            ["connection", "connection_timeout_secs"] => {
                self.connection.connection_timeout_secs = value.parse()?
            }
            ["connection", "command_timeout_secs"] => {
                self.connection.command_timeout_secs = value.parse()?
            }
            ["connection", "liveness_probe"] => {
                self.connection.liveness_probe = value.to_string()
            }
            ["limits", "max_commands_per_minute"] => {
                self.limits.max_commands_per_minute = value.parse()?
            }
            ["limits", "rate_window_secs"] => self.limits.rate_window_secs = value.parse()?,
            ["logging", "level"] => self.logging.level = value.to_string(),
            ["logging", "aggressive_redaction"] => {
                self.logging.aggressive_redaction = value.parse()?
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

fn expand_env(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else if let Some(var_name) = s.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    }
}

/// Parse a duration like "30s", "5m", "1h" (bare numbers are seconds).
pub fn parse_duration(s: &str) -> Result<std::time::Duration> {
    let s = s.trim();
    let (digits, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let n: u64 = digits
        .parse()
        .with_context(|| format!("Invalid duration: {:?}", s))?;
    let multiplier: u64 = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => anyhow::bail!("Unknown duration unit in {:?}", s),
    };
    let secs = n
        .checked_mul(multiplier)
        .with_context(|| format!("Duration out of range: {:?}", s))?;
    Ok(std::time::Duration::from_secs(secs))
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# netguard configuration
# Auto-created on first run. Edit as needed.

[security]
max_query_length = 500
max_queries_per_session = 100
max_special_char_ratio = 0.30
allowed_commands = ["show", "display", "get", "dir", "more", "verify"]
blocked_keywords = [
  "reload", "write", "erase", "delete", "no", "clear",
  "configure", "conf", "enable", "copy", "format",
  "shutdown", "boot", "username", "password",
  "crypto", "key", "certificate",
]
allowed_pipe_filters = ["include", "begin", "section", "exclude"]

[connection]
max_reconnect_attempts = 3
connection_timeout_secs = 30
command_timeout_secs = 60
liveness_probe = "show clock"
probe_timeout_secs = 10
# liveness_interval = "60s"          # background probe; unset disables it
ssh_command = "ssh"
accept_new_host_keys = false

[limits]
max_commands_per_minute = 30
rate_window_secs = 60
max_output_chars = 20000

[logging]
level = "info"
enable_file = true
enable_json = true
aggressive_redaction = false
# log_dir = "~/.local/state/netguard/logs"

# Device inventory (optional)
# [devices.core-sw1]
# host = "10.0.0.1"
# username = "netops"
# password = "${CORE_SW1_PASSWORD}"
# port = 22
# role = "core"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_is_read_without_side_effects() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        let content = "[logging]\nlevel = \"warn\"\n\n[limits]\nmax_commands_per_minute = 0\n";
        fs::write(&path, content).unwrap();

        let level = Config::peek_log_level(path.to_str());
        assert_eq!(level.as_deref(), Some("warn"));
        assert_eq!(fs::read_to_string(&path).unwrap(), content);

        let missing = tmp.path().join("absent.toml");
        assert_eq!(Config::peek_log_level(missing.to_str()), None);
        assert!(!missing.exists());

        fs::write(&path, "[logging]\nenable_json = false\n").unwrap();
        assert_eq!(Config::peek_log_level(path.to_str()), None);
    }

    #[test]
    fn defaults_match_read_only_policy() {
        let config = Config::default();
        assert_eq!(config.security.max_query_length, 500);
        assert_eq!(config.security.max_queries_per_session, 100);
        assert_eq!(config.security.allowed_commands.len(), 6);
        assert!(config.security.blocked_keywords.contains(&"reload".to_string()));
        assert_eq!(config.connection.max_reconnect_attempts, 3);
        assert_eq!(config.connection.connection_timeout_secs, 30);
        assert_eq!(config.connection.command_timeout_secs, 60);
        assert_eq!(config.limits.max_commands_per_minute, 30);
        assert_eq!(config.limits.rate_window_secs, 60);
        assert!(config.logging.enable_json);
    }

    #[test]
    fn template_parses_to_defaults() {
        let config = Config::parse(DEFAULT_CONFIG_TEMPLATE).unwrap();
        let defaults = Config::default();
        assert_eq!(
            config.security.blocked_keywords,
            defaults.security.blocked_keywords
        );
        assert_eq!(
            config.security.allowed_pipe_filters,
            defaults.security.allowed_pipe_filters
        );
        assert_eq!(config.connection.liveness_probe, "show clock");
        assert!(config.devices.is_empty());
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let config = Config::parse(
            r#"
            [security]
            max_query_length = 200

            [limits]
            max_commands_per_minute = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.security.max_query_length, 200);
        assert_eq!(config.security.allowed_commands[0], "show");
        assert_eq!(config.limits.max_commands_per_minute, 10);
        assert_eq!(config.limits.rate_window_secs, 60);
    }

    #[test]
    fn invalid_values_are_clamped() {
        let config = Config::parse(
            r#"
            [security]
            max_query_length = 0
            max_special_char_ratio = 4.0
            allowed_commands = []

            [connection]
            command_timeout_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.security.max_query_length, 500);
        assert_eq!(config.security.max_special_char_ratio, 0.30);
        assert_eq!(config.security.allowed_commands.len(), 6);
        assert_eq!(config.connection.command_timeout_secs, 60);
    }

    #[test]
    fn device_inventory_with_env_password() {
        // SAFETY: test-only env var with a unique name
        unsafe { std::env::set_var("NETGUARD_TEST_EDGE_PW", "s3cret") };
        let config = Config::parse(
            r#"
            [devices.edge1]
            host = "192.0.2.10"
            username = "netops"
            password = "${NETGUARD_TEST_EDGE_PW}"
            role = "edge"
            "#,
        )
        .unwrap();
        let device = config.device("edge1").unwrap();
        assert_eq!(device.host, "192.0.2.10");
        assert_eq!(device.resolved_password(), "s3cret");
        assert_eq!(device.password, "${NETGUARD_TEST_EDGE_PW}");
        assert_eq!(device.port, 22);
        assert_eq!(device.device_type, "cisco_ios");
        assert!(config.device("missing").is_none());
    }

    #[test]
    fn get_and_set_values() {
        let mut config = Config::default();
        config.set_value("limits.max_commands_per_minute", "12").unwrap();
        assert_eq!(config.get_value("limits.max_commands_per_minute").unwrap(), "12");
        config.set_value("connection.liveness_probe", "show version").unwrap();
        assert_eq!(
            config.get_value("connection.liveness_probe").unwrap(),
            "show version"
        );
        assert!(config.get_value("nope.key").is_err());
        assert!(config.set_value("limits.rate_window_secs", "abc").is_err());
    }

    #[test]
    fn parses_durations() {
        use std::time::Duration;
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("99999999999999999h").is_err());
        assert!(parse_duration("18446744073709551615m").is_err());
        assert_eq!(
            parse_duration("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn audit_dir_override() {
        let mut config = Config::default();
        assert!(config.audit_dir().ends_with("logs"));
        config.logging.log_dir = Some("/var/log/netguard".to_string());
        assert_eq!(config.audit_dir(), PathBuf::from("/var/log/netguard"));
    }
}
