//! Per-session audit trail with tamper-evident JSONL.
//!
//! Each [`AuditLogger`] owns one session and writes up to three files into
//! the log directory:
//!
//! | File | Content |
//! |------|---------|
//! | `audit_<session>.log` | `ts \| LEVEL \| [EVENT_TYPE] message \| k=v ...` |
//! | `audit_<session>.jsonl` | one [`AuditEvent`] per line, hash-chained |
//! | `summary_<session>.json` | [`SessionSummary`], written once on close |
//!
//! # Chain Integrity
//!
//! The first JSONL entry uses `000...000` (64 zeros) as `prev_entry_sha256`.
//! Every subsequent entry hashes the raw bytes of the previous line, so
//! editing or deleting a line breaks every link after it.
//!
//! # Redaction
//!
//! The message and every field go through the redactor before reaching
//! any sink, including the `tracing` mirror. Nothing the caller passes in
//! is written verbatim.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::redact::{redact, redact_structured_with};
use crate::config::LoggingConfig;

/// The hash used for the first entry in the chain (no predecessor).
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What happened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SessionStart,
    SessionEnd,
    /// Query passed validation.
    QueryAccepted,
    ValidationFailure,
    /// Query matched a prompt-injection heuristic.
    PromptInjectionDetected,
    RateLimitExceeded,
    /// Per-session query budget exhausted.
    SessionLimitReached,
    CommandAuthorized,
    CommandBlocked,
    CommandExecuted,
    CommandFailed,
    ConnectionEstablished,
    ConnectionFailed,
    ConnectionLost,
    ReconnectAttempt,
    Disconnected,
    /// Previous JSONL entry corrupted, new chain segment started.
    ChainRecovery,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::QueryAccepted => "query_accepted",
            Self::ValidationFailure => "validation_failure",
            Self::PromptInjectionDetected => "prompt_injection_detected",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::SessionLimitReached => "session_limit_reached",
            Self::CommandAuthorized => "command_authorized",
            Self::CommandBlocked => "command_blocked",
            Self::CommandExecuted => "command_executed",
            Self::CommandFailed => "command_failed",
            Self::ConnectionEstablished => "connection_established",
            Self::ConnectionFailed => "connection_failed",
            Self::ConnectionLost => "connection_lost",
            Self::ReconnectAttempt => "reconnect_attempt",
            Self::Disconnected => "disconnected",
            Self::ChainRecovery => "chain_recovery",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // pad so the text log columns line up
        f.pad(self.as_str())
    }
}

/// One JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// RFC 3339 timestamp.
    pub ts: String,
    pub session_id: String,
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    /// SHA-256 of the previous JSONL line (chain link, hex-encoded).
    pub prev_entry_sha256: String,
}

/// Aggregate record written when the session closes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_seconds: f64,
    pub event_counts: BTreeMap<String, u64>,
    pub total_events: u64,
}

/// Where and how events are persisted.
#[derive(Debug, Clone, Default)]
pub struct AuditSettings {
    /// `None` keeps counters and the tracing mirror only.
    pub log_dir: Option<PathBuf>,
    pub text_log: bool,
    pub json_log: bool,
    /// Also redact private addresses and hostnames.
    pub aggressive_redaction: bool,
}

impl AuditSettings {
    pub fn from_config(config: &LoggingConfig, log_dir: PathBuf) -> Self {
        Self {
            log_dir: Some(log_dir),
            text_log: config.enable_file,
            json_log: config.enable_json,
            aggressive_redaction: config.aggressive_redaction,
        }
    }

    /// Counters and tracing only, no files.
    pub fn memory_only() -> Self {
        Self::default()
    }
}

struct AuditState {
    counts: BTreeMap<AuditEventType, u64>,
    last_hash: String,
    summary: Option<SessionSummary>,
}

/// Thread-safe event sink for one session.
///
/// Share it as `Arc<AuditLogger>`; every write is serialized through an
/// internal mutex so lines never interleave.
pub struct AuditLogger {
    session_id: String,
    started: Instant,
    started_at: DateTime<Utc>,
    text_path: Option<PathBuf>,
    json_path: Option<PathBuf>,
    summary_path: Option<PathBuf>,
    aggressive: bool,
    state: Mutex<AuditState>,
    closing: Mutex<()>,
}

impl fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLogger")
            .field("session_id", &self.session_id)
            .field("text_path", &self.text_path)
            .field("json_path", &self.json_path)
            .finish_non_exhaustive()
    }
}

impl AuditLogger {
    /// Start a new session with a fresh id and log `session_start`.
    pub fn new(settings: AuditSettings) -> Result<Self> {
        Self::with_session_id(new_session_id(), settings)
    }

    /// Start (or continue) the session `session_id`.
    ///
    /// If its JSONL file already exists, the chain continues from the last
    /// line; a corrupted last line gets a `chain_recovery` entry first.
    pub fn with_session_id(session_id: String, settings: AuditSettings) -> Result<Self> {
        let (text_path, json_path, summary_path) = match settings.log_dir {
            Some(ref dir) => {
                fs::create_dir_all(dir).with_context(|| {
                    format!("Failed to create audit directory: {}", dir.display())
                })?;
                (
                    settings
                        .text_log
                        .then(|| dir.join(format!("audit_{}.log", session_id))),
                    settings
                        .json_log
                        .then(|| dir.join(format!("audit_{}.jsonl", session_id))),
                    Some(dir.join(format!("summary_{}.json", session_id))),
                )
            }
            None => (None, None, None),
        };

        let last_hash = match json_path {
            Some(ref path) => chain_head(path, &session_id)?,
            None => GENESIS_HASH.to_string(),
        };

        let logger = Self {
            session_id,
            started: Instant::now(),
            started_at: Utc::now(),
            text_path,
            json_path,
            summary_path,
            aggressive: settings.aggressive_redaction,
            state: Mutex::new(AuditState {
                counts: BTreeMap::new(),
                last_hash,
                summary: None,
            }),
            closing: Mutex::new(()),
        };

        logger.log_event(
            AuditEventType::SessionStart,
            "Audit session started",
            Severity::Info,
            Value::Null,
        );

        Ok(logger)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn text_path(&self) -> Option<&Path> {
        self.text_path.as_deref()
    }

    pub fn json_path(&self) -> Option<&Path> {
        self.json_path.as_deref()
    }

    pub fn summary_path(&self) -> Option<&Path> {
        self.summary_path.as_deref()
    }

    /// Record one event.
    ///
    /// `fields` should be a JSON object; anything else is stored under
    /// `"value"`. Sink failures are reported through `tracing` and never
    /// reach the caller.
    pub fn log_event(
        &self,
        event_type: AuditEventType,
        message: &str,
        severity: Severity,
        fields: Value,
    ) {
        let message = redact(message, self.aggressive);
        let fields = match redact_structured_with(&fields, self.aggressive) {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("value".to_string(), other)]),
        };

        mirror_to_tracing(&self.session_id, event_type, severity, &message, &fields);

        let mut state = self.lock();
        *state.counts.entry(event_type).or_insert(0) += 1;

        if let Some(ref path) = self.text_path {
            let line = format_text_line(event_type, severity, &message, &fields);
            if let Err(e) = append_line(path, &line) {
                warn!("Audit text sink failed: {:#}", e);
            }
        }

        if let Some(ref path) = self.json_path {
            let event = AuditEvent {
                ts: Utc::now().to_rfc3339(),
                session_id: self.session_id.clone(),
                event_type,
                severity,
                message,
                fields,
                prev_entry_sha256: state.last_hash.clone(),
            };
            match serde_json::to_string(&event)
                .context("Failed to serialize audit event")
                .and_then(|json| append_line(path, &json).map(|_| json))
            {
                Ok(json) => state.last_hash = sha256_hex(json.as_bytes()),
                Err(e) => warn!("Audit JSON sink failed: {:#}", e),
            }
        }
    }

    /// Count of one event type so far.
    pub fn count(&self, event_type: AuditEventType) -> u64 {
        self.lock().counts.get(&event_type).copied().unwrap_or(0)
    }

    /// Snapshot of every per-type counter.
    pub fn counts(&self) -> BTreeMap<AuditEventType, u64> {
        self.lock().counts.clone()
    }

    pub fn total_events(&self) -> u64 {
        self.lock().counts.values().sum()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().summary.is_some()
    }

    /// Log `session_end` and write the session summary.
    ///
    /// Only the first call does anything; later calls return the same
    /// summary.
    pub fn close(&self) -> Result<SessionSummary> {
        let _closing = self.closing.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(summary) = self.lock().summary.clone() {
            return Ok(summary);
        }

        let duration = self.started.elapsed().as_secs_f64();
        self.log_event(
            AuditEventType::SessionEnd,
            "Audit session ended",
            Severity::Info,
            serde_json::json!({ "duration_seconds": (duration * 100.0).round() / 100.0 }),
        );

        let mut state = self.lock();
        let summary = SessionSummary {
            session_id: self.session_id.clone(),
            started_at: self.started_at.to_rfc3339(),
            ended_at: Utc::now().to_rfc3339(),
            duration_seconds: duration,
            event_counts: state
                .counts
                .iter()
                .map(|(t, n)| (t.as_str().to_string(), *n))
                .collect(),
            total_events: state.counts.values().sum(),
        };
        state.summary = Some(summary.clone());
        drop(state);

        if let Some(ref path) = self.summary_path {
            let json = serde_json::to_string_pretty(&summary)
                .context("Failed to serialize session summary")?;
            fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            debug!("Session summary written to {}", path.display());
        }

        Ok(summary)
    }

    fn lock(&self) -> MutexGuard<'_, AuditState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        if !self.is_closed()
            && let Err(e) = self.close()
        {
            error!("Failed to close audit session {}: {:#}", self.session_id, e);
        }
    }
}

/// `YYYYmmdd_HHMMSS_<8 hex>`
pub fn new_session_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Local::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
}

fn mirror_to_tracing(
    session_id: &str,
    event_type: AuditEventType,
    severity: Severity,
    message: &str,
    fields: &Map<String, Value>,
) {
    let event = event_type.as_str();
    let fields = Value::Object(fields.clone());
    match severity {
        Severity::Debug => debug!(session_id, event, %fields, "{}", message),
        Severity::Info => info!(session_id, event, %fields, "{}", message),
        Severity::Warning => warn!(session_id, event, %fields, "{}", message),
        Severity::Error | Severity::Critical => {
            error!(session_id, event, %fields, "{}", message)
        }
    }
}

fn format_text_line(
    event_type: AuditEventType,
    severity: Severity,
    message: &str,
    fields: &Map<String, Value>,
) -> String {
    let mut line = format!(
        "{} | {:<8} | [{}] {}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        severity,
        event_type.as_str().to_uppercase(),
        message
    );
    for (key, value) in fields {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        line.push_str(&format!(" | {}={}", key, rendered));
    }
    line
}

/// Hash to chain the next entry from, recovering from a corrupt tail.
fn chain_head(path: &Path, session_id: &str) -> Result<String> {
    if !path.exists() {
        return Ok(GENESIS_HASH.to_string());
    }

    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    match content.lines().rfind(|l| !l.is_empty()) {
        Some(last_line) if serde_json::from_str::<AuditEvent>(last_line).is_ok() => {
            Ok(sha256_hex(last_line.as_bytes()))
        }
        Some(last_line) => {
            let recovery = AuditEvent {
                ts: Utc::now().to_rfc3339(),
                session_id: session_id.to_string(),
                event_type: AuditEventType::ChainRecovery,
                severity: Severity::Warning,
                message: format!(
                    "Previous entry corrupted ({} bytes), new chain segment",
                    last_line.len()
                ),
                fields: Map::new(),
                prev_entry_sha256: sha256_hex(last_line.as_bytes()),
            };
            let json =
                serde_json::to_string(&recovery).context("Failed to serialize recovery entry")?;
            append_line(path, &json)?;
            warn!("Audit chain recovered at {}", path.display());
            Ok(sha256_hex(json.as_bytes()))
        }
        None => Ok(GENESIS_HASH.to_string()),
    }
}

/// Append a single line to a file.
fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "{}", line).context("Failed to write audit entry")?;
    Ok(())
}

/// Read and parse all entries from a JSONL audit file.
///
/// Corrupted lines are skipped. A missing file reads as empty.
pub fn read_audit_log(path: &Path) -> Result<Vec<AuditEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    Ok(content
        .lines()
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str::<AuditEvent>(l).ok())
        .collect())
}

/// Verify the hash chain of a JSONL audit file.
///
/// Returns the line indices where `prev_entry_sha256` does not match the
/// SHA-256 of the previous line. Corrupted lines count as broken. An empty
/// result means the chain is intact.
pub fn verify_audit_chain(path: &Path) -> Result<Vec<usize>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

    let mut broken = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Ok(entry) = serde_json::from_str::<AuditEvent>(line) else {
            broken.push(i);
            continue;
        };
        let expected = match i {
            0 => GENESIS_HASH.to_string(),
            _ => sha256_hex(lines[i - 1].as_bytes()),
        };
        if entry.prev_entry_sha256 != expected {
            broken.push(i);
        }
    }

    Ok(broken)
}

/// Compute hex-encoded SHA-256.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
