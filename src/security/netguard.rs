//! # netguard Security Module
//!
//! Every check that stands between a natural-language caller and a live
//! device lives behind this facade. All security-critical types,
//! constants, and functions are re-exported here.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  netguard.rs (you are here)                      │
//! │                  Public API facade & documentation               │
//! ├────────────────┬───────────────┬───────────────┬────────────────┤
//! │  validator.rs  │  policy.rs    │ rate_limit.rs │  redact.rs     │
//! │  Length, block │  Read-only    │ Sliding-window│  Secrets and   │
//! │  list, prompt- │  verb prefix, │ admission per │  (optionally)  │
//! │  injection     │  keyword and  │ session       │  addresses out │
//! │  heuristics    │  pipe checks  │               │  of any text   │
//! ├────────────────┴───────────────┴───────────────┴────────────────┤
//! │  audit.rs - per-session text + hash-chained JSONL + summary     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! 1. **Read-only by construction**: A command reaches the device only
//!    after it starts with an allowed verb, contains no blocked keyword,
//!    no `;`, and pipes only into known output filters.
//!
//! 2. **Fail closed**: Every rejection is a typed error. Nothing falls
//!    through to the device on an unexpected input.
//!
//! 3. **Heuristic, not proof**: Query screening is pattern matching. It
//!    raises the cost of prompt injection and records the attempt; the
//!    command policy is the enforcement point.
//!
//! 4. **Nothing secret on disk**: Audit messages and fields are redacted
//!    before any sink sees them, the `tracing` mirror included.
//!
//! 5. **Tamper-evident**: Each JSONL audit line carries the SHA-256 of
//!    the line before it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use netguard::security::{CommandPolicy, InputValidator, redact_output};
//!
//! InputValidator::default().validate("show me the interface status")?;
//! let command = CommandPolicy::default().authorize("show ip interface brief")?;
//! let output = session.execute(command.as_sent()).await?;
//! println!("{}", redact_output(&output, 20_000, false));
//! ```
//!
//! ## File Hierarchy
//!
//! ```text
//! ~/.local/state/netguard/logs/
//! ├── audit_<session>.log                    # Human-readable audit trail
//! ├── audit_<session>.jsonl                  # Hash-chained audit events
//! └── summary_<session>.json                 # Written on session close
//! ```
//!
//! ## Threat Model
//!
//! | Threat | Defense Layer |
//! |--------|--------------|
//! | "Ignore previous instructions" style queries | Suspicious pattern screening |
//! | Markup, script URIs, traversal in queries | Blocked pattern screening |
//! | Model emits `reload` / `write` / `conf t` | Blocked keywords + verb prefix |
//! | `show x; reload` chaining | `;` rejected outright |
//! | `show run \| tee flash:` | Pipe filter allow-list |
//! | Runaway command loop | Sliding-window rate limit + query budget |
//! | Secrets echoed back from `show run` | Output redaction |
//! | Secrets leaking into logs | Redaction before every audit sink |
//! | Audit log edited after the fact | Hash chain + `audit verify` |

// ── Input Validation ────────────────────────────────────────────────

pub use super::validator::{
    DEFAULT_MAX_QUERY_LENGTH, DEFAULT_MAX_SPECIAL_CHAR_RATIO, InputValidator, ValidationError,
    sanitize, special_char_ratio, suspicious_patterns,
};

// ── Command Policy ──────────────────────────────────────────────────

pub use super::policy::{Command, CommandPolicy, PolicyRuleSet, PolicyViolation};

// ── Rate Limiting ───────────────────────────────────────────────────

pub use super::rate_limit::{RateLimitExceeded, RateLimiter};

// ── Redaction ───────────────────────────────────────────────────────

pub use super::redact::{
    API_KEY_TOKEN, HOSTNAME_TOKEN, IP_TOKEN, KEY_TOKEN, PASSWORD_TOKEN, RedactionCategory,
    RedactionReport, SECRET_TOKEN, SNMP_COMMUNITY_TOKEN, STRUCTURED_TOKEN, is_sensitive_key,
    mask_api_key, mask_password, redact, redact_output, redact_report, redact_structured,
    redact_structured_with,
};

// ── Audit Log ───────────────────────────────────────────────────────

pub use super::audit::{
    AuditEvent, AuditEventType, AuditLogger, AuditSettings, GENESIS_HASH, SessionSummary,
    Severity, new_session_id, read_audit_log, sha256_hex, verify_audit_chain,
};
