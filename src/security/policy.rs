//! Lexical read-only command policy.
//!
//! [`CommandPolicy::authorize`] runs a fixed sequence of checks over a
//! single command string. The order decides which rejection a caller sees
//! for a command that breaks several rules, so it must not change:
//!
//! 1. Empty or whitespace-only → [`PolicyViolation::Empty`]
//! 2. `;` anywhere → [`PolicyViolation::ChainingDetected`], whatever else
//!    the command contains
//! 3. Blocked keyword anywhere (case-insensitive substring) →
//!    [`PolicyViolation::BlockedKeyword`], even after an allowed verb
//! 4. No allowed verb prefix → [`PolicyViolation::NoAllowedPrefix`]
//! 5. A `|` not followed by an allowed output filter →
//!    [`PolicyViolation::UnsupportedPipe`]
//!
//! Matching is purely lexical. Substring keywords over-block harmless
//! tokens (`conf` inside `running-config`) and can be dodged with
//! obfuscation; both are accepted limitations.

use thiserror::Error;

use crate::config::SecurityConfig;

/// A command that passed every policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    raw: String,
    normalized: String,
}

impl Command {
    pub fn new(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            normalized: raw.trim().to_lowercase(),
        }
    }

    /// Text exactly as the caller supplied it.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Trimmed, lower-cased form used for matching.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Trimmed text in its original case; this is what goes to the device.
    pub fn as_sent(&self) -> &str {
        self.raw.trim()
    }
}

/// Why a command was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("Command is empty")]
    Empty,

    #[error("Command contains blocked keyword '{keyword}'")]
    BlockedKeyword { keyword: String },

    #[error("Command must start with one of: {allowed}")]
    NoAllowedPrefix { allowed: String },

    #[error("Command chaining with ';' is not allowed")]
    ChainingDetected,

    #[error("Unsupported pipe usage; allowed filters after '|': {allowed}")]
    UnsupportedPipe { allowed: String },
}

impl PolicyViolation {
    /// Stable category tag for audit records.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::BlockedKeyword { .. } => "blocked_keyword",
            Self::NoAllowedPrefix { .. } => "no_allowed_prefix",
            Self::ChainingDetected => "chaining_detected",
            Self::UnsupportedPipe { .. } => "unsupported_pipe",
        }
    }
}

/// Immutable rule set: allowed verbs, blocked keywords, pipe filters.
#[derive(Debug, Clone)]
pub struct PolicyRuleSet {
    allowed_prefixes: Vec<String>,
    blocked_keywords: Vec<String>,
    pipe_filters: Vec<String>,
}

impl PolicyRuleSet {
    pub fn new<P, K, F>(allowed_prefixes: P, blocked_keywords: K, pipe_filters: F) -> Self
    where
        P: IntoIterator,
        P::Item: AsRef<str>,
        K: IntoIterator,
        K::Item: AsRef<str>,
        F: IntoIterator,
        F::Item: AsRef<str>,
    {
        Self {
            allowed_prefixes: normalize_all(allowed_prefixes),
            blocked_keywords: normalize_all(blocked_keywords),
            pipe_filters: normalize_all(pipe_filters),
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(
            &config.allowed_commands,
            &config.blocked_keywords,
            &config.allowed_pipe_filters,
        )
    }

    pub fn allowed_prefixes(&self) -> &[String] {
        &self.allowed_prefixes
    }

    pub fn blocked_keywords(&self) -> &[String] {
        &self.blocked_keywords
    }

    pub fn pipe_filters(&self) -> &[String] {
        &self.pipe_filters
    }
}

impl Default for PolicyRuleSet {
    fn default() -> Self {
        Self::from_config(&SecurityConfig::default())
    }
}

fn normalize_all<I>(items: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    items
        .into_iter()
        .map(|s| s.as_ref().trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Allow/block decisions over single command strings.
#[derive(Debug, Clone, Default)]
pub struct CommandPolicy {
    rules: PolicyRuleSet,
}

impl CommandPolicy {
    pub fn new(rules: PolicyRuleSet) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &PolicyRuleSet {
        &self.rules
    }

    /// Decide whether `command` may be sent to the device.
    ///
    /// Checks run in a fixed order and the first failure is reported:
    /// empty, `;` chaining, blocked keyword, allowed prefix, pipe filters.
    /// Chaining comes before the keyword scan, so `reload; show version`
    /// is refused as `chaining_detected` even though it also names a
    /// blocked keyword.
    pub fn authorize(&self, command: &str) -> Result<Command, PolicyViolation> {
        let command = Command::new(command);
        let normalized = command.normalized();

        if normalized.is_empty() {
            return Err(PolicyViolation::Empty);
        }

        if normalized.contains(';') {
            return Err(PolicyViolation::ChainingDetected);
        }

        if let Some(keyword) = self
            .rules
            .blocked_keywords
            .iter()
            .find(|k| normalized.contains(k.as_str()))
        {
            return Err(PolicyViolation::BlockedKeyword {
                keyword: keyword.clone(),
            });
        }

        if !self
            .rules
            .allowed_prefixes
            .iter()
            .any(|p| normalized.starts_with(p.as_str()))
        {
            return Err(PolicyViolation::NoAllowedPrefix {
                allowed: self.rules.allowed_prefixes.join(", "),
            });
        }

        if !self.pipes_allowed(normalized) {
            return Err(PolicyViolation::UnsupportedPipe {
                allowed: self.rules.pipe_filters.join(", "),
            });
        }

        Ok(command)
    }

    /// Every `|` must be followed by a whole-word allowed filter.
    fn pipes_allowed(&self, normalized: &str) -> bool {
        normalized.split('|').skip(1).all(|segment| {
            segment
                .split_whitespace()
                .next()
                .is_some_and(|filter| self.rules.pipe_filters.iter().any(|f| f == filter))
        })
    }
}
