//! Free-text query screening.
//!
//! [`InputValidator::validate`] decides whether a query may reach the
//! planning layer at all; [`InputValidator::sanitize`] cleans a query that
//! already passed.
//!
//! The suspicious-pattern list is a heuristic for prompt injection and is
//! incomplete on purpose: rephrasings such as "ignore all prior
//! instructions" or spaced-out letters get through. Callers rely on the
//! exact accept/reject behavior, so coverage is not widened here.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;

use super::redact::redact;
use crate::config::SecurityConfig;

pub const DEFAULT_MAX_QUERY_LENGTH: usize = 500;

/// Share of non-alphanumeric, non-whitespace characters above which a
/// query is treated as an obfuscated payload.
pub const DEFAULT_MAX_SPECIAL_CHAR_RATIO: f64 = 0.30;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Query is empty")]
    Empty,

    #[error("Query too long ({length} characters), maximum allowed: {max} characters")]
    TooLong { length: usize, max: usize },

    #[error("Query contains blocked content ({rule})")]
    BlockedContent { rule: &'static str },

    #[error("Query matches suspicious patterns: {}", .patterns.join(", "))]
    SuspiciousPattern { patterns: Vec<&'static str> },

    #[error(
        "Query contains too many special characters ({:.0}% of input, limit {:.0}%)",
        .ratio * 100.0,
        .limit * 100.0
    )]
    SpecialChars { ratio: f64, limit: f64 },
}

impl ValidationError {
    pub fn category(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::TooLong { .. } => "too_long",
            Self::BlockedContent { .. } => "blocked_content",
            Self::SuspiciousPattern { .. } => "suspicious_pattern",
            Self::SpecialChars { .. } => "special_chars",
        }
    }

    /// Prompt-injection signals are audited separately from plain rejects.
    pub fn is_injection_signal(&self) -> bool {
        matches!(self, Self::SuspiciousPattern { .. })
    }
}

/// Always-fatal content.
static BLOCKED_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (Regex::new(r"<\s*/?\s*[A-Za-z][^>]*>").unwrap(), "markup_tag"),
        (
            Regex::new(r"(?i)\b(?:javascript|vbscript)\s*:|\bdata:text/html").unwrap(),
            "script_uri",
        ),
        (Regex::new(r"\.\./|\.\.\\").unwrap(), "path_traversal"),
        (Regex::new(r"\x00").unwrap(), "null_byte"),
        (
            Regex::new(r"(?i)\b(?:eval|exec|__import__|os\.system|subprocess\.\w+)\s*\(|\$\(")
                .unwrap(),
            "code_execution",
        ),
    ]
});

/// Prompt-injection heuristics, reported by label.
static SUSPICIOUS_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)ignore\s+(?:all\s+)?previous\s+instructions").unwrap(),
            "ignore_previous_instructions",
        ),
        (
            Regex::new(r"(?i)system\s*:\s*you\s+are\s+now").unwrap(),
            "system_role_override",
        ),
        (
            Regex::new(r"(?i)(?:system\s*:\s*)?override\s+security").unwrap(),
            "override_security",
        ),
        (
            Regex::new(r"(?i)bypass\s+validation").unwrap(),
            "bypass_validation",
        ),
        (
            Regex::new(r"(?i)new\s+instructions\s*:").unwrap(),
            "new_instructions",
        ),
        (
            Regex::new(r"(?i)\bexecute\s*:|\bexecute\s+command|\brun\s+command\s*:").unwrap(),
            "execute_directive",
        ),
        (Regex::new(r"(?i)\breload\b").unwrap(), "destructive_reload"),
        (
            Regex::new(r"(?i)\bconfigure\s+terminal\b|\bconf\s+t\b").unwrap(),
            "config_mode",
        ),
        (
            Regex::new(r"(?i)\bcopy\s+running").unwrap(),
            "destructive_copy",
        ),
        (
            Regex::new(r"(?i)\bwrite\s+erase\b|\berase\s+startup").unwrap(),
            "destructive_erase",
        ),
        (
            Regex::new(
                r"(?i)\bno\s+(?:ip|ipv6|shutdown|router|interface|vlan|access-list|service|logging|snmp-server|username|enable|aaa)\b",
            )
            .unwrap(),
            "config_negation",
        ),
        (
            Regex::new(r"(?i)\benable\s+secret\b").unwrap(),
            "enable_secret",
        ),
        (Regex::new(r"<!--").unwrap(), "html_comment"),
        (Regex::new(r"```").unwrap(), "markdown_fence"),
        (
            Regex::new(r"(?i)###\s*new\b").unwrap(),
            "markdown_section_override",
        ),
    ]
});

static MARKUP_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

#[derive(Debug, Clone)]
pub struct InputValidator {
    max_length: usize,
    max_special_ratio: f64,
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUERY_LENGTH)
    }
}

impl InputValidator {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            max_special_ratio: DEFAULT_MAX_SPECIAL_CHAR_RATIO,
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self {
            max_length: config.max_query_length,
            max_special_ratio: config.max_special_char_ratio,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Screen a free-text query. Checks run in a fixed order and the first
    /// failure wins.
    pub fn validate(&self, query: &str) -> Result<(), ValidationError> {
        if query.trim().is_empty() {
            return Err(ValidationError::Empty);
        }

        let length = query.chars().count();
        if length > self.max_length {
            return Err(ValidationError::TooLong {
                length,
                max: self.max_length,
            });
        }

        if let Some(rule) = BLOCKED_PATTERNS
            .iter()
            .find(|(re, _)| re.is_match(query))
            .map(|(_, rule)| *rule)
        {
            debug!(rule, query = %preview(query), "Blocked content in query");
            return Err(ValidationError::BlockedContent { rule });
        }

        let patterns = suspicious_patterns(query);
        if !patterns.is_empty() {
            debug!(?patterns, query = %preview(query), "Suspicious query");
            return Err(ValidationError::SuspiciousPattern { patterns });
        }

        let ratio = special_char_ratio(query);
        if ratio > self.max_special_ratio {
            return Err(ValidationError::SpecialChars {
                ratio,
                limit: self.max_special_ratio,
            });
        }

        Ok(())
    }

    /// Clean an accepted query. Idempotent.
    pub fn sanitize(&self, query: &str) -> String {
        sanitize(query)
    }
}

/// Labels of every suspicious pattern that matches `query`.
pub fn suspicious_patterns(query: &str) -> Vec<&'static str> {
    SUSPICIOUS_PATTERNS
        .iter()
        .filter(|(re, _)| re.is_match(query))
        .map(|(_, label)| *label)
        .collect()
}

/// Share of characters that are neither alphanumeric nor whitespace.
pub fn special_char_ratio(query: &str) -> f64 {
    let total = query.chars().count();
    if total == 0 {
        return 0.0;
    }
    let special = query
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count();
    special as f64 / total as f64
}

/// Strip nulls and markup, swap backticks for quotes, collapse whitespace
/// and long runs of repeated symbols.
pub fn sanitize(query: &str) -> String {
    let without_nulls: String = query.chars().filter(|&c| c != '\0').collect();
    let without_tags = MARKUP_TAG.replace_all(&without_nulls, "");
    let quoted = without_tags.replace('`', "'");
    let collapsed = quoted.split_whitespace().collect::<Vec<_>>().join(" ");
    collapse_symbol_runs(&collapsed).trim().to_string()
}

/// Shorten runs of 4 or more identical non-word characters to 2.
fn collapse_symbol_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        let mut run = 1;
        while chars.peek() == Some(&c) {
            chars.next();
            run += 1;
        }
        let is_word = c.is_alphanumeric() || c == '_';
        let keep = if !is_word && run >= 4 { 2 } else { run };
        out.extend(std::iter::repeat_n(c, keep));
    }

    out
}

/// Redacted, bounded rendering of a rejected query for diagnostics.
fn preview(query: &str) -> String {
    let cleaned = redact(query, false);
    let mut preview: String = cleaned.chars().take(80).collect();
    if cleaned.chars().count() > 80 {
        preview.push_str("...");
    }
    preview
}
