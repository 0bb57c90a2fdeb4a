//! Sensitive-data redaction.
//!
//! Everything that leaves the trust boundary (audit sinks, error messages,
//! device output handed back to the caller) passes through [`redact`]
//! first. Rules are applied in a fixed order, one category at a time, and
//! every match is replaced wholesale by a bracketed placeholder token.
//!
//! | Category | Token | Applied |
//! |----------|-------|---------|
//! | Credential assignments | `[PASSWORD_REDACTED]`, `[SECRET_REDACTED]` | always |
//! | API / bearer tokens | `[API_KEY_REDACTED]` | always |
//! | SNMP community strings | `[SNMP_COMMUNITY_REDACTED]` | always |
//! | TACACS / RADIUS shared secrets | `[SECRET_REDACTED]` | always |
//! | Pre-shared / crypto keys | `[KEY_REDACTED]` | always |
//! | Private IPv4 addresses | `[IP_REDACTED]` | aggressive |
//! | Hostname directives | `[HOSTNAME_REDACTED]` | aggressive |
//!
//! Every keyword rule is anchored on word boundaries and every token is
//! bracketed with underscores inside, so a token can never satisfy a rule
//! again. That is what makes `redact(redact(s)) == redact(s)`.

use regex::{NoExpand, Regex};
use serde::Serialize;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;

pub const PASSWORD_TOKEN: &str = "[PASSWORD_REDACTED]";
pub const SECRET_TOKEN: &str = "[SECRET_REDACTED]";
pub const API_KEY_TOKEN: &str = "[API_KEY_REDACTED]";
pub const SNMP_COMMUNITY_TOKEN: &str = "[SNMP_COMMUNITY_REDACTED]";
pub const KEY_TOKEN: &str = "[KEY_REDACTED]";
pub const IP_TOKEN: &str = "[IP_REDACTED]";
pub const HOSTNAME_TOKEN: &str = "[HOSTNAME_REDACTED]";

/// Replacement for values under sensitive keys in structured data.
pub const STRUCTURED_TOKEN: &str = "[REDACTED]";

/// Key fragments that mark a structured field as sensitive.
const SENSITIVE_KEY_PARTS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "key",
    "api",
    "community",
    "credential",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionCategory {
    Credential,
    ApiToken,
    SnmpCommunity,
    AaaSecret,
    CryptoKey,
    PrivateAddress,
    Hostname,
}

impl RedactionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credential => "credential",
            Self::ApiToken => "api_token",
            Self::SnmpCommunity => "snmp_community",
            Self::AaaSecret => "aaa_secret",
            Self::CryptoKey => "crypto_key",
            Self::PrivateAddress => "private_address",
            Self::Hostname => "hostname",
        }
    }
}

struct Rule {
    pattern: Regex,
    category: RedactionCategory,
    token: &'static str,
}

fn rule(pattern: &str, category: RedactionCategory, token: &'static str) -> Rule {
    Rule {
        pattern: Regex::new(pattern).unwrap(),
        category,
        token,
    }
}

static ALWAYS_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    use RedactionCategory::*;
    vec![
        // password: x, pwd=x, password is x, password 7 0822455D0A16
        rule(
            r#"(?i)\b(?:password|passwd|pwd|passphrase)\b["']?(?:\s+(?:is|was))?(?:\s+\d\b)?\s*[:=]?\s*(?:"[^"]*"|'[^']*'|["']?[^\s"']+["']?)"#,
            Credential,
            PASSWORD_TOKEN,
        ),
        // secret x, enable secret 5 $1$...
        rule(
            r#"(?i)\b(?:enable\s+)?secret\b["']?(?:\s+\d\b)?\s*[:=]?\s*(?:"[^"]*"|'[^']*'|["']?[^\s"']+["']?)"#,
            Credential,
            SECRET_TOKEN,
        ),
        rule(
            r#"(?i)\b(?:api[_\s-]?key|access[_-]?token|auth[_-]?token|token|bearer)\b["']?\s*[:=]?\s*(?:"[^"]*"|'[^']*'|["']?[^\s"']+["']?)"#,
            ApiToken,
            API_KEY_TOKEN,
        ),
        rule(r"\bgsk_[A-Za-z0-9]{32,}\b", ApiToken, API_KEY_TOKEN),
        rule(r"\b(?:sk|pk)-[A-Za-z0-9_-]{20,}", ApiToken, API_KEY_TOKEN),
        rule(r"\bAKIA[0-9A-Z]{16}\b", ApiToken, API_KEY_TOKEN),
        // Long opaque runs: hashes, session tokens, base62 keys.
        rule(r"\b[A-Za-z0-9]{40,}\b", ApiToken, API_KEY_TOKEN),
        rule(
            r"(?i)\bsnmp(?:-server)?\s+community\s+\S+",
            SnmpCommunity,
            SNMP_COMMUNITY_TOKEN,
        ),
        rule(
            r"(?i)\bsnmp[_-]community\b\s*[:=]\s*\S+",
            SnmpCommunity,
            SNMP_COMMUNITY_TOKEN,
        ),
        rule(
            r"(?i)\b(?:tacacs|radius)(?:-server)?\b(?:\s+host\s+\S+)?\s+key\b(?:\s+\d\b)?\s+\S+",
            AaaSecret,
            SECRET_TOKEN,
        ),
        rule(
            r"(?i)\bserver-private\s+\S+\s+key\b(?:\s+\d\b)?\s+\S+",
            AaaSecret,
            SECRET_TOKEN,
        ),
        rule(r"(?i)\bpre-shared-key\b\s*[:=]?\s*\S+", CryptoKey, KEY_TOKEN),
        rule(r"(?i)\bpsk\b\s*[:=]?\s*\S+", CryptoKey, KEY_TOKEN),
        rule(r"(?i)\bkey-string\b(?:\s+\d\b)?\s+\S+", CryptoKey, KEY_TOKEN),
        rule(r"(?i)\bkey\s+\d+\s+\S+", CryptoKey, KEY_TOKEN),
        rule(
            r"(?i)\bcrypto\s+(?:isakmp\s+)?key\b\s+\S+",
            CryptoKey,
            KEY_TOKEN,
        ),
        rule(r"(?i)\bipsec\s+key\b\s*[:=]?\s*\S+", CryptoKey, KEY_TOKEN),
        rule(
            r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?(?:-----END [A-Z ]*PRIVATE KEY-----|\z)",
            CryptoKey,
            KEY_TOKEN,
        ),
    ]
});

static AGGRESSIVE_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    use RedactionCategory::*;
    vec![
        rule(
            r"\b(?:10(?:\.\d{1,3}){3}|172\.(?:1[6-9]|2\d|3[01])(?:\.\d{1,3}){2}|192\.168(?:\.\d{1,3}){2})\b",
            PrivateAddress,
            IP_TOKEN,
        ),
        rule(
            r#"(?i)\bhostname\b\s*[:=]?\s*(?:"[^"]*"|'[^']*'|["']?[^\s"']+["']?)"#,
            Hostname,
            HOSTNAME_TOKEN,
        ),
    ]
});

/// Outcome of a redaction pass with per-category match counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RedactionReport {
    pub text: String,
    pub redactions: Vec<(RedactionCategory, usize)>,
}

impl RedactionReport {
    pub fn has_redactions(&self) -> bool {
        !self.redactions.is_empty()
    }

    pub fn total(&self) -> usize {
        self.redactions.iter().map(|(_, n)| n).sum()
    }
}

/// Scrub credentials and secrets from `text`.
///
/// Private addresses and hostname directives are only touched when
/// `aggressive` is set.
pub fn redact(text: &str, aggressive: bool) -> String {
    redact_report(text, aggressive).text
}

/// Like [`redact`], but also reports how many matches each category had.
pub fn redact_report(text: &str, aggressive: bool) -> RedactionReport {
    let mut cleaned = text.to_string();
    let mut counts: Vec<(RedactionCategory, usize)> = Vec::new();

    let rules = ALWAYS_RULES
        .iter()
        .chain(AGGRESSIVE_RULES.iter().filter(|_| aggressive));

    for rule in rules {
        let hits = rule.pattern.find_iter(&cleaned).count();
        if hits == 0 {
            continue;
        }
        cleaned = rule
            .pattern
            .replace_all(&cleaned, NoExpand(rule.token))
            .into_owned();
        match counts.iter_mut().find(|(c, _)| *c == rule.category) {
            Some((_, n)) => *n += hits,
            None => counts.push((rule.category, hits)),
        }
    }

    if !counts.is_empty() {
        let summary: Vec<String> = counts
            .iter()
            .map(|(c, n)| format!("{} {}", n, c.as_str()))
            .collect();
        debug!("Redacted {}", summary.join(", "));
    }

    RedactionReport {
        text: cleaned,
        redactions: counts,
    }
}

/// Redact a JSON-like structure without aggressive rules.
pub fn redact_structured(value: &Value) -> Value {
    redact_structured_with(value, false)
}

/// Recursively redact `value`.
///
/// Sensitive keys are replaced wholesale with [`STRUCTURED_TOKEN`] whatever
/// their value type; string leaves go through [`redact`]; numbers, booleans
/// and nulls pass through unchanged.
pub fn redact_structured_with(value: &Value, aggressive: bool) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive_key(k) {
                        Value::String(STRUCTURED_TOKEN.to_string())
                    } else {
                        redact_structured_with(v, aggressive)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| redact_structured_with(v, aggressive))
                .collect(),
        ),
        Value::String(s) => Value::String(redact(s, aggressive)),
        other => other.clone(),
    }
}

/// Whether a structured field name looks like it holds a secret.
pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_KEY_PARTS.iter().any(|part| key.contains(part))
}

/// Mask a password for display.
pub fn mask_password(password: &str) -> String {
    match password.chars().count() {
        0 => String::new(),
        n if n < 5 => "****".to_string(),
        n => "*".repeat(n),
    }
}

/// Mask an API key for display, keeping the first and last four characters.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Redact device or tool output and cap it at `max_chars` characters.
pub fn redact_output(text: &str, max_chars: usize, aggressive: bool) -> String {
    let cleaned = redact(text, aggressive);
    let total = cleaned.chars().count();
    if total <= max_chars {
        return cleaned;
    }
    let kept: String = cleaned.chars().take(max_chars).collect();
    format!("{}... [TRUNCATED: {} more chars]", kept, total - max_chars)
}
