//! Secret redaction and control-character scrubbing for persisted text.

use std::sync::LazyLock;

use regex::Regex;

pub const REDACTED: &str = "***REDACTED***";

static SECRET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)(api[_-]?key\s*[=:]\s*)(\S+)",
        r"(?i)(token\s*[=:]\s*)(\S+)",
        r"(?i)(authorization\s*:\s*bearer\s+)(\S+)",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("secret pattern should be valid"))
    .collect()
});

static CONTROL_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]").expect("control char pattern should be valid")
});

pub fn redact_secrets(text: &str) -> String {
    let replacement = format!("${{1}}{REDACTED}");
    SECRET_PATTERNS
        .iter()
        .fold(text.to_string(), |acc, pattern| {
            pattern.replace_all(&acc, replacement.as_str()).into_owned()
        })
}

/// Remove control characters except tab, newline and carriage return.
pub fn sanitize_control_chars(text: &str) -> String {
    CONTROL_CHARS.replace_all(text, "").into_owned()
}

/// Which scrubbing passes to apply to persisted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scrubber {
    pub sanitize_control_chars: bool,
    pub redact_secrets: bool,
}

impl Scrubber {
    pub fn apply(&self, text: &str) -> String {
        let mut out = if self.sanitize_control_chars {
            sanitize_control_chars(text)
        } else {
            text.to_string()
        };
        if self.redact_secrets {
            out = redact_secrets(&out);
        }
        out
    }
}

impl Default for Scrubber {
    fn default() -> Self {
        Self {
            sanitize_control_chars: true,
            redact_secrets: true,
        }
    }
}
