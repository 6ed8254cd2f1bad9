//! Heuristic PII redaction for export-time use.
//!
//! Detects email, phone, and SSN-shaped strings and substitutes stable
//! tokens. Email tokens carry a counter that increments across one export
//! run, so repeated redaction of the same stream stays deterministic.

use once_cell::sync::Lazy;
use regex::Regex;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap());
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b").unwrap());
static SSN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());

/// Stateful redactor; one instance per export run.
#[derive(Debug, Default)]
pub struct Redactor {
    email_counter: usize,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn redact(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for m in EMAIL_RE.find_iter(text) {
            out.push_str(&text[last..m.start()]);
            out.push_str(&format!("[REDACTED_EMAIL_{}]", self.email_counter));
            self.email_counter += 1;
            last = m.end();
        }
        out.push_str(&text[last..]);

        let out = SSN_RE.replace_all(&out, "[REDACTED_SSN]");
        let out = PHONE_RE.replace_all(&out, "[REDACTED_PHONE]");
        out.into_owned()
    }
}
