//! Subject and KV key validation.
//!
//! Subjects are dot-delimited token strings. `*` matches exactly one token and
//! `>` matches one or more trailing tokens; both must occupy a whole token.
//! KV keys use the same dot hierarchy but a restricted character set.

use crate::error::{CoreError, Result};

/// Validate a (resolved) subject.
///
/// Rejects empty subjects, whitespace, empty tokens, wildcards that are not a
/// whole token, `>` anywhere but the last token, and leftover `${...}`
/// placeholders from variable resolution.
pub fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty() {
        return Err(CoreError::InvalidSubject("empty subject".to_string()));
    }
    if subject.contains("${") {
        return Err(CoreError::InvalidSubject(format!(
            "unresolved variable in '{subject}'"
        )));
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(CoreError::InvalidSubject(format!(
            "whitespace in '{subject}'"
        )));
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(CoreError::InvalidSubject(format!(
                "empty token in '{subject}'"
            )));
        }
        if token.len() > 1 && (token.contains('*') || token.contains('>')) {
            return Err(CoreError::InvalidSubject(format!(
                "wildcard must be a whole token in '{subject}'"
            )));
        }
        if *token == ">" && i != last {
            return Err(CoreError::InvalidSubject(format!(
                "'>' must be the last token in '{subject}'"
            )));
        }
    }
    Ok(())
}

/// Check whether a concrete subject matches a (possibly wildcarded) pattern.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');

    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '/' | '_' | '=' | '.')
}

/// Validate a concrete KV key (no wildcards).
pub fn validate_kv_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CoreError::InvalidKey("empty key".to_string()));
    }
    if key.starts_with('.') || key.ends_with('.') || key.contains("..") {
        return Err(CoreError::InvalidKey(format!(
            "empty segment in '{key}'"
        )));
    }
    if let Some(bad) = key.chars().find(|c| !is_key_char(*c)) {
        return Err(CoreError::InvalidKey(format!(
            "invalid character '{bad}' in '{key}'"
        )));
    }
    Ok(())
}

/// Validate a KV watch pattern: a key, optionally with `*`/`>` tokens.
pub fn validate_kv_pattern(pattern: &str) -> Result<()> {
    let concrete: Vec<&str> = pattern
        .split('.')
        .filter(|t| *t != "*" && *t != ">")
        .collect();
    if pattern.split('.').any(str::is_empty) {
        return Err(CoreError::InvalidKey(format!(
            "empty segment in '{pattern}'"
        )));
    }
    if let Some(pos) = pattern.split('.').position(|t| t == ">") {
        if pos != pattern.split('.').count() - 1 {
            return Err(CoreError::InvalidKey(format!(
                "'>' must be the last segment in '{pattern}'"
            )));
        }
    }
    for token in concrete {
        validate_kv_key(token)?;
    }
    Ok(())
}
