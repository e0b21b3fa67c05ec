//! Subject syntax and wildcard matching.
//!
//! Subjects are dot-separated tokens (`orders.eu.created`). Subscriptions may use
//! two wildcards, each of which must be a whole token:
//! - `*` matches exactly one token
//! - `>` matches one or more trailing tokens and must be the last token
//!
//! Published subjects must be literal.

use crate::error::ClientError;

const SINGLE_WILDCARD: &str = "*";
const FULL_WILDCARD: &str = ">";

/// Validates a subscription subject (wildcards allowed).
pub fn validate_subject(subject: &str) -> Result<(), ClientError> {
    check_tokens(subject, true)
}

/// Validates a publish subject (no wildcards).
pub fn validate_publish_subject(subject: &str) -> Result<(), ClientError> {
    check_tokens(subject, false)
}

/// Validates a queue group name: non-empty and free of whitespace.
pub fn validate_queue_group(group: &str) -> Result<(), ClientError> {
    if group.is_empty() || group.chars().any(char::is_whitespace) {
        return Err(ClientError::InvalidQueueGroup(group.to_string()));
    }
    Ok(())
}

fn check_tokens(subject: &str, allow_wildcards: bool) -> Result<(), ClientError> {
    let invalid = || ClientError::InvalidSubject(subject.to_string());

    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;

    for (idx, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(invalid());
        }
        let is_wildcard = *token == SINGLE_WILDCARD || *token == FULL_WILDCARD;
        if is_wildcard && !allow_wildcards {
            return Err(invalid());
        }
        if *token == FULL_WILDCARD && idx != last {
            return Err(invalid());
        }
    }

    Ok(())
}

/// Returns true when `subject` (literal) matches `pattern` (may contain wildcards).
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(FULL_WILDCARD), Some(_)) => return true,
            (Some(SINGLE_WILDCARD), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
