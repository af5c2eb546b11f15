//! Content identifiers such as `ABC-123`.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]+-\d+$").expect("identifier pattern compiles"));

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier must not be empty")]
    Empty,
    #[error(
        "invalid identifier `{0}`: use uppercase letters or digits, a hyphen, then digits (e.g. ABC-123)"
    )]
    Malformed(String),
}

/// True when `value` is exactly an identifier, with no surrounding whitespace.
pub fn is_valid(value: &str) -> bool {
    IDENTIFIER_RE.is_match(value)
}

/// Trims surrounding whitespace and validates what remains.
pub fn parse(raw: &str) -> Result<String, IdentifierError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if !is_valid(trimmed) {
        return Err(IdentifierError::Malformed(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Parses one identifier per line, skipping blank lines. Invalid lines are
/// returned separately so callers can report them.
pub fn parse_lines(content: &str) -> (Vec<String>, Vec<IdentifierError>) {
    let mut valid = Vec::new();
    let mut rejected = Vec::new();
    for line in content.lines() {
        match parse(line) {
            Ok(id) => valid.push(id),
            Err(IdentifierError::Empty) => {}
            Err(err) => rejected.push(err),
        }
    }
    (valid, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_identifiers() {
        for id in ["ABC-123", "A1B2-0", "123-456", "X-1"] {
            assert!(is_valid(id), "{id} should be valid");
        }
    }

    #[test]
    fn rejects_everything_else() {
        for id in [
            "abc-123", "ABC123", "ABC-", "-123", "ABC-12A", "AB C-1", "ABC--1", "ABC-1-2", " ABC-1",
            "",
        ] {
            assert!(!is_valid(id), "{id:?} should be rejected");
        }
    }

    #[test]
    fn parse_trims_and_reports() {
        assert_eq!(parse("  SSIS-001\n").unwrap(), "SSIS-001");
        assert_eq!(parse("   "), Err(IdentifierError::Empty));
        let err = parse("ssis-001").unwrap_err();
        assert_eq!(err, IdentifierError::Malformed("ssis-001".into()));
        assert!(err.to_string().contains("ABC-123"));
    }

    #[test]
    fn parse_lines_splits_valid_and_rejected() {
        let (valid, rejected) = parse_lines("ABC-1\n\n  DEF-22  \nnope\r\nGHI-3\n");
        assert_eq!(valid, vec!["ABC-1", "DEF-22", "GHI-3"]);
        assert_eq!(rejected.len(), 1);
    }
}
