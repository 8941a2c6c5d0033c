//! Response status codes.
//!
//! Every server response begins with three ASCII digits and a space. The
//! first digit gives the class (2 success, 5 error); the last digit carries
//! framing information: 2 means a single value follows in the text, 3 means
//! a dot-terminated body follows, 4 means an event-log stream follows, and
//! 9 means the text is commentary only.

use thiserror::Error;

/// Server greeting: `231 <version> <algorithm> <hex-nonce>`.
pub const GREETING: u16 = 231;
/// Cookie login accepted, username echoed.
pub const COOKIE_USER: u16 = 232;
/// Challenge/response login accepted.
pub const USER_OK: u16 = 230;
/// Generic success.
pub const OK: u16 = 250;
/// Success, single value in the response text.
pub const VALUE: u16 = 252;
/// Success, dot-terminated body follows.
pub const BODY: u16 = 253;
/// Success, event-log stream follows.
pub const LOG_FOLLOWS: u16 = 254;
/// Success, commentary only.
pub const COMMENT: u16 = 259;
/// Malformed input, unknown command, or arity violation.
pub const BAD_COMMAND: u16 = 500;
/// Authorization denied.
pub const NOT_AUTHORIZED: u16 = 510;
/// Authentication failed.
pub const AUTH_FAILED: u16 = 530;
/// Bad argument or object not found.
pub const NOT_FOUND: u16 = 550;
/// Key exists but has no value (distinct from `550`).
pub const NO_VALUE: u16 = 555;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("malformed response line {0:?}")]
    Malformed(String),
}

/// A parsed response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub text: String,
}

impl Status {
    /// Parse `NNN text` (the space and text are optional after a bare code).
    pub fn parse(line: &str) -> Result<Self, StatusError> {
        let digits = line.get(..3).ok_or_else(|| StatusError::Malformed(line.to_string()))?;
        let code: u16 = digits
            .parse()
            .map_err(|_| StatusError::Malformed(line.to_string()))?;
        let text = match line.get(3..) {
            None | Some("") => String::new(),
            Some(rest) => rest
                .strip_prefix(' ')
                .ok_or_else(|| StatusError::Malformed(line.to_string()))?
                .to_string(),
        };
        Ok(Status { code, text })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// A dot-terminated body follows this status line.
    pub fn has_body(&self) -> bool {
        self.code % 10 == 3
    }

    /// The text is a single value rather than commentary.
    pub fn is_value(&self) -> bool {
        self.code % 10 == 2
    }

    /// An event-log stream follows this status line.
    pub fn is_log_follows(&self) -> bool {
        self.code % 10 == 4
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.text.is_empty() {
            write!(f, "{:03}", self.code)
        } else {
            write!(f, "{:03} {}", self.code, self.text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_basic() {
        let s = Status::parse("250 OK").unwrap();
        assert_eq!(s.code, 250);
        assert_eq!(s.text, "OK");
        assert!(s.is_success());
        assert!(!s.has_body());
    }

    #[test]
    fn test_parse_bare_code() {
        let s = Status::parse("250").unwrap();
        assert_eq!(s.code, 250);
        assert_eq!(s.text, "");
    }

    #[test]
    fn test_parse_greeting() {
        let s = Status::parse("231 2 sha256 deadbeef").unwrap();
        assert_eq!(s.code, GREETING);
        assert_eq!(s.text, "2 sha256 deadbeef");
    }

    #[test]
    fn test_framing_digits() {
        assert!(Status::parse("253 body").unwrap().has_body());
        assert!(Status::parse("252 value").unwrap().is_value());
        assert!(Status::parse("254 log").unwrap().is_log_follows());
        assert!(!Status::parse("250 plain").unwrap().has_body());
    }

    #[test]
    fn test_error_classes() {
        assert!(!Status::parse("510 Not authorized").unwrap().is_success());
        assert!(!Status::parse("555 No value").unwrap().is_success());
    }

    #[test]
    fn test_malformed() {
        assert!(Status::parse("xx").is_err());
        assert!(Status::parse("25x ok").is_err());
        assert!(Status::parse("250ok").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for line in ["250 OK", "550 no such track", "252"] {
            let s = Status::parse(line).unwrap();
            assert_eq!(s.to_string(), line);
        }
    }
}
