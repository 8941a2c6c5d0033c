//! Protocol types for the Rockola jukebox.
//!
//! Everything both sides of the wire need lives here: the shell-style line
//! splitter the protocol (and the config grammar) is built on, the response
//! code vocabulary, the rights bitmask, the challenge/response hashing, and
//! an async client used by `rkcli` and the integration tests.
//!
//! The wire protocol itself is line-oriented UTF-8: one request per line,
//! responses `NNN text`, multi-line bodies terminated by a lone `.` with
//! leading dots doubled on data lines.

pub mod auth;
pub mod client;
pub mod split;
pub mod status;
pub mod rights;

pub use auth::{generate_nonce, hash_response, Algorithm};
pub use client::{Client, ClientError, Response, UserConfig};
pub use split::{quote, quote_word, split, SplitError, SplitFlags};
pub use status::{Status, StatusError};
pub use rights::Rights;

/// Protocol version announced in the server greeting.
pub const PROTOCOL_VERSION: u32 = 2;

/// Terminator line for multi-line bodies.
pub const BODY_TERMINATOR: &str = ".";

/// Escape a body line for the wire: a leading `.` is doubled.
pub fn escape_body_line(line: &str) -> String {
    if let Some(rest) = line.strip_prefix('.') {
        format!("..{}", rest)
    } else {
        line.to_string()
    }
}

/// Undo [`escape_body_line`]: a leading `..` collapses to `.`.
pub fn unescape_body_line(line: &str) -> String {
    if let Some(rest) = line.strip_prefix("..") {
        format!(".{}", rest)
    } else {
        line.to_string()
    }
}
