//! Shell-style line splitting.
//!
//! One grammar serves both the command protocol and the config files:
//! whitespace-separated words, optional double-quoting with `\"` and `\\`
//! escapes, optional `#` comments. `quote` is the inverse and produces a
//! line that `split` reads back verbatim.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Grammar features enabled for a particular caller.
    ///
    /// Protocol lines use `QUOTES`; config files use `QUOTES | COMMENTS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SplitFlags: u32 {
        /// Honour `"..."` quoting with `\"` and `\\` escapes.
        const QUOTES = 1 << 0;
        /// `#` at the start of a word begins a comment running to end of line.
        const COMMENTS = 1 << 1;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("unterminated quoted string")]
    UnterminatedQuote,
    #[error("invalid escape sequence \\{0}")]
    InvalidEscape(char),
}

/// Split `input` into words.
///
/// Unquoted words end at ASCII whitespace. Quoted words may be empty and
/// may contain whitespace; only `\"` and `\\` are valid escapes inside
/// them. With `COMMENTS`, an unquoted `#` at a word boundary discards the
/// rest of the line.
pub fn split(input: &str, flags: SplitFlags) -> Result<Vec<String>, SplitError> {
    let mut words = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let Some(&c) = chars.peek() else { break };

        if c == '#' && flags.contains(SplitFlags::COMMENTS) {
            break;
        }

        if c == '"' && flags.contains(SplitFlags::QUOTES) {
            chars.next();
            let mut word = String::new();
            loop {
                match chars.next() {
                    None => return Err(SplitError::UnterminatedQuote),
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('"') => word.push('"'),
                        Some('\\') => word.push('\\'),
                        Some(other) => return Err(SplitError::InvalidEscape(other)),
                        None => return Err(SplitError::UnterminatedQuote),
                    },
                    Some(other) => word.push(other),
                }
            }
            words.push(word);
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                word.push(c);
                chars.next();
            }
            words.push(word);
        }
    }

    Ok(words)
}

fn needs_quoting(word: &str) -> bool {
    word.is_empty()
        || word
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\' || c == '#')
}

/// Quote a single word for the wire if it needs it.
pub fn quote_word(word: &str) -> String {
    if !needs_quoting(word) {
        return word.to_string();
    }
    let mut out = String::with_capacity(word.len() + 2);
    out.push('"');
    for c in word.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Join words into a line that [`split`] reads back as the same words.
pub fn quote<'a, I>(words: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    words
        .into_iter()
        .map(quote_word)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn q() -> SplitFlags {
        SplitFlags::QUOTES
    }

    fn qc() -> SplitFlags {
        SplitFlags::QUOTES | SplitFlags::COMMENTS
    }

    #[test]
    fn test_plain_words() {
        assert_eq!(
            split("play tracks/song.ogg", q()).unwrap(),
            vec!["play", "tracks/song.ogg"]
        );
    }

    #[test]
    fn test_leading_and_trailing_whitespace() {
        assert_eq!(split("  a \t b  ", q()).unwrap(), vec!["a", "b"]);
        assert_eq!(split("", q()).unwrap(), Vec::<String>::new());
        assert_eq!(split("   ", q()).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_quoted_words() {
        assert_eq!(
            split(r#"set "a key" "a value""#, q()).unwrap(),
            vec!["set", "a key", "a value"]
        );
        assert_eq!(split(r#""""#, q()).unwrap(), vec![""]);
    }

    #[test]
    fn test_escapes() {
        assert_eq!(
            split(r#""she said \"hi\"" "back\\slash""#, q()).unwrap(),
            vec![r#"she said "hi""#, r"back\slash"]
        );
    }

    #[test]
    fn test_invalid_escape() {
        assert_eq!(split(r#""\n""#, q()), Err(SplitError::InvalidEscape('n')));
    }

    #[test]
    fn test_unterminated_quote() {
        assert_eq!(split(r#"play "half"#, q()), Err(SplitError::UnterminatedQuote));
        assert_eq!(split(r#""trailing\"#, q()), Err(SplitError::UnterminatedQuote));
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            split("listen 0.0.0.0 24600 # default port", qc()).unwrap(),
            vec!["listen", "0.0.0.0", "24600"]
        );
        assert_eq!(split("# whole line", qc()).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_comments_disabled_on_protocol_lines() {
        assert_eq!(split("search #hashtag", q()).unwrap(), vec!["search", "#hashtag"]);
    }

    #[test]
    fn test_hash_inside_quotes_is_literal() {
        assert_eq!(
            split(r##"set key "# not a comment""##, qc()).unwrap(),
            vec!["set", "key", "# not a comment"]
        );
    }

    #[test]
    fn test_quote_round_trip() {
        let words = vec![
            "plain",
            "with space",
            r#"with"quote"#,
            r"with\backslash",
            "",
            "#hash",
            "tabs\there",
        ];
        let line = quote(words.iter().copied());
        assert_eq!(split(&line, q()).unwrap(), words);
    }

    #[test]
    fn test_quote_word_passthrough() {
        assert_eq!(quote_word("simple"), "simple");
        assert_eq!(quote_word("with space"), r#""with space""#);
        assert_eq!(quote_word(""), r#""""#);
    }
}
