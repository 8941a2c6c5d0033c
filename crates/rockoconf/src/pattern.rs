//! Minimal glob matching for the decoder table.
//!
//! Supports `*` (any run of characters) and `?` (any one character),
//! matched against the whole basename. Case-sensitive.

/// Does `name` match `pattern` in full?
pub fn glob_match(pattern: &str, name: &str) -> bool {
    match_inner(
        &pattern.chars().collect::<Vec<_>>(),
        &name.chars().collect::<Vec<_>>(),
    )
}

fn match_inner(pattern: &[char], name: &[char]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some(('*', rest)) => {
            // Greedy star with backtracking over every split point.
            (0..=name.len()).any(|skip| match_inner(rest, &name[skip..]))
        }
        Some(('?', rest)) => match name.split_first() {
            Some((_, name_rest)) => match_inner(rest, name_rest),
            None => false,
        },
        Some((c, rest)) => match name.split_first() {
            Some((n, name_rest)) if n == c => match_inner(rest, name_rest),
            _ => false,
        },
    }
}
