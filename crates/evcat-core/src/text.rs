//! Text normalization used for comparison keys.

use std::collections::BTreeSet;

/// Lowercase, replace anything that is not alphanumeric with a space, collapse whitespace.
pub fn normalize_text(input: &str) -> String {
    input
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn tokens(input: &str) -> Vec<String> {
    normalize_text(input)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn token_set(input: &str) -> BTreeSet<String> {
    tokens(input).into_iter().collect()
}

/// City comparison key. "New York", " new-york " and "NEW YORK" share a key.
pub fn normalize_city(input: &str) -> String {
    normalize_text(input)
}

/// `None` for blank input, the trimmed text otherwise.
pub fn non_empty(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
