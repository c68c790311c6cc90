//! Parsing helpers shared by front-ends.

/// Splits a comma or semicolon separated list, skipping empty entries.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
