//! Plan text parsing.

use std::sync::LazyLock;

use regex::Regex;

static STEP_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(?:\d+\s*[.):]?|[-*])\s*(.*)$").ok());

/// Extract step descriptions from a numbered or bulleted list.
///
/// Lines that do not start with a digit, `-`, or `*` are ignored, as are
/// items left empty once the marker is stripped.
#[must_use]
pub fn parse_plan(text: &str) -> Vec<String> {
    let Some(re) = STEP_LINE.as_ref() else {
        return Vec::new();
    };

    text.lines()
        .map(str::trim)
        .filter_map(|line| re.captures(line))
        .filter_map(|caps| caps.get(1))
        .map(|item| item.as_str().trim().to_owned())
        .filter(|item| !item.is_empty())
        .collect()
}
