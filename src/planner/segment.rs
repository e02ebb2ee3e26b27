//! Sequencing-language detection and step splitting
//!
//! A sequencing keyword only splits the instruction when a separator
//! (`,` `;` `.` or "and") precedes it or the text after it opens a new
//! action. "pay 5 USDC to the next door cafe" is one step.

use crate::classifier::opens_action;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SEQUENCE_KEYWORD: Regex = Regex::new(
        r"(?i)(?P<sep>\s*[,;.]\s*|\s+and\s+)?\b(?:then|after\s+that|afterwards|finally|next)\b\s*,?\s*"
    )
    .unwrap_or_else(|e| panic!("invalid sequencing pattern: {}", e));
}

/// Byte ranges of the keyword matches that actually separate two steps.
fn split_points(text: &str) -> Vec<(usize, usize)> {
    SEQUENCE_KEYWORD
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let separated = caps.name("sep").is_some();
            (separated || opens_action(&text[whole.end()..])).then(|| (whole.start(), whole.end()))
        })
        .collect()
}

/// True when the instruction contains explicit sequencing language.
pub fn has_sequencing(text: &str) -> bool {
    !split_points(text).is_empty()
}

/// Split an instruction on sequencing keywords, keeping textual order.
///
/// Empty pieces (e.g. a leading "then") are dropped.
pub fn split_segments(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (from, to) in split_points(text) {
        pieces.push(&text[start..from]);
        start = to;
    }
    pieces.push(&text[start..]);

    pieces
        .into_iter()
        .map(|piece| piece.trim().trim_end_matches(|c: char| matches!(c, '.' | ',' | ';')))
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect()
}
