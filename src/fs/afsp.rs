//! Ambiguous filespec matching.
//!
//! AFSP wildcards are `*` (zero or more characters) and `#` (exactly one).
//! Matching is case-insensitive, the way the 8-bit filing systems compare
//! names.

use regex::Regex;

use crate::error::{BbcError, BbcResult, ErrorCode};

/// True if the string contains AFSP wildcards.
pub fn is_ambiguous(spec: &str) -> bool {
    spec.contains('*') || spec.contains('#')
}

/// Compiles an AFSP into an anchored, case-insensitive regex.
pub fn to_regex(spec: &str) -> BbcResult<Regex> {
    let mut pattern = String::with_capacity(spec.len() + 8);
    pattern.push_str("(?i)^");
    let mut last_star = false;
    for c in spec.chars() {
        match c {
            '*' => {
                // adjacent stars collapse
                if !last_star {
                    pattern.push_str(".*");
                }
                last_star = true;
                continue;
            }
            '#' => pattern.push('.'),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
        last_star = false;
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|_| BbcError::stock(ErrorCode::BadName))
}
