//! Tells usable source code apart from conversational assistant output.
//!
//! The code assistant is asked for raw file content, but it sometimes
//! narrates ("Here's the resolved file:"), asks for permission, refuses, or
//! wraps its answer in a markdown fence. Any of those makes the output
//! unusable as a file body.
//!
//! ```
//! use mergeq::resolution::looks_like_prose;
//!
//! assert!(looks_like_prose("Here's the resolved content:\n```\nx\n```"));
//! assert!(looks_like_prose("   \n"));
//! assert!(!looks_like_prose("use std::fmt;\n\nfn main() {}"));
//! ```

use regex::Regex;
use std::sync::LazyLock;

/// Conversational openers, matched against the first non-empty line.
static OPENER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(here is|here's|here are|sure\b|certainly\b|of course\b|okay,|ok,|unfortunately\b|sorry\b|i apologi[sz]e|as an ai\b|based on\b|looking at\b|let me\b|let's\b|i'm\b|i am\b|i'll\b|i will\b|i've\b|i have\b|i'd\b|i would\b|i can\b|i cannot\b|i can't\b|i need\b|i think\b|i believe\b|it seems\b|it appears\b|it looks like\b|perhaps\b|maybe\b|the (resolved|merged|updated|final) (file|content|code|version)\b|this (resolves|merges|combines)\b)",
    )
    .unwrap()
});

/// Requests for permission or refusals, matched anywhere (case-insensitive).
const PERMISSION_PHRASES: &[&str] = &[
    "would you like me to",
    "do you want me to",
    "shall i ",
    "should i proceed",
    "may i proceed",
    "let me know if",
    "please confirm",
    "please let me know",
    "i need permission",
    "i need your permission",
    "grant permission",
    "approve the write",
    "i don't have permission",
    "i do not have permission",
    "i'm unable to",
    "i am unable to",
    "i can't help with",
    "i cannot help with",
];

/// `true` when `text` should be rejected as a file body.
pub fn looks_like_prose(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }

    if trimmed.starts_with("```") {
        return true;
    }

    let first_line = trimmed.lines().next().unwrap_or_default().trim();
    if OPENER_RE.is_match(first_line) {
        return true;
    }

    let lower = trimmed.to_lowercase();
    PERMISSION_PHRASES.iter().any(|p| lower.contains(p))
}
