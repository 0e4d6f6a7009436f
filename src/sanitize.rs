//! Cleanup of raw model output into a single displayable chat line.
//!
//! Models echo speaker names, wrap answers in quotes, emit markup, or ramble
//! across multiple lines. Everything here is lossy by intent: the output is
//! either one plausible chat line or an empty string the caller discards.

use regex_lite::Regex;

/// Cleaned lines longer than this are discarded by callers rather than
/// truncated mid-sentence.
pub const MAX_DISPLAY_LEN: usize = 240;

/// Normalize a raw completion into one displayable ASCII line.
///
/// Strips markup-like `<...>` runs, a repeated "speaker:" echo, one layer of
/// surrounding quotes, everything past the first newline, stray doubled
/// quotes, and non-printable/non-ASCII characters. Returns an empty string
/// when nothing usable remains.
pub fn clean(raw: &str, speaker: &str) -> String {
    let mut text = raw.to_string();

    if let Ok(re) = Regex::new("<[^>]*>") {
        text = re.replace_all(&text, "").into_owned();
    }

    let echo_pattern = format!(r"(?i)\*?{}\*?:\s*", regex_lite::escape(speaker));
    if let Ok(re) = Regex::new(&echo_pattern) {
        text = re.replace_all(&text, "").into_owned();
    }

    text = strip_quote_layer(&text);

    if let Some(first_line) = text.split('\n').next() {
        text = first_line.to_string();
    }

    text = text.replace("\"\"", "");
    text.retain(|c| c.is_ascii() && !c.is_ascii_control());

    text.trim().to_string()
}

/// Remove at most one leading and one trailing quote character.
fn strip_quote_layer(text: &str) -> String {
    let mut out = text;
    for quote in ['"', '\''] {
        if let Some(rest) = out.strip_prefix(quote) {
            out = rest;
            break;
        }
    }
    for quote in ['"', '\''] {
        if let Some(rest) = out.strip_suffix(quote) {
            out = rest;
            break;
        }
    }
    out.to_string()
}
