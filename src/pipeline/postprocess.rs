//! Post-processing: deterministic cleanup of provider output.
//!
//! ## What gets cleaned
//!
//! Even well-prompted models wrap their answers in things the pipeline does
//! not want:
//!
//! - ` ```json ... ``` ` fences around a structured answer, or a sentence of
//!   prose before it ("Here is the extracted data:")
//! - ` ```text ... ``` ` fences around a plain transcription
//! - Windows-style `\r\n` line endings and zero-width characters copied from
//!   the receipt's own encoding
//!
//! Two entry points cover the two kinds of output: [`clean_ocr_text`] for
//! transcriptions that become the `.txt` artifact, and
//! [`isolate_json_object`] for structured extraction answers. Each rule is a
//! pure `&str → String` function and independently testable.

use once_cell::sync::Lazy;
use regex::Regex;

/// Clean a page transcription.
///
/// Rules (applied in order):
/// 1. Strip outer code fences
/// 2. Normalise line endings (CRLF → LF)
/// 3. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 4. Trim trailing whitespace per line
/// 5. Collapse 3+ consecutive blank lines down to 1
/// 6. Trim leading and trailing blank lines
pub fn clean_ocr_text(input: &str) -> String {
    let s = strip_code_fences(input);
    let s = normalise_line_endings(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim_matches('\n').to_string()
}

/// Extract the outermost JSON object from a model answer.
///
/// Fences and surrounding prose are ignored. Braces inside string literals
/// do not count towards nesting. Returns `None` when no balanced object is
/// present.
pub fn isolate_json_object(input: &str) -> Option<String> {
    let s = remove_invisible_chars(&strip_code_fences(input));
    let start = s.find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in s[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(s[start..=start + offset].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

// ── Rule 1: Strip outer code fences ──────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\n(.*?)\n?```\s*$").unwrap());

static RE_INNER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*\n(.*?)\n?```").unwrap());

fn strip_code_fences(input: &str) -> String {
    let trimmed = input.trim();
    if let Some(caps) = RE_OUTER_FENCES.captures(trimmed) {
        return caps[1].to_string();
    }
    // Prose followed by a fenced block: keep only the block.
    if let Some(caps) = RE_INNER_FENCE.captures(trimmed) {
        return caps[1].to_string();
    }
    input.to_string()
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 4: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}
