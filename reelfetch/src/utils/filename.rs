//! Path-component sanitization.
//!
//! Library paths are built from show and episode titles supplied by remote
//! catalogs, so every component is cleaned before it touches the file system.
//! Valid Unicode text (CJK titles included) is preserved.

/// Characters rejected by at least one supported file system.
const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Device names Windows refuses as file names, with or without an extension.
const RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Longest component we emit, in characters.
pub const MAX_COMPONENT_CHARS: usize = 180;

/// Clean one path component.
///
/// Runs of forbidden or control characters collapse into a single `_`,
/// surrounding spaces and dots are stripped, reserved device names get a `_`
/// prefix and overlong names are cut at [`MAX_COMPONENT_CHARS`]. Returns an
/// empty string when nothing usable is left, so callers can reject it.
pub fn sanitize_component(input: &str) -> String {
    let mut cleaned = String::with_capacity(input.len());
    let mut replaced = false;
    for c in input.chars() {
        if c.is_control() || FORBIDDEN.contains(&c) {
            if !replaced {
                cleaned.push('_');
            }
            replaced = true;
        } else {
            cleaned.push(c);
            replaced = false;
        }
    }

    let trimmed = cleaned.trim_matches(|c: char| c == ' ' || c == '.');
    let mut out: String = trimmed.chars().take(MAX_COMPONENT_CHARS).collect();
    // Truncation may expose a trailing space or dot again.
    while out.ends_with([' ', '.']) {
        out.pop();
    }

    let stem = out.split('.').next().unwrap_or_default().to_ascii_uppercase();
    if RESERVED.contains(&stem.as_str()) {
        out.insert(0, '_');
    }
    out
}
