//! Identity slugs
//!
//! Identities double as directory names under `records/` and `thumbnails/`,
//! so they are restricted to `[a-z0-9_-]`.

/// Normalise free text into an identity slug.
///
/// Lowercases, maps every run of other characters to a single `-` and trims
/// dashes at both ends. Falls back to `"session"` when nothing is left.
pub fn slugify(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_dash = false;

    for c in value.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
            if c == '-' {
                pending_dash = true;
                continue;
            }
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }

    if out.is_empty() {
        "session".to_string()
    } else {
        out
    }
}

/// Whether `value` is already a valid identity
pub fn is_slug(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}
