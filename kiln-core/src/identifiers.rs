//! Slug canonicalization for log names.
//!
//! A slug uses the identifier charset `[A-Za-z0-9._-]`, capped at a maximum
//! length, and is unique only within its parent step.

/// Canonicalize `name` into an identifier of at most `max_len` bytes.
///
/// Characters outside the identifier charset are replaced with `_`; a
/// leading character that may not start an identifier gets an `_` prefix.
/// An empty name yields `"_"`.
pub fn force_identifier(max_len: usize, name: &str) -> String {
    let mut out = String::with_capacity(name.len().min(max_len));
    for c in name.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            c
        } else {
            '_'
        };
        if out.len() + c.len_utf8() > max_len {
            break;
        }
        out.push(c);
    }
    if out.is_empty() {
        out.push('_');
    }
    if out.starts_with(|c: char| c.is_ascii_digit() || c == '.' || c == '-') {
        out.insert(0, '_');
        out.truncate(max_len.max(1));
    }
    out
}

/// Produce the next identifier in the collision sequence for `ident`.
///
/// `stdio` becomes `stdio_2`, `stdio_2` becomes `stdio_3`, and so on. The
/// base is truncated as needed so the result still fits in `max_len`.
pub fn increment_identifier(max_len: usize, ident: &str) -> String {
    let (base, next) = match ident.rsplit_once('_') {
        Some((base, suffix)) if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) => {
            (base, suffix.parse::<u64>().map(|n| n + 1).unwrap_or(2))
        }
        _ => (ident, 2),
    };
    let suffix = format!("_{}", next);
    let room = max_len.saturating_sub(suffix.len()).max(1);
    let mut base = base.to_string();
    base.truncate(room);
    format!("{}{}", base, suffix)
}
