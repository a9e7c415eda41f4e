use std::sync::LazyLock;

use regex::Regex;

static WS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\u{00A0}\u{2007}\u{202F}]+").unwrap());

/// Replace every whitespace run with a single ASCII space.
pub fn collapse_whitespace(s: &str) -> String {
    WS_RE.replace_all(s, " ").into_owned()
}

/// Collapse, then trim. The collapse can leave a space on either edge.
pub fn clean_text(s: &str) -> String {
    collapse_whitespace(s).trim().to_string()
}
