//! Helpers for reading the Academic System's Big5 pages.

use std::sync::LazyLock;

use regex::Regex;

static ACIXSTORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ACIXSTORE=([0-9A-Za-z]+)").unwrap());

static PWDSTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"auth_img\.php\?pwdstr=([0-9A-Za-z_\-]+)").unwrap());

/// Decode a Big5 body, replacing malformed sequences.
///
/// Pages occasionally declare UTF-8 but the INQUIRE scripts emit Big5, so the
/// declared charset is ignored.
pub fn decode_big5(body: &[u8]) -> String {
    let (text, _, had_errors) = encoding_rs::BIG5.decode(body);
    if had_errors {
        tracing::trace!(len = body.len(), "Big5 body contained malformed sequences");
    }
    text.into_owned()
}

/// Extract the session token from a URL or page body.
pub fn extract_acixstore(haystack: &str) -> Option<String> {
    ACIXSTORE_RE
        .captures(haystack)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Extract the CAPTCHA challenge reference (`pwdstr`) from the login page.
pub fn extract_pwdstr(page: &str) -> Option<String> {
    PWDSTR_RE
        .captures(page)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn contains_any(haystack: &str, markers: &[String]) -> bool {
    markers
        .iter()
        .any(|m| !m.is_empty() && haystack.contains(m.as_str()))
}

/// A whitespace-collapsed prefix of `text`, at most `max` bytes, cut on a char
/// boundary. Used in logs when a page does not match any known shape.
pub fn excerpt(text: &str, max: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() <= max {
        return collapsed;
    }
    let mut end = max;
    while !collapsed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &collapsed[..end])
}
