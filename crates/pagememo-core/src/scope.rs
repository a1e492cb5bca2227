//! URL scoping
//!
//! A page URL maps to a canonical key. The fragment is always dropped; the
//! query string is dropped only when `strip_query_string` is on.
//!
//! Inbound entities are matched permissively: sender and receiver may disagree
//! on the query-string setting, so both normalized forms of each side are
//! compared and any equal pair puts the message in scope.

use url::Url;

/// Normalize `raw` to its scope key
///
/// Unparseable input falls back to plain string trimming so relative or
/// exotic URLs still get a stable key.
pub fn normalize_url(raw: &str, strip_query: bool) -> String {
    let raw = raw.trim();
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            if strip_query || url.query() == Some("") {
                url.set_query(None);
            }
            url.into()
        }
        Err(_) => {
            let without_fragment = raw.split('#').next().unwrap_or(raw);
            if strip_query {
                without_fragment
                    .split('?')
                    .next()
                    .unwrap_or(without_fragment)
                    .to_string()
            } else {
                without_fragment.to_string()
            }
        }
    }
}

/// Both normalized forms of a URL: query-preserving first, then stripped
pub fn scope_forms(raw: &str) -> [String; 2] {
    [normalize_url(raw, false), normalize_url(raw, true)]
}

/// True when any normalized form of `message_url` equals any normalized form of `current_url`
pub fn in_scope(message_url: &str, current_url: &str) -> bool {
    let message = scope_forms(message_url);
    let current = scope_forms(current_url);
    message.iter().any(|m| current.iter().any(|c| m == c))
}

/// The local normalization rule, as configured in settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UrlScope {
    pub strip_query_string: bool,
}

impl UrlScope {
    pub fn new(strip_query_string: bool) -> Self {
        Self { strip_query_string }
    }

    /// Storage key for `url` under this rule
    pub fn key(&self, url: &str) -> String {
        normalize_url(url, self.strip_query_string)
    }
}
