//! Validated regular-expression cache.
//!
//! Declared patterns come from user configuration and may be invalid. Every
//! pattern is compiled once; failures are remembered so an invalid pattern is
//! logged on first use and afterwards simply never matches.

use std::sync::OnceLock;

use dashmap::DashMap;
use regex::Regex;

fn cache() -> &'static DashMap<String, Option<Regex>> {
    static CACHE: OnceLock<DashMap<String, Option<Regex>>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// Compile `pattern`, returning `None` when it is not a valid regex.
pub fn compile(pattern: &str) -> Option<Regex> {
    if let Some(entry) = cache().get(pattern) {
        return entry.value().clone();
    }
    let compiled = match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!("invalid pattern '{pattern}' treated as no match: {e}");
            None
        }
    };
    cache().insert(pattern.to_string(), compiled.clone());
    compiled
}

/// Returns true when `pattern` is a valid regex matching `subject`.
pub fn is_match(pattern: &str, subject: &str) -> bool {
    compile(pattern)
        .map(|re| re.is_match(subject))
        .unwrap_or(false)
}

/// Match `subject` against `pattern` and return capture `group`.
///
/// `group` of `None` and `Some(0)` both select the whole match.
pub fn capture(pattern: &str, subject: &str, group: Option<usize>) -> Option<String> {
    let re = compile(pattern)?;
    let caps = re.captures(subject)?;
    caps.get(group.unwrap_or(0)).map(|m| m.as_str().to_string())
}

/// Number of patterns seen so far (valid and invalid).
pub fn cached_len() -> usize {
    cache().len()
}
