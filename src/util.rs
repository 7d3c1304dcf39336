use std::sync::{Mutex, MutexGuard};

use http::HeaderMap;
use sha2::{Digest, Sha256};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Lowercase hex SHA-256 of `input`; used to derive disk cache keys from
/// request URLs. The output is 64 chars of `[a-f0-9]`, always a legal key.
pub(crate) fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Scans a `Cache-Control` header value for a `max-age=N` token without a
/// full directive grammar. Returns `None` when absent or unparseable.
pub(crate) fn max_age_seconds(cache_control: &str) -> Option<u64> {
    for directive in cache_control.split(',') {
        let directive = directive.trim();
        if let Some(raw) = directive.strip_prefix("max-age=") {
            return raw.trim_matches('"').parse::<u64>().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{max_age_seconds, sha256_hex};

    #[test]
    fn sha256_hex_is_a_legal_cache_key() {
        let key = sha256_hex("https://example.com/index.html");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn max_age_token_is_found_between_other_directives() {
        assert_eq!(max_age_seconds("no-transform, max-age=600, private"), Some(600));
        assert_eq!(max_age_seconds("no-store"), None);
        assert_eq!(max_age_seconds("max-age=\"30\""), Some(30));
    }
}
