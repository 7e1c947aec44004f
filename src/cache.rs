//! Optional key/value collaborator with TTL.
//!
//! When disabled every lookup misses and callers fall through to the
//! store, so absence and presence share one code path.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

static ENABLED: AtomicBool = AtomicBool::new(true);

static ENTRIES: Lazy<Mutex<HashMap<String, CacheEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
    if !enabled {
        ENTRIES.lock().expect("cache lock poisoned").clear();
    }
}

/// Single lookup surface: (value, hit). A disabled cache always
/// misses.
pub fn lookup(key: &str) -> (Option<String>, bool) {
    if !ENABLED.load(Ordering::Relaxed) {
        return (None, false);
    }
    let mut entries = ENTRIES.lock().expect("cache lock poisoned");
    match entries.get(key) {
        Some(entry) if entry.expires_at > Instant::now() => (Some(entry.value.clone()), true),
        Some(_) => {
            entries.remove(key);
            (None, false)
        }
        None => (None, false),
    }
}

pub fn put(key: &str, value: &str, ttl: Duration) {
    if !ENABLED.load(Ordering::Relaxed) {
        return;
    }
    let mut entries = ENTRIES.lock().expect("cache lock poisoned");
    entries.insert(
        key.to_string(),
        CacheEntry {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        },
    );
}

pub fn invalidate(key: &str) {
    ENTRIES.lock().expect("cache lock poisoned").remove(key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_roundtrip_and_expiry() {
        put("cache-test-a", "1", Duration::from_secs(60));
        assert_eq!(lookup("cache-test-a"), (Some("1".to_string()), true));

        put("cache-test-b", "2", Duration::from_millis(0));
        // Already expired at insert time.
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(lookup("cache-test-b"), (None, false));

        invalidate("cache-test-a");
        assert_eq!(lookup("cache-test-a"), (None, false));
    }
}
