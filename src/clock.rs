//! Wall-clock helpers, request/trace identifiers, and the cooperative
//! cancellation handle shared by the store and the relay path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;

/// Current wall time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current wall time in seconds since the Unix epoch.
pub fn now_s() -> i64 {
    chrono::Utc::now().timestamp()
}

/// New trace id: a v4 UUID without hyphens (32 hex chars).
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// New request id. Kept at 32 chars or fewer so it fits the
/// VARCHAR(32) column on row-store backends.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

const KEY_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// New opaque token key body: 48 alphanumeric chars. The public
/// prefix is applied only at serialization time.
pub fn new_token_key() -> String {
    let mut rng = rand::thread_rng();
    (0..48)
        .map(|_| KEY_CHARS[rng.gen_range(0..KEY_CHARS.len())] as char)
        .collect()
}

/// Cooperative cancellation flag for one request. Cloned into the
/// store retry loop and the streaming tasks; set when the client
/// disconnects or the dispatcher gives up.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_fits_column() {
        let id = new_request_id();
        assert!(id.len() <= 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn token_key_is_48_alnum() {
        let key = new_token_key();
        assert_eq!(key.len(), 48);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn cancel_token_propagates() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
