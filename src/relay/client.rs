//! HTTP client utilities for upstream calls: client construction,
//! failure classification, and retry backoff.

use std::time::Duration;

use rand::Rng;
use reqwest::{header::HeaderMap, Client};
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};
use crate::logger;

/// Create a new HTTP client with standard configuration.
pub fn create_client(timeout_secs: u64) -> GatewayResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to create HTTP client: {}", e)))
}

/// Client for buffered requests.
pub fn default_client() -> GatewayResult<Client> {
    create_client(120)
}

/// Client for streaming requests (longer timeout).
pub fn streaming_client() -> GatewayResult<Client> {
    create_client(300)
}

/// Whether an upstream status is worth retrying on another channel.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Map an upstream HTTP status to the error taxonomy. 413 surfaces as
/// transient so the dispatcher can re-select with a larger budget.
pub fn classify_upstream_status(status: u16, body: &str) -> GatewayError {
    let detail = format!("upstream returned {}: {}", status, truncate(body, 500));
    if status == 413 || is_transient_status(status) {
        GatewayError::UpstreamTransient(detail)
    } else {
        GatewayError::UpstreamPermanent(detail)
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Pause before the next retry: doubling growth from `initial_ms`,
/// capped at `max_ms`, plus up to a quarter extra of random jitter so
/// concurrent retries spread out.
pub fn retry_delay(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let doubled = initial_ms.saturating_mul(2u64.saturating_pow(attempt.min(16)));
    let base = doubled.min(max_ms).max(1);
    let jitter = rand::thread_rng().gen_range(0..=base / 4);
    Duration::from_millis(base + jitter)
}

/// One POST to an absolute URL. Connection-level failures classify as
/// transient; the caller inspects the status itself.
pub async fn post_json(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    body: &Value,
) -> GatewayResult<reqwest::Response> {
    logger::debug("client", &format!("sending request to {}", url));
    client
        .post(url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                GatewayError::UpstreamTransient(format!("request timeout: {}", e))
            } else if e.is_connect() {
                GatewayError::UpstreamTransient(format!("connection failed: {}", e))
            } else {
                GatewayError::UpstreamTransient(format!("request error: {}", e))
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses() {
        assert!(is_transient_status(429));
        assert!(is_transient_status(500));
        assert!(is_transient_status(503));
        assert!(!is_transient_status(400));
        assert!(!is_transient_status(401));
        assert!(!is_transient_status(200));
    }

    #[test]
    fn classification_splits_the_taxonomy() {
        assert!(matches!(
            classify_upstream_status(503, "overloaded"),
            GatewayError::UpstreamTransient(_)
        ));
        assert!(matches!(
            classify_upstream_status(413, "too large"),
            GatewayError::UpstreamTransient(_)
        ));
        assert!(matches!(
            classify_upstream_status(400, "bad request"),
            GatewayError::UpstreamPermanent(_)
        ));
    }

    #[test]
    fn retry_delay_grows_and_stays_bounded() {
        // First attempt starts at the floor.
        let first = retry_delay(0, 300, 3000);
        assert!(first.as_millis() >= 300);
        assert!(first.as_millis() <= 300 + 75);
        // Deep attempts cap at max plus a quarter of jitter.
        let late = retry_delay(20, 300, 3000);
        assert!(late.as_millis() >= 3000);
        assert!(late.as_millis() <= 3000 + 750);
    }

    #[test]
    fn retry_delay_survives_extreme_inputs() {
        // Saturating math: no overflow panic on huge attempts.
        let delay = retry_delay(u32::MAX, u64::MAX / 2, 5000);
        assert!(delay.as_millis() <= (5000 + 1250) as u128);
        // Zero floor still yields a positive delay.
        assert!(retry_delay(0, 0, 1000).as_millis() >= 1);
    }
}
