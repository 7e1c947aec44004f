//! Request authentication and caller resolution.

use std::net::Ipv4Addr;
use std::time::Duration;

use axum::http::HeaderMap;

use crate::cache;
use crate::clock;
use crate::db::tokens::{lookup_key, Token, TokenStatus};
use crate::db::users::{User, UserStatus};
use crate::db::Store;
use crate::error::{GatewayError, GatewayResult};
use crate::logger;

const TOKEN_CACHE_TTL: Duration = Duration::from_secs(60);

/// Extract the bearer key from the Authorization header.
pub fn extract_bearer_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

/// Resolve and validate the token behind a presented key.
pub fn resolve_token(store: &Store, presented: &str) -> GatewayResult<Token> {
    let body = lookup_key(presented);

    // The cache keeps key -> id; the row itself always comes from the
    // store so status changes take effect immediately.
    let cache_key = format!("token:key:{}", body);
    let token = match cache::lookup(&cache_key) {
        (Some(id), true) => id.parse::<i64>().ok().and_then(|id| {
            store.get_token(id).ok().flatten()
        }),
        _ => None,
    };
    let token = match token {
        Some(token) => token,
        None => {
            let token = store.get_token_by_key(&body)?.ok_or_else(|| {
                GatewayError::Unauthorized("invalid API key".to_string())
            })?;
            cache::put(&cache_key, &token.id.to_string(), TOKEN_CACHE_TTL);
            token
        }
    };

    match token.status {
        TokenStatus::Disabled => {
            return Err(GatewayError::Forbidden("token is disabled".to_string()))
        }
        TokenStatus::Expired => {
            return Err(GatewayError::Unauthorized("token has expired".to_string()))
        }
        TokenStatus::Exhausted => {
            return Err(GatewayError::InsufficientQuota(
                "token quota is exhausted".to_string(),
            ))
        }
        TokenStatus::Enabled => {}
    }
    if token.is_expired(clock::now_s()) {
        if let Err(e) = store.update_token_status(token.id, TokenStatus::Expired) {
            logger::debug("auth", &format!("expire mark failed: {}", e));
        }
        return Err(GatewayError::Unauthorized("token has expired".to_string()));
    }
    if token.is_exhausted() {
        if let Err(e) = store.update_token_status(token.id, TokenStatus::Exhausted) {
            logger::debug("auth", &format!("exhaust mark failed: {}", e));
        }
        return Err(GatewayError::InsufficientQuota(
            "token quota is exhausted".to_string(),
        ));
    }
    Ok(token)
}

/// Resolve the owning user and require enabled status.
pub fn resolve_user(store: &Store, user_id: i64) -> GatewayResult<User> {
    let user = store
        .get_user(user_id)?
        .ok_or_else(|| GatewayError::Unauthorized(format!("user {} not found", user_id)))?;
    if user.status != UserStatus::Enabled {
        return Err(GatewayError::Forbidden("user is not enabled".to_string()));
    }
    Ok(user)
}

/// Apply the token's allowed-models filter.
pub fn check_model_allowed(token: &Token, model: &str) -> GatewayResult<()> {
    if let Some(allowed) = token.allowed_models() {
        if !allowed.iter().any(|m| m == model) {
            return Err(GatewayError::Forbidden(format!(
                "token may not use model {}",
                model
            )));
        }
    }
    Ok(())
}

/// Check the caller address against the token's allowed subnet, if
/// one is configured. IPv4 CIDR only; an unparsable rule rejects.
pub fn check_subnet(token: &Token, client_ip: Option<&str>) -> GatewayResult<()> {
    let Some(subnet) = token.subnet.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    let Some(ip) = client_ip.and_then(|raw| raw.trim().parse::<Ipv4Addr>().ok()) else {
        return Err(GatewayError::Forbidden(
            "client address is outside the token's subnet".to_string(),
        ));
    };
    if !cidr_contains(subnet, ip) {
        return Err(GatewayError::Forbidden(
            "client address is outside the token's subnet".to_string(),
        ));
    }
    Ok(())
}

fn cidr_contains(cidr: &str, ip: Ipv4Addr) -> bool {
    let (net, bits) = match cidr.split_once('/') {
        Some((net, bits)) => (net, bits),
        None => (cidr, "32"),
    };
    let Ok(net) = net.trim().parse::<Ipv4Addr>() else {
        return false;
    };
    let Ok(bits) = bits.trim().parse::<u32>() else {
        return false;
    };
    if bits > 32 {
        return false;
    }
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    (u32::from(net) & mask) == (u32::from(ip) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;
    use crate::db::users::UserRole;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(extract_bearer_key(&headers).is_none());
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-abc"));
        assert_eq!(extract_bearer_key(&headers).unwrap(), "sk-abc");
        headers.insert("authorization", HeaderValue::from_static("Basic xyz"));
        assert!(extract_bearer_key(&headers).is_none());
    }

    #[test]
    fn token_resolution_and_validation() {
        let (_dir, store) = test_store();
        let user_id = store
            .insert_user("mw", "U", "h", UserRole::Common, "default", 100)
            .unwrap();
        let key = "middlewaretestkey0000000000000000000000000000000";
        store
            .insert_token(user_id, key, "t", -1, 100, false, None)
            .unwrap();

        let token = resolve_token(&store, &format!("sk-{}", key)).unwrap();
        assert_eq!(token.user_id, user_id);
        // Bare body resolves too.
        let token = resolve_token(&store, key).unwrap();
        assert_eq!(token.user_id, user_id);

        let err = resolve_token(&store, "sk-nope").unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized(_)));
    }

    #[test]
    fn expired_token_is_marked_and_rejected() {
        let (_dir, store) = test_store();
        let key = "expiredtestkey000000000000000000000000000000000x";
        let id = store.insert_token(1, key, "t", 10, 100, false, None).unwrap();
        let err = resolve_token(&store, key).unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized(_)));
        let token = store.get_token(id).unwrap().unwrap();
        assert_eq!(token.status, TokenStatus::Expired);
    }

    #[test]
    fn exhausted_token_reports_quota() {
        let (_dir, store) = test_store();
        let key = "exhaustedtestkey00000000000000000000000000000000";
        store.insert_token(1, key, "t", -1, 0, false, None).unwrap();
        let err = resolve_token(&store, key).unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientQuota(_)));
    }

    #[test]
    fn disabled_user_is_forbidden() {
        let (_dir, store) = test_store();
        let user_id = store
            .insert_user("mw2", "U", "h", UserRole::Common, "default", 0)
            .unwrap();
        store
            .update_user_status(user_id, UserStatus::Disabled)
            .unwrap();
        let err = resolve_user(&store, user_id).unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[test]
    fn model_allowlist() {
        let token = Token {
            id: 1,
            user_id: 1,
            key: "x".into(),
            status: TokenStatus::Enabled,
            name: "t".into(),
            created_time: 0,
            accessed_time: 0,
            expired_time: -1,
            remain_quota: 1,
            unlimited_quota: false,
            used_quota: 0,
            models: Some("gpt-4o".into()),
            subnet: None,
        };
        assert!(check_model_allowed(&token, "gpt-4o").is_ok());
        assert!(check_model_allowed(&token, "claude-3").is_err());
    }

    #[test]
    fn subnet_matching() {
        assert!(cidr_contains("10.0.0.0/8", "10.1.2.3".parse().unwrap()));
        assert!(!cidr_contains("10.0.0.0/8", "11.1.2.3".parse().unwrap()));
        assert!(cidr_contains("192.168.1.42/32", "192.168.1.42".parse().unwrap()));
        assert!(cidr_contains("0.0.0.0/0", "8.8.8.8".parse().unwrap()));
        assert!(!cidr_contains("bad", "8.8.8.8".parse().unwrap()));
    }
}
