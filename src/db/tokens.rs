//! API token records. A token belongs to one user and carries its own
//! quota balance unless marked unlimited.

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::Store;
use crate::clock;
use crate::config;
use crate::error::{GatewayError, GatewayResult};

/// Prefixes earlier deployments stored on the key body. Exactly one is
/// stripped before the configured public prefix is applied.
const LEGACY_KEY_PREFIXES: &[&str] = &["sk-", "laisky-"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

impl TokenStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            TokenStatus::Enabled => 1,
            TokenStatus::Disabled => 2,
            TokenStatus::Expired => 3,
            TokenStatus::Exhausted => 4,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            2 => TokenStatus::Disabled,
            3 => TokenStatus::Expired,
            4 => TokenStatus::Exhausted,
            _ => TokenStatus::Enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Token {
    pub id: i64,
    pub user_id: i64,
    #[serde(serialize_with = "serialize_key")]
    pub key: String,
    pub status: TokenStatus,
    pub name: String,
    pub created_time: i64,
    pub accessed_time: i64,
    /// -1 means the token never expires.
    pub expired_time: i64,
    /// -1 together with `unlimited_quota` means no token-side limit.
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub used_quota: i64,
    /// Optional CSV of models this token may request.
    pub models: Option<String>,
    /// Optional CIDR the caller must originate from.
    pub subnet: Option<String>,
}

/// Swap the public prefix onto a stored key body, stripping at most
/// one legacy prefix first.
pub fn key_with_prefix(stored: &str, prefix: &str) -> String {
    let mut body = stored;
    for legacy in LEGACY_KEY_PREFIXES {
        if let Some(rest) = body.strip_prefix(legacy) {
            body = rest;
            break;
        }
    }
    format!("{}{}", prefix, body)
}

/// Inverse of the projection for lookups: strip the configured prefix
/// (or a legacy one) off an inbound bearer key.
pub fn key_without_prefix(presented: &str, prefix: &str) -> String {
    if !prefix.is_empty() {
        if let Some(rest) = presented.strip_prefix(prefix) {
            return rest.to_string();
        }
    }
    for legacy in LEGACY_KEY_PREFIXES {
        if let Some(rest) = presented.strip_prefix(legacy) {
            return rest.to_string();
        }
    }
    presented.to_string()
}

/// The JSON projection with the configured public prefix applied.
pub fn display_key(stored: &str) -> String {
    key_with_prefix(stored, &config::load().token_key_prefix)
}

/// Stored-body form of an inbound bearer key.
pub fn lookup_key(presented: &str) -> String {
    key_without_prefix(presented, &config::load().token_key_prefix)
}

fn serialize_key<S: serde::Serializer>(key: &str, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&display_key(key))
}

impl Token {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Token {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            key: row.get("key")?,
            status: TokenStatus::from_i64(row.get("status")?),
            name: row.get("name")?,
            created_time: row.get("created_time")?,
            accessed_time: row.get("accessed_time")?,
            expired_time: row.get("expired_time")?,
            remain_quota: row.get("remain_quota")?,
            unlimited_quota: row.get::<_, i64>("unlimited_quota")? != 0,
            used_quota: row.get("used_quota")?,
            models: row.get("models")?,
            subnet: row.get("subnet")?,
        })
    }

    pub fn is_expired(&self, now_s: i64) -> bool {
        self.expired_time != -1 && self.expired_time <= now_s
    }

    pub fn is_exhausted(&self) -> bool {
        !self.unlimited_quota && self.remain_quota <= 0
    }

    /// Models this token may use; `None` means no restriction.
    pub fn allowed_models(&self) -> Option<Vec<String>> {
        let csv = self.models.as_deref()?.trim();
        if csv.is_empty() {
            return None;
        }
        Some(
            csv.split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect(),
        )
    }
}

const TOKEN_COLUMNS: &str = "id, user_id, key, status, name, created_time, accessed_time, \
     expired_time, remain_quota, unlimited_quota, used_quota, models, subnet";

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub fn insert_token(
        &self,
        user_id: i64,
        key: &str,
        name: &str,
        expired_time: i64,
        remain_quota: i64,
        unlimited_quota: bool,
        models: Option<&str>,
    ) -> GatewayResult<i64> {
        let now = clock::now_s();
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "INSERT INTO tokens (user_id, key, status, name, created_time, accessed_time, \
                 expired_time, remain_quota, unlimited_quota, models) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7, ?8, ?9)",
                params![
                    user_id,
                    key,
                    TokenStatus::Enabled.as_i64(),
                    name,
                    now,
                    expired_time,
                    remain_quota,
                    unlimited_quota as i64,
                    models
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_token(&self, id: i64) -> GatewayResult<Option<Token>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {} FROM tokens WHERE id = ?1", TOKEN_COLUMNS))?;
        Ok(stmt.query_row(params![id], Token::from_row).optional()?)
    }

    pub fn get_token_by_key(&self, key: &str) -> GatewayResult<Option<Token>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(&format!("SELECT {} FROM tokens WHERE key = ?1", TOKEN_COLUMNS))?;
        Ok(stmt.query_row(params![key], Token::from_row).optional()?)
    }

    pub fn update_token_status(&self, id: i64, status: TokenStatus) -> GatewayResult<()> {
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "UPDATE tokens SET status = ?1 WHERE id = ?2",
                params![status.as_i64(), id],
            )
        })?;
        Ok(())
    }

    pub fn touch_token(&self, id: i64) -> GatewayResult<()> {
        let now = clock::now_s();
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "UPDATE tokens SET accessed_time = ?1 WHERE id = ?2",
                params![now, id],
            )
        })?;
        Ok(())
    }

    /// Remaining balance plus the unlimited flag.
    pub fn get_token_quota(&self, id: i64) -> GatewayResult<(i64, bool)> {
        let conn = self.conn()?;
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT remain_quota, unlimited_quota FROM tokens WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (remain, unlimited) =
            row.ok_or_else(|| GatewayError::NotFound(format!("token {}", id)))?;
        Ok((remain, unlimited != 0))
    }

    pub fn increase_token_quota(&self, id: i64, q: i64) -> GatewayResult<()> {
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "UPDATE tokens SET remain_quota = remain_quota + ?1 WHERE id = ?2 \
                 AND unlimited_quota = 0",
                params![q, id],
            )
        })?;
        Ok(())
    }

    /// Conditional decrement mirroring the user-side rule. Unlimited
    /// tokens are skipped by the caller, not here.
    pub fn decrease_token_quota(&self, id: i64, q: i64) -> GatewayResult<()> {
        let affected = self.with_busy_retry(None, |conn| {
            conn.execute(
                "UPDATE tokens SET remain_quota = remain_quota - ?1 WHERE id = ?2 \
                 AND unlimited_quota = 0 AND remain_quota >= ?1",
                params![q, id],
            )
        })?;
        if affected == 0 {
            return Err(GatewayError::InsufficientQuota(format!(
                "token {} cannot cover {}",
                id, q
            )));
        }
        Ok(())
    }

    pub fn increase_token_used_quota(&self, id: i64, used: i64) -> GatewayResult<()> {
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "UPDATE tokens SET used_quota = used_quota + ?1 WHERE id = ?2",
                params![used, id],
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;

    fn seed_token(store: &Store, remain: i64, unlimited: bool) -> i64 {
        store
            .insert_token(7, "k".repeat(48).as_str(), "test", -1, remain, unlimited, None)
            .unwrap()
    }

    #[test]
    fn key_projection_swaps_prefix() {
        assert_eq!(key_with_prefix("laisky-abcdef", "custom-"), "custom-abcdef");
        assert_eq!(key_with_prefix("sk-abcdef", "custom-"), "custom-abcdef");
        assert_eq!(key_with_prefix("abcdef", "custom-"), "custom-abcdef");

        assert_eq!(key_without_prefix("custom-abcdef", "custom-"), "abcdef");
        assert_eq!(key_without_prefix("sk-abcdef", "custom-"), "abcdef");
        assert_eq!(key_without_prefix("abcdef", "custom-"), "abcdef");
    }

    #[test]
    fn expiry_and_exhaustion_rules() {
        let token = Token {
            id: 1,
            user_id: 1,
            key: "x".into(),
            status: TokenStatus::Enabled,
            name: "t".into(),
            created_time: 0,
            accessed_time: 0,
            expired_time: -1,
            remain_quota: 0,
            unlimited_quota: false,
            used_quota: 0,
            models: None,
            subnet: None,
        };
        assert!(!token.is_expired(1_000_000));
        assert!(token.is_exhausted());

        let mut unlimited = token.clone();
        unlimited.unlimited_quota = true;
        assert!(!unlimited.is_exhausted());

        let mut expiring = token;
        expiring.expired_time = 10;
        assert!(expiring.is_expired(10));
        assert!(!expiring.is_expired(9));
    }

    #[test]
    fn allowed_models_parses_csv() {
        let mut token = Token {
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
            models: Some("gpt-4o, claude-3-haiku ,".into()),
            subnet: None,
        };
        assert_eq!(
            token.allowed_models().unwrap(),
            vec!["gpt-4o".to_string(), "claude-3-haiku".to_string()]
        );
        token.models = Some("  ".into());
        assert!(token.allowed_models().is_none());
    }

    #[test]
    fn token_quota_decrement_is_conditional() {
        let (_dir, store) = test_store();
        let id = seed_token(&store, 100, false);

        store.decrease_token_quota(id, 70).unwrap();
        assert_eq!(store.get_token_quota(id).unwrap(), (30, false));

        let err = store.decrease_token_quota(id, 31).unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientQuota(_)));
        assert_eq!(store.get_token_quota(id).unwrap(), (30, false));
    }

    #[test]
    fn unlimited_token_balance_is_left_alone() {
        let (_dir, store) = test_store();
        let id = seed_token(&store, -1, true);
        store.increase_token_quota(id, 50).unwrap();
        assert_eq!(store.get_token_quota(id).unwrap(), (-1, true));
    }

    #[test]
    fn duplicate_key_rejected() {
        let (_dir, store) = test_store();
        seed_token(&store, 10, false);
        let err = store
            .insert_token(8, "k".repeat(48).as_str(), "dup", -1, 0, false, None)
            .unwrap_err();
        assert!(err.to_string().to_lowercase().contains("unique"));
    }
}
