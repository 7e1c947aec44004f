//! User records: identity, role, group membership, and the user-side
//! quota balance.

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::Store;
use crate::clock;
use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Guest,
    Common,
    Admin,
    Root,
}

impl UserRole {
    pub fn as_i64(&self) -> i64 {
        match self {
            UserRole::Guest => 0,
            UserRole::Common => 1,
            UserRole::Admin => 10,
            UserRole::Root => 100,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            100 => UserRole::Root,
            10 => UserRole::Admin,
            0 => UserRole::Guest,
            _ => UserRole::Common,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Enabled,
    Disabled,
    Deleted,
}

impl UserStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            UserStatus::Enabled => 1,
            UserStatus::Disabled => 2,
            UserStatus::Deleted => 3,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            2 => UserStatus::Disabled,
            3 => UserStatus::Deleted,
            _ => UserStatus::Enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub role: UserRole,
    pub status: UserStatus,
    pub email: String,
    pub github_id: String,
    pub oidc_id: String,
    pub group: String,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
    pub invite_code: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(User {
            id: row.get("id")?,
            username: row.get("username")?,
            display_name: row.get("display_name")?,
            password: row.get("password")?,
            role: UserRole::from_i64(row.get("role")?),
            status: UserStatus::from_i64(row.get("status")?),
            email: row.get("email")?,
            github_id: row.get("github_id")?,
            oidc_id: row.get("oidc_id")?,
            group: row.get("group_name")?,
            quota: row.get("quota")?,
            used_quota: row.get("used_quota")?,
            request_count: row.get("request_count")?,
            invite_code: row.get("invite_code")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

const USER_COLUMNS: &str = "id, username, display_name, password, role, status, email, \
     github_id, oidc_id, group_name, quota, used_quota, request_count, invite_code, \
     created_at, updated_at";

impl Store {
    pub fn insert_user(
        &self,
        username: &str,
        display_name: &str,
        password: &str,
        role: UserRole,
        group: &str,
        quota: i64,
    ) -> GatewayResult<i64> {
        let now = clock::now_ms();
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "INSERT INTO users (username, display_name, password, role, status, group_name, \
                 quota, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    username,
                    display_name,
                    password,
                    role.as_i64(),
                    UserStatus::Enabled.as_i64(),
                    group,
                    quota,
                    now
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user(&self, id: i64) -> GatewayResult<Option<User>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS))?;
        Ok(stmt
            .query_row(params![id], User::from_row)
            .optional()?)
    }

    pub fn get_user_by_username(&self, username: &str) -> GatewayResult<Option<User>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM users WHERE username = ?1",
            USER_COLUMNS
        ))?;
        Ok(stmt
            .query_row(params![username], User::from_row)
            .optional()?)
    }

    pub fn user_count(&self) -> GatewayResult<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT count(*) FROM users WHERE status != ?1",
            params![UserStatus::Deleted.as_i64()],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    pub fn update_user_status(&self, id: i64, status: UserStatus) -> GatewayResult<()> {
        let now = clock::now_ms();
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "UPDATE users SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_i64(), now, id],
            )
        })?;
        Ok(())
    }

    pub fn get_user_group(&self, id: i64) -> GatewayResult<String> {
        let conn = self.conn()?;
        let group: Option<String> = conn
            .query_row(
                "SELECT group_name FROM users WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        group.ok_or_else(|| GatewayError::NotFound(format!("user {}", id)))
    }

    pub fn get_user_quota(&self, id: i64) -> GatewayResult<i64> {
        let conn = self.conn()?;
        let quota: Option<i64> = conn
            .query_row("SELECT quota FROM users WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .optional()?;
        quota.ok_or_else(|| GatewayError::NotFound(format!("user {}", id)))
    }

    /// Unconditional increment (refunds, top-ups). `q >= 0`.
    pub fn increase_user_quota(&self, id: i64, q: i64) -> GatewayResult<()> {
        let now = clock::now_ms();
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "UPDATE users SET quota = quota + ?1, updated_at = ?2 WHERE id = ?3",
                params![q, now, id],
            )
        })?;
        Ok(())
    }

    /// Conditional decrement: exactly one row must satisfy
    /// `quota >= q`; zero rows affected means insufficient quota and
    /// nothing is written.
    pub fn decrease_user_quota(&self, id: i64, q: i64) -> GatewayResult<()> {
        let now = clock::now_ms();
        let affected = self.with_busy_retry(None, |conn| {
            conn.execute(
                "UPDATE users SET quota = quota - ?1, updated_at = ?2 \
                 WHERE id = ?3 AND quota >= ?1",
                params![q, now, id],
            )
        })?;
        if affected == 0 {
            return Err(GatewayError::InsufficientQuota(format!(
                "user {} cannot cover {}",
                id, q
            )));
        }
        Ok(())
    }

    /// Accounting counters updated after billing settles.
    pub fn increase_user_used_quota_and_request_count(
        &self,
        id: i64,
        used: i64,
        requests: i64,
    ) -> GatewayResult<()> {
        let now = clock::now_ms();
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "UPDATE users SET used_quota = used_quota + ?1, \
                 request_count = request_count + ?2, updated_at = ?3 WHERE id = ?4",
                params![used, requests, now, id],
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;

    fn seed_user(store: &Store, quota: i64) -> i64 {
        store
            .insert_user("alice", "Alice", "hash", UserRole::Common, "default", quota)
            .unwrap()
    }

    #[test]
    fn insert_and_fetch_roundtrip() {
        let (_dir, store) = test_store();
        let id = seed_user(&store, 500);
        let user = store.get_user(id).unwrap().unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.group, "default");
        assert_eq!(user.quota, 500);
        assert_eq!(user.status, UserStatus::Enabled);
    }

    #[test]
    fn decrease_quota_is_conditional() {
        let (_dir, store) = test_store();
        let id = seed_user(&store, 100);

        store.decrease_user_quota(id, 60).unwrap();
        assert_eq!(store.get_user_quota(id).unwrap(), 40);

        // Would go negative: refused without writing.
        let err = store.decrease_user_quota(id, 41).unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientQuota(_)));
        assert_eq!(store.get_user_quota(id).unwrap(), 40);
    }

    #[test]
    fn soft_delete_via_status() {
        let (_dir, store) = test_store();
        let id = seed_user(&store, 0);
        store.update_user_status(id, UserStatus::Deleted).unwrap();
        let user = store.get_user(id).unwrap().unwrap();
        assert_eq!(user.status, UserStatus::Deleted);
        assert_eq!(store.user_count().unwrap(), 0);
    }

    #[test]
    fn duplicate_username_rejected() {
        let (_dir, store) = test_store();
        seed_user(&store, 0);
        let err = store
            .insert_user("alice", "Alice II", "hash", UserRole::Common, "default", 0)
            .unwrap_err();
        assert!(err.to_string().to_lowercase().contains("unique"));
    }
}
