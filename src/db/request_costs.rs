//! Final per-request cost rows, addressed by request id. Kept seven
//! days for reconciliation, then swept.

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::Store;
use crate::clock;
use crate::config::QUOTA_PER_USD;
use crate::error::GatewayResult;

const RETENTION_MS: i64 = 7 * 86_400 * 1000;

#[derive(Debug, Clone, Serialize)]
pub struct UserRequestCost {
    pub id: i64,
    pub created_time: i64,
    pub user_id: i64,
    pub request_id: String,
    pub quota: i64,
}

impl UserRequestCost {
    pub fn cost_usd(&self) -> f64 {
        self.quota as f64 / QUOTA_PER_USD as f64
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(UserRequestCost {
            id: row.get("id")?,
            created_time: row.get("created_time")?,
            user_id: row.get("user_id")?,
            request_id: row.get("request_id")?,
            quota: row.get("quota")?,
        })
    }
}

impl Store {
    /// Create-or-replace the cost for a request id. The unique index
    /// on request_id keeps concurrent callers down to one row.
    pub fn update_user_request_cost_quota_by_request_id(
        &self,
        user_id: i64,
        request_id: &str,
        quota: i64,
    ) -> GatewayResult<()> {
        let now = clock::now_ms();
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "INSERT INTO user_request_costs (created_time, user_id, request_id, quota) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(request_id) DO UPDATE SET \
                 quota = excluded.quota, user_id = excluded.user_id, \
                 created_time = excluded.created_time",
                params![now, user_id, request_id, quota],
            )
        })?;
        Ok(())
    }

    pub fn get_cost_by_request_id(
        &self,
        request_id: &str,
    ) -> GatewayResult<Option<UserRequestCost>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, created_time, user_id, request_id, quota \
             FROM user_request_costs WHERE request_id = ?1",
        )?;
        Ok(stmt
            .query_row(params![request_id], UserRequestCost::from_row)
            .optional()?)
    }

    /// Delete rows older than seven days. Called on a sampled basis
    /// from the happy path, so it must stay cheap.
    pub fn sweep_expired_request_costs(&self, now_ms: i64) -> GatewayResult<usize> {
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "DELETE FROM user_request_costs WHERE created_time < ?1",
                params![now_ms - RETENTION_MS],
            )
        })
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;

    #[test]
    fn upsert_is_idempotent_per_request_id() {
        let (_dir, store) = test_store();
        for k in 0..10 {
            store
                .update_user_request_cost_quota_by_request_id(42, "r-1", k)
                .unwrap();
        }
        store
            .update_user_request_cost_quota_by_request_id(42, "r-1", 9)
            .unwrap();

        let conn = store.conn().unwrap();
        let rows: i64 = conn
            .query_row(
                "SELECT count(*) FROM user_request_costs WHERE request_id = 'r-1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(rows, 1);

        let cost = store.get_cost_by_request_id("r-1").unwrap().unwrap();
        assert_eq!(cost.user_id, 42);
        assert_eq!(cost.quota, 9);
    }

    #[test]
    fn cost_usd_uses_the_unit_ratio() {
        let (_dir, store) = test_store();
        store
            .update_user_request_cost_quota_by_request_id(1, "r-2", 500_000)
            .unwrap();
        let cost = store.get_cost_by_request_id("r-2").unwrap().unwrap();
        assert!((cost.cost_usd() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sweep_drops_only_old_rows() {
        let (_dir, store) = test_store();
        let now = clock::now_ms();
        store
            .update_user_request_cost_quota_by_request_id(1, "old", 5)
            .unwrap();
        {
            let conn = store.conn().unwrap();
            conn.execute(
                "UPDATE user_request_costs SET created_time = ?1 WHERE request_id = 'old'",
                params![now - RETENTION_MS - 1],
            )
            .unwrap();
        }
        store
            .update_user_request_cost_quota_by_request_id(1, "fresh", 5)
            .unwrap();

        let removed = store.sweep_expired_request_costs(now).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_cost_by_request_id("old").unwrap().is_none());
        assert!(store.get_cost_by_request_id("fresh").unwrap().is_some());
    }
}
