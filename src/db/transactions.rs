//! TokenTransaction rows: the durable half of the two-phase quota
//! reservation.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::Store;
use crate::clock;
use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    AutoConfirmed,
    Canceled,
}

impl TransactionStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            TransactionStatus::Pending => 1,
            TransactionStatus::Confirmed => 2,
            TransactionStatus::AutoConfirmed => 3,
            TransactionStatus::Canceled => 4,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            2 => TransactionStatus::Confirmed,
            3 => TransactionStatus::AutoConfirmed,
            4 => TransactionStatus::Canceled,
            _ => TransactionStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenTransaction {
    pub id: i64,
    pub transaction_id: String,
    pub token_id: i64,
    pub user_id: i64,
    pub status: TransactionStatus,
    pub pre_quota: i64,
    pub final_quota: Option<i64>,
    pub reason: String,
    pub request_id: String,
    pub trace_id: String,
    /// Epoch seconds; 0 means the hold never auto-confirms.
    pub expires_at: i64,
    pub confirmed_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub auto_confirmed: bool,
    pub log_id: Option<i64>,
    pub elapsed_time_ms: Option<i64>,
    pub created_at: i64,
}

impl TokenTransaction {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(TokenTransaction {
            id: row.get("id")?,
            transaction_id: row.get("transaction_id")?,
            token_id: row.get("token_id")?,
            user_id: row.get("user_id")?,
            status: TransactionStatus::from_i64(row.get("status")?),
            pre_quota: row.get("pre_quota")?,
            final_quota: row.get("final_quota")?,
            reason: row.get("reason")?,
            request_id: row.get("request_id")?,
            trace_id: row.get("trace_id")?,
            expires_at: row.get("expires_at")?,
            confirmed_at: row.get("confirmed_at")?,
            canceled_at: row.get("canceled_at")?,
            auto_confirmed: row.get::<_, i64>("auto_confirmed")? != 0,
            log_id: row.get("log_id")?,
            elapsed_time_ms: row.get("elapsed_time_ms")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Columns the transaction updater will touch. Anything else is an
/// UnsupportedField error so a typo cannot write arbitrary columns.
const UPDATABLE_FIELDS: &[&str] = &[
    "status",
    "final_quota",
    "confirmed_at",
    "auto_confirmed",
    "expires_at",
    "reason",
    "elapsed_time_ms",
    "canceled_at",
];

const TX_COLUMNS: &str = "id, transaction_id, token_id, user_id, status, pre_quota, final_quota, \
     reason, request_id, trace_id, expires_at, confirmed_at, canceled_at, auto_confirmed, \
     log_id, elapsed_time_ms, created_at";

impl Store {
    /// Insert a pending hold. A duplicate (token_id, transaction_id)
    /// maps to Conflict so the caller can resolve idempotently.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_transaction(
        &self,
        transaction_id: &str,
        token_id: i64,
        user_id: i64,
        pre_quota: i64,
        reason: &str,
        request_id: &str,
        trace_id: &str,
        expires_at: i64,
    ) -> GatewayResult<i64> {
        let now = clock::now_ms();
        let result = self.with_busy_retry(None, |conn| {
            conn.execute(
                "INSERT INTO token_transactions (transaction_id, token_id, user_id, status, \
                 pre_quota, reason, request_id, trace_id, expires_at, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    transaction_id,
                    token_id,
                    user_id,
                    TransactionStatus::Pending.as_i64(),
                    pre_quota,
                    reason,
                    request_id,
                    trace_id,
                    expires_at,
                    now
                ],
            )?;
            Ok(conn.last_insert_rowid())
        });
        match result {
            Err(e) if e.to_string().to_lowercase().contains("unique") => {
                Err(GatewayError::Conflict(format!(
                    "transaction ({}, {}) already exists",
                    token_id, transaction_id
                )))
            }
            other => other,
        }
    }

    pub fn get_transaction(
        &self,
        token_id: i64,
        transaction_id: &str,
    ) -> GatewayResult<Option<TokenTransaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM token_transactions WHERE token_id = ?1 AND transaction_id = ?2",
            TX_COLUMNS
        ))?;
        Ok(stmt
            .query_row(params![token_id, transaction_id], TokenTransaction::from_row)
            .optional()?)
    }

    /// Allow-listed field update on one transaction row.
    pub fn update_transaction_fields(
        &self,
        token_id: i64,
        transaction_id: &str,
        fields: &[(&str, SqlValue)],
    ) -> GatewayResult<usize> {
        if fields.is_empty() {
            return Ok(0);
        }
        for (name, _) in fields {
            if !UPDATABLE_FIELDS.contains(name) {
                return Err(GatewayError::UnsupportedField(name.to_string()));
            }
        }
        let assignments: Vec<String> = fields
            .iter()
            .enumerate()
            .map(|(i, (name, _))| format!("{} = ?{}", name, i + 1))
            .collect();
        let sql = format!(
            "UPDATE token_transactions SET {} WHERE token_id = ?{} AND transaction_id = ?{}",
            assignments.join(", "),
            fields.len() + 1,
            fields.len() + 2
        );
        crate::logger::sql(&sql);
        self.with_busy_retry(None, |conn| {
            let mut stmt = conn.prepare(&sql)?;
            for (i, (_, value)) in fields.iter().enumerate() {
                stmt.raw_bind_parameter(i + 1, value)?;
            }
            stmt.raw_bind_parameter(fields.len() + 1, token_id)?;
            stmt.raw_bind_parameter(fields.len() + 2, transaction_id)?;
            stmt.raw_execute()
        })
        .map_err(Into::into)
    }

    /// Pending -> terminal transition guarded at the SQL level: zero
    /// rows affected means the row was already finalized (or absent).
    pub fn finalize_transaction(
        &self,
        token_id: i64,
        transaction_id: &str,
        to: TransactionStatus,
        final_quota: Option<i64>,
        auto: bool,
    ) -> GatewayResult<bool> {
        let now = clock::now_s();
        let (confirmed_at, canceled_at) = match to {
            TransactionStatus::Canceled => (None, Some(now)),
            _ => (Some(now), None),
        };
        let affected = self.with_busy_retry(None, |conn| {
            conn.execute(
                "UPDATE token_transactions SET status = ?1, final_quota = ?2, \
                 confirmed_at = ?3, canceled_at = ?4, auto_confirmed = ?5, expires_at = 0 \
                 WHERE token_id = ?6 AND transaction_id = ?7 AND status = ?8",
                params![
                    to.as_i64(),
                    final_quota,
                    confirmed_at,
                    canceled_at,
                    auto as i64,
                    token_id,
                    transaction_id,
                    TransactionStatus::Pending.as_i64()
                ],
            )
        })?;
        Ok(affected == 1)
    }

    /// Move every expired pending hold to auto_confirmed with
    /// `final_quota = pre_quota`. Idempotent by its WHERE clause.
    pub fn auto_confirm_expired(&self, now_s: i64) -> GatewayResult<Vec<TokenTransaction>> {
        let expired: Vec<TokenTransaction> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM token_transactions \
                 WHERE status = ?1 AND expires_at > 0 AND expires_at <= ?2",
                TX_COLUMNS
            ))?;
            let rows = stmt.query_map(
                params![TransactionStatus::Pending.as_i64(), now_s],
                TokenTransaction::from_row,
            )?;
            rows.filter_map(|r| r.ok()).collect()
        };
        let mut confirmed = Vec::new();
        for tx in expired {
            let moved = self.finalize_transaction(
                tx.token_id,
                &tx.transaction_id,
                TransactionStatus::AutoConfirmed,
                Some(tx.pre_quota),
                true,
            )?;
            if moved {
                confirmed.push(tx);
            }
        }
        Ok(confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;

    fn seed_tx(store: &Store, txid: &str, pre: i64, expires_at: i64) {
        store
            .insert_transaction(txid, 5, 7, pre, "chat", "req-1", "trace-1", expires_at)
            .unwrap();
    }

    #[test]
    fn duplicate_hold_is_conflict() {
        let (_dir, store) = test_store();
        seed_tx(&store, "X", 100, 0);
        let err = store
            .insert_transaction("X", 5, 7, 100, "chat", "req-1", "trace-1", 0)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[test]
    fn updater_rejects_unknown_fields() {
        let (_dir, store) = test_store();
        seed_tx(&store, "X", 100, 0);
        let err = store
            .update_transaction_fields(5, "X", &[("pre_quota", SqlValue::Integer(0))])
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedField(_)));

        let touched = store
            .update_transaction_fields(
                5,
                "X",
                &[
                    ("reason", SqlValue::Text("late".into())),
                    ("elapsed_time_ms", SqlValue::Integer(42)),
                ],
            )
            .unwrap();
        assert_eq!(touched, 1);
        let tx = store.get_transaction(5, "X").unwrap().unwrap();
        assert_eq!(tx.reason, "late");
        assert_eq!(tx.elapsed_time_ms, Some(42));
    }

    #[test]
    fn finalize_only_from_pending() {
        let (_dir, store) = test_store();
        seed_tx(&store, "X", 200, 0);
        assert!(store
            .finalize_transaction(5, "X", TransactionStatus::Confirmed, Some(150), false)
            .unwrap());
        // Second transition is refused by the guard.
        assert!(!store
            .finalize_transaction(5, "X", TransactionStatus::Canceled, None, false)
            .unwrap());
        let tx = store.get_transaction(5, "X").unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Confirmed);
        assert_eq!(tx.final_quota, Some(150));
        assert_eq!(tx.expires_at, 0);
    }

    #[test]
    fn sweep_confirms_only_expired_holds() {
        let (_dir, store) = test_store();
        let now = clock::now_s();
        seed_tx(&store, "expired", 200, now - 1);
        seed_tx(&store, "future", 100, now + 1000);
        seed_tx(&store, "no-timeout", 50, 0);

        let confirmed = store.auto_confirm_expired(now).unwrap();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].transaction_id, "expired");

        let expired = store.get_transaction(5, "expired").unwrap().unwrap();
        assert_eq!(expired.status, TransactionStatus::AutoConfirmed);
        assert_eq!(expired.final_quota, Some(200));
        assert!(expired.auto_confirmed);

        // expires_at = 0 is never auto-confirmed.
        let untouched = store.get_transaction(5, "no-timeout").unwrap().unwrap();
        assert_eq!(untouched.status, TransactionStatus::Pending);

        // Sweep is idempotent.
        assert!(store.auto_confirm_expired(now).unwrap().is_empty());
    }
}
