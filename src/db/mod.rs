//! Persistence gateway
//!
//! Typed CRUD over the single-file SQLite store. Connections are
//! opened per operation with WAL pragmas; every mutating operation
//! runs inside the bounded busy-retry wrapper.

pub mod abilities;
pub mod channels;
pub mod logs;
pub mod request_costs;
pub mod tokens;
pub mod traces;
pub mod transactions;
pub mod users;

use once_cell::sync::OnceCell;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clock::CancelToken;
use crate::error::{GatewayError, GatewayResult};
use crate::logger;

const MAX_BUSY_RETRIES: u32 = 5;
const BUSY_BACKOFF_STEP: Duration = Duration::from_millis(20);

/// Handle to the entity store. Cheap to clone; each operation opens
/// its own connection.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

/// SQL dialect for the few expressions that differ per backend. The
/// bundled store executes the SQLite form; the other variants are the
/// expressions row-store deployments run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Mysql,
    Postgres,
}

impl Dialect {
    /// Expression bucketing an epoch-seconds column into per-day keys.
    pub fn day_bucket_expr(&self, column: &str) -> String {
        match self {
            Dialect::Mysql => format!("DATE_FORMAT(FROM_UNIXTIME({}),'%Y-%m-%d')", column),
            Dialect::Postgres => format!(
                "TO_CHAR(date_trunc('day', to_timestamp({})),'YYYY-MM-DD')",
                column
            ),
            Dialect::Sqlite => format!("strftime('%Y-%m-%d', datetime({},'unixepoch'))", column),
        }
    }
}

static GLOBAL: OnceCell<Store> = OnceCell::new();

/// Install the process-wide store. Called once at startup.
pub fn init_global(path: &str) -> GatewayResult<()> {
    let store = Store::open(path)?;
    GLOBAL
        .set(store)
        .map_err(|_| GatewayError::Internal("store already initialized".to_string()))
}

/// The process-wide store handle.
pub fn global() -> &'static Store {
    GLOBAL.get().expect("store not initialized")
}

fn is_busy_error(e: &rusqlite::Error) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("database is locked")
        || msg.contains("database table is locked")
        || msg.contains("database is busy")
}

impl Store {
    /// Open (creating if needed) the store at `path` and ensure the
    /// schema exists. Schema creation is idempotent.
    pub fn open<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> GatewayResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "temp_store", "MEMORY").ok();
        conn.busy_timeout(Duration::from_millis(0)).ok();
        Ok(conn)
    }

    pub fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    /// Run `op` with bounded retry on lock contention. Retries at most
    /// 5 times with linear backoff (20 ms x attempt), only for the
    /// busy/locked error family; everything else propagates
    /// immediately. Aborts between attempts once `cancel` fires.
    pub fn with_busy_retry<T>(
        &self,
        cancel: Option<&CancelToken>,
        op: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> GatewayResult<T> {
        let conn = self.conn()?;
        let mut last_err: Option<rusqlite::Error> = None;
        for attempt in 1..=MAX_BUSY_RETRIES {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    let detail = last_err
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "not attempted".to_string());
                    return Err(GatewayError::Internal(format!(
                        "context canceled while waiting for lock: {}",
                        detail
                    )));
                }
            }
            match op(&conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_busy_error(&e) && attempt < MAX_BUSY_RETRIES => {
                    logger::debug(
                        "db",
                        &format!("store busy (attempt {}/{}): {}", attempt, MAX_BUSY_RETRIES, e),
                    );
                    last_err = Some(e);
                    std::thread::sleep(BUSY_BACKOFF_STEP * attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err
            .map(GatewayError::from)
            .unwrap_or_else(|| GatewayError::Internal("retry loop exhausted".to_string())))
    }

    fn init_schema(&self) -> GatewayResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL DEFAULT '',
                password TEXT NOT NULL DEFAULT '',
                role INTEGER NOT NULL DEFAULT 1,
                status INTEGER NOT NULL DEFAULT 1,
                email TEXT NOT NULL DEFAULT '',
                github_id TEXT NOT NULL DEFAULT '',
                oidc_id TEXT NOT NULL DEFAULT '',
                group_name TEXT NOT NULL DEFAULT 'default',
                quota INTEGER NOT NULL DEFAULT 0,
                used_quota INTEGER NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0,
                invite_code TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                key TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 1,
                name TEXT NOT NULL DEFAULT '',
                created_time INTEGER NOT NULL DEFAULT 0,
                accessed_time INTEGER NOT NULL DEFAULT 0,
                expired_time INTEGER NOT NULL DEFAULT -1,
                remain_quota INTEGER NOT NULL DEFAULT 0,
                unlimited_quota INTEGER NOT NULL DEFAULT 0,
                used_quota INTEGER NOT NULL DEFAULT 0,
                models TEXT,
                subnet TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tokens_key ON tokens(key);
            CREATE INDEX IF NOT EXISTS idx_tokens_user_id ON tokens(user_id);

            CREATE TABLE IF NOT EXISTS channels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type INTEGER NOT NULL DEFAULT 0,
                key TEXT NOT NULL DEFAULT '',
                status INTEGER NOT NULL DEFAULT 1,
                name TEXT NOT NULL DEFAULT '',
                weight INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 0,
                base_url TEXT NOT NULL DEFAULT '',
                models TEXT NOT NULL DEFAULT '',
                model_mapping TEXT,
                model_configs TEXT,
                groups TEXT NOT NULL DEFAULT 'default',
                config TEXT,
                test_model TEXT,
                rate_limit INTEGER NOT NULL DEFAULT 0,
                inference_profile_arn_map TEXT,
                used_quota INTEGER NOT NULL DEFAULT 0,
                created_time INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS abilities (
                group_name TEXT NOT NULL,
                model TEXT NOT NULL,
                channel_id INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 0,
                weight INTEGER NOT NULL DEFAULT 0,
                suspend_until INTEGER,
                PRIMARY KEY (group_name, model, channel_id)
            );
            CREATE INDEX IF NOT EXISTS idx_abilities_channel ON abilities(channel_id);

            CREATE TABLE IF NOT EXISTS token_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                transaction_id TEXT NOT NULL,
                token_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                status INTEGER NOT NULL DEFAULT 1,
                pre_quota INTEGER NOT NULL DEFAULT 0,
                final_quota INTEGER,
                reason TEXT NOT NULL DEFAULT '',
                request_id TEXT NOT NULL DEFAULT '',
                trace_id TEXT NOT NULL DEFAULT '',
                expires_at INTEGER NOT NULL DEFAULT 0,
                confirmed_at INTEGER,
                canceled_at INTEGER,
                auto_confirmed INTEGER NOT NULL DEFAULT 0,
                log_id INTEGER,
                elapsed_time_ms INTEGER,
                created_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tx_token_txid
                ON token_transactions(token_id, transaction_id);
            CREATE INDEX IF NOT EXISTS idx_tx_status_expires
                ON token_transactions(status, expires_at);

            CREATE TABLE IF NOT EXISTS user_request_costs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_time INTEGER NOT NULL DEFAULT 0,
                user_id INTEGER NOT NULL,
                request_id TEXT NOT NULL,
                quota INTEGER NOT NULL DEFAULT 0
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_request_costs_request_id
                ON user_request_costs(request_id);

            CREATE TABLE IF NOT EXISTS traces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trace_id TEXT NOT NULL,
                url TEXT NOT NULL DEFAULT '',
                method TEXT NOT NULL DEFAULT '',
                body_size INTEGER NOT NULL DEFAULT 0,
                http_status INTEGER NOT NULL DEFAULT 0,
                request_received INTEGER,
                request_forwarded INTEGER,
                first_upstream_response INTEGER,
                first_client_response INTEGER,
                upstream_completed INTEGER,
                request_completed INTEGER,
                created_at INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_traces_trace_id ON traces(trace_id);
            CREATE INDEX IF NOT EXISTS idx_traces_created_at ON traces(created_at);

            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL DEFAULT 0,
                type INTEGER NOT NULL DEFAULT 0,
                content TEXT NOT NULL DEFAULT '',
                username TEXT NOT NULL DEFAULT '',
                token_name TEXT NOT NULL DEFAULT '',
                model_name TEXT NOT NULL DEFAULT '',
                quota INTEGER NOT NULL DEFAULT 0,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                channel_id INTEGER NOT NULL DEFAULT 0,
                request_id TEXT NOT NULL DEFAULT '',
                trace_id TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL DEFAULT 0,
                elapsed_time INTEGER NOT NULL DEFAULT 0,
                is_stream INTEGER NOT NULL DEFAULT 0,
                system_prompt_reset INTEGER NOT NULL DEFAULT 0,
                cached_prompt_tokens INTEGER NOT NULL DEFAULT 0,
                cached_completion_tokens INTEGER NOT NULL DEFAULT 0,
                cache_write_5m_tokens INTEGER NOT NULL DEFAULT 0,
                cache_write_1h_tokens INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_logs_user_id ON logs(user_id);
            CREATE INDEX IF NOT EXISTS idx_logs_created_at_type ON logs(created_at, type);
            CREATE INDEX IF NOT EXISTS idx_logs_token_name ON logs(token_name);
            CREATE INDEX IF NOT EXISTS idx_logs_model_name ON logs(model_name);
            CREATE INDEX IF NOT EXISTS idx_logs_trace_id ON logs(trace_id);
            CREATE INDEX IF NOT EXISTS idx_logs_quota ON logs(quota);
            CREATE INDEX IF NOT EXISTS idx_logs_prompt_tokens ON logs(prompt_tokens);
            CREATE INDEX IF NOT EXISTS idx_logs_completion_tokens ON logs(completion_tokens);
            CREATE INDEX IF NOT EXISTS idx_logs_elapsed_time ON logs(elapsed_time);
            ",
        )?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(dir.path().join("test.db")).expect("open store");
    (dir, store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_init_is_idempotent() {
        let (dir, store) = test_store();
        // Re-opening runs CREATE IF NOT EXISTS again.
        let again = Store::open(dir.path().join("test.db")).unwrap();
        let conn = again.conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='logs'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        drop(store);
    }

    #[test]
    fn busy_retry_propagates_non_busy_errors() {
        let (_dir, store) = test_store();
        let err = store
            .with_busy_retry(None, |conn| {
                conn.execute("INSERT INTO no_such_table (x) VALUES (1)", [])
            })
            .unwrap_err();
        assert!(err.to_string().contains("no such table"));
    }

    #[test]
    fn busy_retry_honors_cancellation() {
        let (_dir, store) = test_store();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = store
            .with_busy_retry(Some(&cancel), |conn| {
                conn.execute("SELECT 1", []).map(|_| ())
            })
            .unwrap_err();
        assert!(err.to_string().contains("context canceled while waiting for lock"));
    }

    #[test]
    fn day_bucket_expr_per_dialect() {
        assert_eq!(
            Dialect::Sqlite.day_bucket_expr("created_at"),
            "strftime('%Y-%m-%d', datetime(created_at,'unixepoch'))"
        );
        assert!(Dialect::Mysql.day_bucket_expr("t").starts_with("DATE_FORMAT"));
        assert!(Dialect::Postgres.day_bucket_expr("t").starts_with("TO_CHAR"));
    }
}
