//! Environment-driven configuration.
//!
//! Every recognized option is read once at startup into a process-wide
//! `Settings`; call sites use `config::load()`.

use once_cell::sync::Lazy;
use std::sync::RwLock;

/// Quota units per displayed dollar.
pub const QUOTA_PER_USD: i64 = 500_000;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Public prefix applied to serialized token keys.
    pub token_key_prefix: String,
    /// Enable the batched quota-update ledgers.
    pub batch_update_enabled: bool,
    /// Drain period for the batched ledgers, in seconds.
    pub batch_update_interval_secs: u64,
    pub sql_max_idle_conns: u32,
    pub sql_max_open_conns: u32,
    pub sql_max_lifetime_secs: u64,
    pub debug_sql_enabled: bool,
    /// Bootstrap seed for the root user's first API token.
    pub initial_root_token: Option<String>,
    /// Bootstrap seed for the root user's dashboard access token.
    pub initial_root_access_token: Option<String>,
    /// Trace retention in days; 0 disables the sweep worker.
    pub trace_retention_days: i64,
    pub quota_remind_threshold: i64,
    pub quota_for_new_user: i64,
    pub quota_for_invitee: i64,
    pub quota_for_inviter: i64,
    /// Fallback completion budget when a request carries no max_tokens.
    pub default_max_token: i64,
    /// Public base address, used for transactional links.
    pub server_address: String,
    /// Master nodes run migrations, bootstrap, and background workers.
    pub is_master_node: bool,
    /// Socket the gateway listens on.
    pub listen_address: String,
    /// SQLite store location.
    pub db_path: String,
    /// How long a pre-consume hold lives before auto-confirmation, seconds.
    pub transaction_timeout_secs: i64,
    /// Sweep period for expired pending transactions, seconds.
    pub transaction_sweep_interval_secs: u64,
    /// Suspension window applied to a channel after a transient failure, seconds.
    pub channel_suspend_secs: i64,
    /// Bound on channel re-selection per request.
    pub max_channel_retries: u32,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            token_key_prefix: env_str("TOKEN_KEY_PREFIX", "sk-"),
            batch_update_enabled: env_bool("BATCH_UPDATE_ENABLED", false),
            batch_update_interval_secs: env_u64("BATCH_UPDATE_INTERVAL", 5),
            sql_max_idle_conns: env_i64("SQL_MAX_IDLE_CONNS", 100) as u32,
            sql_max_open_conns: env_i64("SQL_MAX_OPEN_CONNS", 1000) as u32,
            sql_max_lifetime_secs: env_u64("SQL_MAX_LIFETIME_SECS", 60),
            debug_sql_enabled: env_bool("DEBUG_SQL_ENABLED", false),
            initial_root_token: env_opt("INITIAL_ROOT_TOKEN"),
            initial_root_access_token: env_opt("INITIAL_ROOT_ACCESS_TOKEN"),
            trace_retention_days: env_i64("TRACE_RETENTION_DAYS", 30),
            quota_remind_threshold: env_i64("QUOTA_REMIND_THRESHOLD", 1000),
            quota_for_new_user: env_i64("QUOTA_FOR_NEW_USER", 0),
            quota_for_invitee: env_i64("QUOTA_FOR_INVITEE", 0),
            quota_for_inviter: env_i64("QUOTA_FOR_INVITER", 0),
            default_max_token: env_i64("DEFAULT_MAX_TOKEN", 2048),
            server_address: env_str("SERVER_ADDRESS", "http://localhost:3000"),
            is_master_node: env_bool("IS_MASTER_NODE", true),
            listen_address: env_str("LISTEN_ADDRESS", "0.0.0.0:3000"),
            db_path: env_str("DB_PATH", "relay-gateway.db"),
            transaction_timeout_secs: env_i64("TRANSACTION_TIMEOUT_SECS", 300),
            transaction_sweep_interval_secs: env_u64("TRANSACTION_SWEEP_INTERVAL", 60),
            channel_suspend_secs: env_i64("CHANNEL_SUSPEND_SECS", 60),
            max_channel_retries: env_i64("MAX_CHANNEL_RETRIES", 3) as u32,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}

static SETTINGS: Lazy<RwLock<Settings>> = Lazy::new(|| RwLock::new(Settings::from_env()));

/// Snapshot of the current settings.
pub fn load() -> Settings {
    SETTINGS.read().expect("settings lock poisoned").clone()
}

/// Replace the process settings. Used at startup and by tests.
pub fn install(settings: Settings) {
    *SETTINGS.write().expect("settings lock poisoned") = settings;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::from_env();
        assert!(settings.transaction_timeout_secs > 0);
        assert!(settings.max_channel_retries >= 1);
        assert!(settings.batch_update_interval_secs > 0);
    }
}
