//! Global logger
//!
//! Scoped, leveled logging to stderr. The durable audit trail is the
//! consumption log in the store; this logger is for operator output.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

static MIN_LEVEL: Lazy<AtomicU8> = Lazy::new(|| AtomicU8::new(level_to_u8(LogLevel::Info)));

fn level_to_u8(level: LogLevel) -> u8 {
    match level {
        LogLevel::Debug => 0,
        LogLevel::Info => 1,
        LogLevel::Warn => 2,
        LogLevel::Error => 3,
    }
}

/// Initialize the logger from the environment. `LOG_LEVEL` sets the
/// minimum level; `DEBUG_SQL_ENABLED` forces debug.
pub fn init() {
    let mut level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|raw| LogLevel::from_str(&raw))
        .unwrap_or(LogLevel::Info);
    if crate::config::load().debug_sql_enabled {
        level = LogLevel::Debug;
    }
    set_min_level(level);
}

pub fn set_min_level(level: LogLevel) {
    MIN_LEVEL.store(level_to_u8(level), Ordering::Relaxed);
}

fn enabled(level: LogLevel) -> bool {
    level_to_u8(level) >= MIN_LEVEL.load(Ordering::Relaxed)
}

fn write(level: LogLevel, source: &str, message: &str) {
    if !enabled(level) {
        return;
    }
    let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
    eprintln!("{} [{:5}] {}: {}", ts, level.as_str(), source, message);
}

pub fn debug(source: &str, message: &str) {
    write(LogLevel::Debug, source, message);
}

pub fn info(source: &str, message: &str) {
    write(LogLevel::Info, source, message);
}

pub fn warn(source: &str, message: &str) {
    write(LogLevel::Warn, source, message);
}

pub fn error(source: &str, message: &str) {
    write(LogLevel::Error, source, message);
}

/// SQL statement logging, gated separately so busy paths stay quiet
/// unless DEBUG_SQL_ENABLED is on.
pub fn sql(statement: &str) {
    if crate::config::load().debug_sql_enabled {
        write(LogLevel::Debug, "sql", statement);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert_eq!(LogLevel::from_str("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("nope"), None);
    }

    #[test]
    fn min_level_filters() {
        set_min_level(LogLevel::Error);
        assert!(!enabled(LogLevel::Info));
        assert!(enabled(LogLevel::Error));
        set_min_level(LogLevel::Info);
    }
}
