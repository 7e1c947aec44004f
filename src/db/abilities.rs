//! Denormalized routing rows. One row grants a (group, model) pair the
//! right to use a channel; the in-memory index is rebuilt from these.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Row};
use serde::Serialize;

use super::channels::Channel;
use super::Store;
use crate::error::GatewayResult;

#[derive(Debug, Clone, Serialize)]
pub struct Ability {
    pub group: String,
    pub model: String,
    pub channel_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub weight: u64,
    /// Epoch ms; rows with `suspend_until > now` are skipped by selection.
    pub suspend_until: Option<i64>,
}

impl Ability {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Ability {
            group: row.get("group_name")?,
            model: row.get("model")?,
            channel_id: row.get("channel_id")?,
            enabled: row.get::<_, i64>("enabled")? != 0,
            priority: row.get("priority")?,
            weight: row.get::<_, i64>("weight")?.max(0) as u64,
            suspend_until: row.get("suspend_until")?,
        })
    }
}

static EPOCH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("epoch regex"));

/// Normalize a legacy `suspend_until` value to UTC.
///
/// Accepted forms: epoch seconds / milliseconds / microseconds as a
/// digit string, RFC3339 (any offset), and the bare
/// "YYYY-MM-DD[ HH:MM[:SS]]" wall-time forms (read as UTC). Anything
/// else, including blank strings, is None.
pub fn normalize_suspend_until(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if EPOCH_RE.is_match(trimmed) {
        let value: i64 = trimmed.parse().ok()?;
        let millis = if value < 100_000_000_000 {
            value.checked_mul(1000)?
        } else if value < 100_000_000_000_000 {
            value
        } else {
            value / 1000
        };
        return Utc.timestamp_millis_opt(millis).single();
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }

    None
}

impl Store {
    /// Replace a channel's ability rows with one row per
    /// (group, model) pair it serves. The triple PK keeps duplicates
    /// out by construction.
    pub fn rebuild_channel_abilities(&self, channel: &Channel) -> GatewayResult<()> {
        let groups = channel.group_list();
        let models = channel.model_list();
        let enabled = matches!(
            channel.status,
            super::channels::ChannelStatus::Enabled
        );
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "DELETE FROM abilities WHERE channel_id = ?1",
                params![channel.id],
            )?;
            let mut stmt = conn.prepare_cached(
                "INSERT OR REPLACE INTO abilities \
                 (group_name, model, channel_id, enabled, priority, weight, suspend_until) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
            )?;
            for group in &groups {
                for model in &models {
                    stmt.execute(params![
                        group,
                        model,
                        channel.id,
                        enabled as i64,
                        channel.priority,
                        channel.weight as i64
                    ])?;
                }
            }
            Ok(())
        })
    }

    pub fn delete_channel_abilities(&self, channel_id: i64) -> GatewayResult<()> {
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "DELETE FROM abilities WHERE channel_id = ?1",
                params![channel_id],
            )
        })?;
        Ok(())
    }

    pub fn list_abilities(&self) -> GatewayResult<Vec<Ability>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT group_name, model, channel_id, enabled, priority, weight, suspend_until \
             FROM abilities ORDER BY group_name, model, channel_id",
        )?;
        let rows = stmt.query_map([], Ability::from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Write a suspension window on one routing row.
    pub fn suspend_ability(
        &self,
        group: &str,
        model: &str,
        channel_id: i64,
        until_ms: i64,
    ) -> GatewayResult<()> {
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "UPDATE abilities SET suspend_until = ?1 \
                 WHERE group_name = ?2 AND model = ?3 AND channel_id = ?4",
                params![until_ms, group, model, channel_id],
            )
        })?;
        Ok(())
    }

    /// One-shot migration: rewrite legacy string-typed suspend values
    /// into epoch ms, NULLing the unparseable. Idempotent; integer
    /// values are already native and untouched.
    pub fn normalize_legacy_suspensions(&self) -> GatewayResult<usize> {
        self.with_busy_retry(None, |conn| {
            let mut stmt = conn.prepare(
                "SELECT rowid, suspend_until FROM abilities \
                 WHERE suspend_until IS NOT NULL AND typeof(suspend_until) = 'text'",
            )?;
            let rows: Vec<(i64, String)> = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            let mut rewritten = 0usize;
            for (rowid, raw) in rows {
                let native = normalize_suspend_until(&raw).map(|dt| dt.timestamp_millis());
                conn.execute(
                    "UPDATE abilities SET suspend_until = ?1 WHERE rowid = ?2",
                    params![native, rowid],
                )?;
                rewritten += 1;
            }
            Ok(rewritten)
        })
    }
}
