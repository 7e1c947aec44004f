//! Append-only consumption/system log and its aggregation queries.
//! The quota ledger is the source of truth; this is the audit trail.

use rusqlite::{params, Row};
use serde::Serialize;

use super::Store;
use crate::clock;
use crate::error::GatewayResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Unknown,
    Topup,
    Consume,
    Manage,
    System,
    Test,
}

impl LogType {
    pub fn as_i64(&self) -> i64 {
        match self {
            LogType::Unknown => 0,
            LogType::Topup => 1,
            LogType::Consume => 2,
            LogType::Manage => 3,
            LogType::System => 4,
            LogType::Test => 5,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => LogType::Topup,
            2 => LogType::Consume,
            3 => LogType::Manage,
            4 => LogType::System,
            5 => LogType::Test,
            _ => LogType::Unknown,
        }
    }
}

/// One consumption entry. Field names follow the JSON the dashboard
/// consumes.
#[derive(Debug, Clone, Serialize, Default)]
pub struct LogEntry {
    pub id: i64,
    pub user_id: i64,
    pub created_at: i64,
    #[serde(rename = "type")]
    pub log_type: i64,
    pub content: String,
    pub username: String,
    pub token_name: String,
    pub model_name: String,
    pub quota: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub channel_id: i64,
    pub request_id: String,
    pub trace_id: String,
    pub updated_at: i64,
    pub elapsed_time: i64,
    pub is_stream: bool,
    pub system_prompt_reset: bool,
    pub cached_prompt_tokens: i64,
    pub cached_completion_tokens: i64,
    pub cache_write_5m_tokens: i64,
    pub cache_write_1h_tokens: i64,
}

impl LogEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(LogEntry {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            created_at: row.get("created_at")?,
            log_type: row.get("type")?,
            content: row.get("content")?,
            username: row.get("username")?,
            token_name: row.get("token_name")?,
            model_name: row.get("model_name")?,
            quota: row.get("quota")?,
            prompt_tokens: row.get("prompt_tokens")?,
            completion_tokens: row.get("completion_tokens")?,
            channel_id: row.get("channel_id")?,
            request_id: row.get("request_id")?,
            trace_id: row.get("trace_id")?,
            updated_at: row.get("updated_at")?,
            elapsed_time: row.get("elapsed_time")?,
            is_stream: row.get::<_, i64>("is_stream")? != 0,
            system_prompt_reset: row.get::<_, i64>("system_prompt_reset")? != 0,
            cached_prompt_tokens: row.get("cached_prompt_tokens")?,
            cached_completion_tokens: row.get("cached_completion_tokens")?,
            cache_write_5m_tokens: row.get("cache_write_5m_tokens")?,
            cache_write_1h_tokens: row.get("cache_write_1h_tokens")?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub log_type: Option<LogType>,
    pub user_id: Option<i64>,
    pub token_name: Option<String>,
    pub model_name: Option<String>,
    /// Half-open [start, end_exclusive) window over created_at (s).
    pub start: Option<i64>,
    pub end_exclusive: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyModelStat {
    pub day: String,
    pub model_name: String,
    pub requests: i64,
    pub quota: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

const LOG_COLUMNS: &str = "id, user_id, created_at, type, content, username, token_name, \
     model_name, quota, prompt_tokens, completion_tokens, channel_id, request_id, trace_id, \
     updated_at, elapsed_time, is_stream, system_prompt_reset, cached_prompt_tokens, \
     cached_completion_tokens, cache_write_5m_tokens, cache_write_1h_tokens";

impl Store {
    pub fn insert_log(&self, entry: &LogEntry) -> GatewayResult<i64> {
        let now = clock::now_s();
        let created = if entry.created_at > 0 {
            entry.created_at
        } else {
            now
        };
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "INSERT INTO logs (user_id, created_at, type, content, username, token_name, \
                 model_name, quota, prompt_tokens, completion_tokens, channel_id, request_id, \
                 trace_id, updated_at, elapsed_time, is_stream, system_prompt_reset, \
                 cached_prompt_tokens, cached_completion_tokens, cache_write_5m_tokens, \
                 cache_write_1h_tokens) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                 ?16, ?17, ?18, ?19, ?20, ?21)",
                params![
                    entry.user_id,
                    created,
                    entry.log_type,
                    entry.content,
                    entry.username,
                    entry.token_name,
                    entry.model_name,
                    entry.quota,
                    entry.prompt_tokens,
                    entry.completion_tokens,
                    entry.channel_id,
                    entry.request_id,
                    entry.trace_id,
                    now,
                    entry.elapsed_time,
                    entry.is_stream as i64,
                    entry.system_prompt_reset as i64,
                    entry.cached_prompt_tokens,
                    entry.cached_completion_tokens,
                    entry.cache_write_5m_tokens,
                    entry.cache_write_1h_tokens
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn list_logs(&self, query: &LogQuery) -> GatewayResult<Vec<LogEntry>> {
        let mut sql = format!("SELECT {} FROM logs WHERE 1=1", LOG_COLUMNS);
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(log_type) = query.log_type {
            args.push(log_type.as_i64().into());
            sql.push_str(&format!(" AND type = ?{}", args.len()));
        }
        if let Some(user_id) = query.user_id {
            args.push(user_id.into());
            sql.push_str(&format!(" AND user_id = ?{}", args.len()));
        }
        if let Some(token_name) = &query.token_name {
            args.push(token_name.clone().into());
            sql.push_str(&format!(" AND token_name = ?{}", args.len()));
        }
        if let Some(model_name) = &query.model_name {
            args.push(model_name.clone().into());
            sql.push_str(&format!(" AND model_name = ?{}", args.len()));
        }
        if let Some(start) = query.start {
            args.push(start.into());
            sql.push_str(&format!(" AND created_at >= ?{}", args.len()));
        }
        if let Some(end) = query.end_exclusive {
            args.push(end.into());
            sql.push_str(&format!(" AND created_at < ?{}", args.len()));
        }
        let limit = if query.limit > 0 { query.limit } else { 50 };
        args.push(limit.into());
        sql.push_str(&format!(" ORDER BY id DESC LIMIT ?{}", args.len()));
        args.push(query.offset.max(0).into());
        sql.push_str(&format!(" OFFSET ?{}", args.len()));
        crate::logger::sql(&sql);

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), LogEntry::from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Per-day, per-model rollup over a half-open window.
    pub fn daily_model_stats(
        &self,
        user_id: Option<i64>,
        start: i64,
        end_exclusive: i64,
    ) -> GatewayResult<Vec<DailyModelStat>> {
        let bucket = self.dialect().day_bucket_expr("created_at");
        let mut sql = format!(
            "SELECT {} AS day, model_name, count(*), ifnull(sum(quota),0), \
             ifnull(sum(prompt_tokens),0), ifnull(sum(completion_tokens),0) FROM logs \
             WHERE type = ?1 AND created_at >= ?2 AND created_at < ?3",
            bucket
        );
        let mut args: Vec<rusqlite::types::Value> = vec![
            LogType::Consume.as_i64().into(),
            start.into(),
            end_exclusive.into(),
        ];
        if let Some(user_id) = user_id {
            args.push(user_id.into());
            sql.push_str(&format!(" AND user_id = ?{}", args.len()));
        }
        sql.push_str(" GROUP BY day, model_name ORDER BY day, model_name");
        crate::logger::sql(&sql);

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), |r| {
            Ok(DailyModelStat {
                day: r.get(0)?,
                model_name: r.get(1)?,
                requests: r.get(2)?,
                quota: r.get(3)?,
                prompt_tokens: r.get(4)?,
                completion_tokens: r.get(5)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Total consumed quota in a window. Reads `type = consume`
    /// regardless of any caller-side type filter; the dashboard has
    /// always depended on this.
    pub fn sum_used_quota(
        &self,
        _log_type: Option<LogType>,
        user_id: Option<i64>,
        start: i64,
        end_exclusive: i64,
    ) -> GatewayResult<i64> {
        let mut sql = "SELECT ifnull(sum(quota),0) FROM logs \
             WHERE type = ?1 AND created_at >= ?2 AND created_at < ?3"
            .to_string();
        let mut args: Vec<rusqlite::types::Value> = vec![
            LogType::Consume.as_i64().into(),
            start.into(),
            end_exclusive.into(),
        ];
        if let Some(user_id) = user_id {
            args.push(user_id.into());
            sql.push_str(&format!(" AND user_id = ?{}", args.len()));
        }
        let conn = self.conn()?;
        let sum = conn.query_row(&sql, rusqlite::params_from_iter(args), |r| r.get(0))?;
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;

    fn consume_entry(user_id: i64, model: &str, quota: i64, created_at: i64) -> LogEntry {
        LogEntry {
            user_id,
            created_at,
            log_type: LogType::Consume.as_i64(),
            model_name: model.to_string(),
            quota,
            prompt_tokens: 40,
            completion_tokens: 30,
            ..Default::default()
        }
    }

    #[test]
    fn insert_and_list_with_filters() {
        let (_dir, store) = test_store();
        store.insert_log(&consume_entry(7, "gpt-4o", 70, 1000)).unwrap();
        store.insert_log(&consume_entry(7, "claude-3", 30, 1001)).unwrap();
        store.insert_log(&consume_entry(8, "gpt-4o", 50, 1002)).unwrap();

        let all = store
            .list_logs(&LogQuery {
                user_id: Some(7),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(all.len(), 2);

        let one = store
            .list_logs(&LogQuery {
                model_name: Some("gpt-4o".into()),
                user_id: Some(7),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].quota, 70);
    }

    #[test]
    fn window_is_half_open() {
        let (_dir, store) = test_store();
        store.insert_log(&consume_entry(1, "m", 10, 100)).unwrap();
        store.insert_log(&consume_entry(1, "m", 20, 200)).unwrap();

        // end_exclusive = 200 leaves out the second row.
        let sum = store.sum_used_quota(None, Some(1), 100, 200).unwrap();
        assert_eq!(sum, 10);
        let sum = store.sum_used_quota(None, Some(1), 100, 201).unwrap();
        assert_eq!(sum, 30);
    }

    #[test]
    fn sum_used_quota_ignores_caller_type_filter() {
        let (_dir, store) = test_store();
        store.insert_log(&consume_entry(1, "m", 10, 100)).unwrap();
        let mut topup = consume_entry(1, "m", 99, 100);
        topup.log_type = LogType::Topup.as_i64();
        store.insert_log(&topup).unwrap();

        // Passing Topup still sums consume rows only.
        let sum = store
            .sum_used_quota(Some(LogType::Topup), Some(1), 0, 1000)
            .unwrap();
        assert_eq!(sum, 10);
    }

    #[test]
    fn daily_rollup_groups_by_day_and_model() {
        let (_dir, store) = test_store();
        // Two entries same day/model, one next day.
        let day1 = 1_700_000_000;
        let day2 = day1 + 86_400;
        store.insert_log(&consume_entry(1, "gpt-4o", 10, day1)).unwrap();
        store.insert_log(&consume_entry(1, "gpt-4o", 15, day1 + 60)).unwrap();
        store.insert_log(&consume_entry(1, "gpt-4o", 20, day2)).unwrap();

        let stats = store
            .daily_model_stats(Some(1), day1, day2 + 86_400)
            .unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].requests, 2);
        assert_eq!(stats[0].quota, 25);
        assert_eq!(stats[1].requests, 1);
        assert_eq!(stats[1].quota, 20);
    }
}
