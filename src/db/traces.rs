//! Per-request timing ledger. Updates are best-effort: a missing row
//! is logged at debug level and otherwise ignored.

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::Store;
use crate::clock;
use crate::error::GatewayResult;
use crate::logger;

/// URLs beyond this many chars are truncated before insert.
pub const MAX_TRACE_URL_LENGTH: usize = 4096;

/// The six milestones recorded per request, all epoch ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStamp {
    RequestReceived,
    RequestForwarded,
    FirstUpstreamResponse,
    FirstClientResponse,
    UpstreamCompleted,
    RequestCompleted,
}

impl TraceStamp {
    fn column(&self) -> &'static str {
        match self {
            TraceStamp::RequestReceived => "request_received",
            TraceStamp::RequestForwarded => "request_forwarded",
            TraceStamp::FirstUpstreamResponse => "first_upstream_response",
            TraceStamp::FirstClientResponse => "first_client_response",
            TraceStamp::UpstreamCompleted => "upstream_completed",
            TraceStamp::RequestCompleted => "request_completed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub id: i64,
    pub trace_id: String,
    pub url: String,
    pub method: String,
    pub body_size: i64,
    pub http_status: i64,
    pub request_received: Option<i64>,
    pub request_forwarded: Option<i64>,
    pub first_upstream_response: Option<i64>,
    pub first_client_response: Option<i64>,
    pub upstream_completed: Option<i64>,
    pub request_completed: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Trace {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Trace {
            id: row.get("id")?,
            trace_id: row.get("trace_id")?,
            url: row.get("url")?,
            method: row.get("method")?,
            body_size: row.get("body_size")?,
            http_status: row.get("http_status")?,
            request_received: row.get("request_received")?,
            request_forwarded: row.get("request_forwarded")?,
            first_upstream_response: row.get("first_upstream_response")?,
            first_client_response: row.get("first_client_response")?,
            upstream_completed: row.get("upstream_completed")?,
            request_completed: row.get("request_completed")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Truncate to the char limit. Indexing by chars keeps the cut on a
/// UTF-8 boundary.
fn clamp_url(url: &str, trace_id: &str) -> String {
    if url.chars().count() <= MAX_TRACE_URL_LENGTH {
        return url.to_string();
    }
    logger::warn(
        "trace",
        &format!(
            "truncating url for trace {}: {} chars over the {} limit",
            trace_id,
            url.chars().count(),
            MAX_TRACE_URL_LENGTH
        ),
    );
    url.chars().take(MAX_TRACE_URL_LENGTH).collect()
}

impl Store {
    pub fn insert_trace(
        &self,
        trace_id: &str,
        url: &str,
        method: &str,
        body_size: i64,
    ) -> GatewayResult<()> {
        let now = clock::now_ms();
        let url = clamp_url(url, trace_id);
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "INSERT INTO traces (trace_id, url, method, body_size, request_received, \
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![trace_id, url, method, body_size, now, now],
            )
        })?;
        Ok(())
    }

    /// Record one milestone. Not-found is deliberately quiet.
    pub fn stamp_trace(&self, trace_id: &str, stamp: TraceStamp) -> GatewayResult<()> {
        let now = clock::now_ms();
        let sql = format!(
            "UPDATE traces SET {} = ?1, updated_at = ?2 WHERE trace_id = ?3",
            stamp.column()
        );
        let affected =
            self.with_busy_retry(None, |conn| conn.execute(&sql, params![now, now, trace_id]))?;
        if affected == 0 {
            logger::debug(
                "trace",
                &format!("stamp {:?} on unknown trace {}", stamp, trace_id),
            );
        }
        Ok(())
    }

    pub fn set_trace_status(&self, trace_id: &str, http_status: i64) -> GatewayResult<()> {
        let now = clock::now_ms();
        let affected = self.with_busy_retry(None, |conn| {
            conn.execute(
                "UPDATE traces SET http_status = ?1, updated_at = ?2 WHERE trace_id = ?3",
                params![http_status, now, trace_id],
            )
        })?;
        if affected == 0 {
            logger::debug(
                "trace",
                &format!("status update on unknown trace {}", trace_id),
            );
        }
        Ok(())
    }

    pub fn get_trace(&self, trace_id: &str) -> GatewayResult<Option<Trace>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, trace_id, url, method, body_size, http_status, request_received, \
             request_forwarded, first_upstream_response, first_client_response, \
             upstream_completed, request_completed, created_at, updated_at \
             FROM traces WHERE trace_id = ?1",
        )?;
        Ok(stmt
            .query_row(params![trace_id], Trace::from_row)
            .optional()?)
    }

    /// Delete traces older than the retention window.
    pub fn sweep_expired_traces(&self, retention_days: i64, now_ms: i64) -> GatewayResult<usize> {
        let cutoff = now_ms - retention_days * 86_400 * 1000;
        self.with_busy_retry(None, |conn| {
            conn.execute("DELETE FROM traces WHERE created_at < ?1", params![cutoff])
        })
        .map_err(Into::into)
    }
}
