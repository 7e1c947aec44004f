//! Router assembly, status/stats endpoints, background workers, and
//! the serve loop.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{Path, Query},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::ability;
use crate::clock;
use crate::config::{self, QUOTA_PER_USD};
use crate::db::channels::ChannelStatus;
use crate::db::logs::{LogQuery, LogType};
use crate::db::tokens;
use crate::db::users::UserRole;
use crate::db::Store;
use crate::error::GatewayError;
use crate::logger;
use crate::quota;
use crate::relay;
use crate::relay::adapters::{get_adapter, RelayMode};
use crate::relay::request::GeneralRequest;

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Public status envelope.
///
/// Route: GET /api/status
async fn status() -> Json<Value> {
    let settings = config::load();
    Json(json!({
        "success": true,
        "data": {
            "system_name": "relay-gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "logo": "",
            "chat_link": "",
            "quota_per_unit": QUOTA_PER_USD,
            "display_in_currency": true,
            "footer_html": "",
            "server_address": settings.server_address,
        }
    }))
}

#[derive(Deserialize)]
struct WindowQ {
    /// Half-open [start, end) window over created_at seconds.
    start: Option<i64>,
    end: Option<i64>,
    user_id: Option<i64>,
}

/// Requests/tokens/quota summary over a window.
///
/// Route: GET /api/stats/summary
async fn stats_summary(Query(q): Query<WindowQ>) -> impl IntoResponse {
    let store = crate::db::global();
    let start = q.start.unwrap_or(0);
    let end = q.end.unwrap_or_else(|| clock::now_s() + 1);
    let quota = match store.sum_used_quota(None, q.user_id, start, end) {
        Ok(quota) => quota,
        Err(e) => return e.into_response(),
    };
    Json(json!({
        "quota": quota,
        "cost_usd": quota as f64 / QUOTA_PER_USD as f64,
        "start": start,
        "end": end,
    }))
    .into_response()
}

/// Per-day, per-model rollups.
///
/// Route: GET /api/stats/models
async fn stats_models(Query(q): Query<WindowQ>) -> impl IntoResponse {
    let store = crate::db::global();
    let start = q.start.unwrap_or(0);
    let end = q.end.unwrap_or_else(|| clock::now_s() + 1);
    match store.daily_model_stats(q.user_id, start, end) {
        Ok(stats) => Json(json!({ "data": stats })).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct LogsQ {
    #[serde(rename = "type")]
    log_type: Option<i64>,
    user_id: Option<i64>,
    token_name: Option<String>,
    model_name: Option<String>,
    start: Option<i64>,
    end: Option<i64>,
    limit: Option<i64>,
    offset: Option<i64>,
}

/// Paginated consumption-log listing. Sort-heavy, so the query runs
/// under a 10-second bound.
///
/// Route: GET /api/logs
async fn list_logs(Query(q): Query<LogsQ>) -> impl IntoResponse {
    let store = crate::db::global().clone();
    let query = LogQuery {
        log_type: q.log_type.map(LogType::from_i64),
        user_id: q.user_id,
        token_name: q.token_name,
        model_name: q.model_name,
        start: q.start,
        end_exclusive: q.end,
        limit: q.limit.unwrap_or(50),
        offset: q.offset.unwrap_or(0),
    };
    let bounded = tokio::time::timeout(
        Duration::from_secs(10),
        tokio::task::spawn_blocking(move || store.list_logs(&query)),
    )
    .await;
    match bounded {
        Ok(Ok(Ok(logs))) => Json(json!({ "data": logs })).into_response(),
        Ok(Ok(Err(e))) => e.into_response(),
        Ok(Err(e)) => GatewayError::Internal(format!("log query task failed: {}", e)).into_response(),
        Err(_) => GatewayError::Internal("log query timed out".to_string()).into_response(),
    }
}

/// Probe a channel with a one-token chat request through its adapter.
///
/// Route: POST /api/channels/:id/test
async fn test_channel(Path(id): Path<i64>) -> impl IntoResponse {
    let store = crate::db::global();
    let channel = match store.get_channel(id) {
        Ok(Some(channel)) => channel,
        Ok(None) => return GatewayError::NotFound(format!("channel {}", id)).into_response(),
        Err(e) => return e.into_response(),
    };
    let model = channel
        .test_model
        .clone()
        .filter(|m| !m.is_empty())
        .or_else(|| channel.model_list().into_iter().next());
    let Some(model) = model else {
        return GatewayError::InvalidInput(format!("channel {} lists no models", id)).into_response();
    };

    let request: GeneralRequest = match serde_json::from_value(json!({
        "model": model,
        "messages": [{ "role": "user", "content": "hi" }],
        "max_tokens": 1
    })) {
        Ok(request) => request,
        Err(e) => return GatewayError::Internal(e.to_string()).into_response(),
    };

    let adapter = get_adapter(channel.channel_type);
    let started = std::time::Instant::now();
    let outcome = async {
        let wire = adapter.convert_request(&request, &channel, RelayMode::ChatCompletions)?;
        let url = adapter.build_url(&channel, &wire.provider_model, RelayMode::ChatCompletions, false);
        let headers = adapter.build_headers(&channel);
        let client = relay::client::default_client()?;
        let response = relay::client::post_json(&client, &url, headers, &wire.payload).await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(relay::client::classify_upstream_status(status, &body));
        }
        Ok(())
    }
    .await;
    let latency_ms = started.elapsed().as_millis() as i64;

    match outcome {
        Ok(()) => Json(json!({ "success": true, "latency_ms": latency_ms })).into_response(),
        Err(e) => {
            logger::warn("server", &format!("channel {} test failed: {}", id, e));
            if let Err(e) = store.update_channel_status(id, ChannelStatus::AutoDisabled) {
                logger::error("server", &format!("auto-disable failed: {}", e));
            } else if let Ok(Some(channel)) = store.get_channel(id) {
                let _ = store.rebuild_channel_abilities(&channel);
                let _ = ability::init_channel_cache(store);
            }
            (
                axum::http::StatusCode::OK,
                Json(json!({ "success": false, "latency_ms": latency_ms, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub fn app() -> Router {
    let cors = CorsLayer::permissive();
    Router::new()
        // Health check
        .route("/health", get(health))
        // ============================================
        // Unified API Endpoints
        // ============================================
        .route("/v1/chat/completions", post(relay::chat_completions))
        .route("/v1/completions", post(relay::completions))
        .route("/v1/embeddings", post(relay::embeddings))
        .route("/v1/images/*action", post(relay::images))
        .route("/v1/models", get(relay::list_models))
        .route("/v1/models/:model_id", get(relay::get_model))
        // ============================================
        // Status & Stats API
        // ============================================
        .route("/api/status", get(status))
        .route("/api/stats/summary", get(stats_summary))
        .route("/api/stats/models", get(stats_models))
        .route("/api/logs", get(list_logs))
        // ============================================
        // Channel Admin API
        // ============================================
        .route("/api/channels/:id/test", post(test_channel))
        .layer(cors)
}

/// Seed the root user (and its bootstrap token) on an empty store.
pub fn bootstrap(store: &Store) -> crate::error::GatewayResult<()> {
    if store.user_count()? > 0 {
        return Ok(());
    }
    let settings = config::load();
    let root_id = store.insert_user(
        "root",
        "Root User",
        "",
        UserRole::Root,
        "default",
        settings.quota_for_new_user.max(0),
    )?;
    logger::info("server", "root user created");
    if let Some(seed) = settings.initial_root_token {
        let body = tokens::lookup_key(&seed);
        store.insert_token(root_id, &body, "bootstrap", -1, -1, true, None)?;
        logger::info("server", "bootstrap root token seeded");
    }
    Ok(())
}

fn start_trace_sweeper(store: Store) {
    let retention_days = config::load().trace_retention_days;
    if retention_days <= 0 {
        logger::info("server", "trace retention sweep disabled");
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(86_400));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            // Fires immediately once, then every 24h.
            ticker.tick().await;
            match store.sweep_expired_traces(retention_days, clock::now_ms()) {
                Ok(removed) if removed > 0 => {
                    logger::info("server", &format!("trace sweep removed {} rows", removed));
                }
                Ok(_) => {}
                Err(e) => logger::error("server", &format!("trace sweep failed: {}", e)),
            }
        }
    });
}

/// Start every long-lived worker this node is responsible for.
pub fn start_workers(store: &Store) {
    let settings = config::load();
    if !settings.is_master_node {
        logger::info("server", "not a master node; background workers skipped");
        return;
    }
    quota::transaction::start_sweeper(store.clone());
    start_trace_sweeper(store.clone());
    if settings.batch_update_enabled {
        quota::batch::start_worker(store.clone());
    }
}

pub async fn serve() {
    let settings = config::load();
    crate::db::init_global(&settings.db_path).expect("store init failed");
    let store = crate::db::global().clone();

    if settings.is_master_node {
        // A migration body runs at most once per process.
        static SUSPENSION_MIGRATION: std::sync::Once = std::sync::Once::new();
        SUSPENSION_MIGRATION.call_once(|| match store.normalize_legacy_suspensions() {
            Ok(0) => {}
            Ok(n) => logger::info("server", &format!("normalized {} legacy suspensions", n)),
            Err(e) => logger::error("server", &format!("suspension migration failed: {}", e)),
        });
        if let Err(e) = bootstrap(&store) {
            logger::error("server", &format!("bootstrap failed: {}", e));
        }
    }
    ability::init_channel_cache(&store).expect("ability cache init failed");
    start_workers(&store);

    let addr: SocketAddr = settings
        .listen_address
        .parse()
        .expect("invalid LISTEN_ADDRESS");
    logger::info("server", &format!("listening on {}", addr));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("bind failed");
    axum::serve(listener, app()).await.expect("serve failed");
}
