//! The dispatcher: binds an inbound request to (token -> user ->
//! group -> channel -> adapter) and drives the end-to-end flow with
//! reservation, retries, and billing.

use std::collections::HashSet;

use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use rand::Rng;
use serde_json::Value;

use crate::ability::{self, Selection};
use crate::clock;
use crate::config;
use crate::db::channels::Channel;
use crate::db::logs::{LogEntry, LogType};
use crate::db::traces::TraceStamp;
use crate::db::Store;
use crate::error::{GatewayError, GatewayResult};
use crate::logger;
use crate::quota;
use crate::quota::transaction::{self, HoldRequest};
use crate::relay::adapters::{get_adapter, Adapter, RelayMode};
use crate::relay::client;
use crate::relay::context::{Pricing, RelayContext};
use crate::relay::middleware;
use crate::relay::request::{GeneralRequest, Usage};
use crate::relay::sse;

const RETRY_BACKOFF_INITIAL_MS: u64 = 300;
const RETRY_BACKOFF_MAX_MS: u64 = 3000;

fn mode_path(mode: RelayMode) -> &'static str {
    match mode {
        RelayMode::ChatCompletions => "/v1/chat/completions",
        RelayMode::Completions => "/v1/completions",
        RelayMode::Embeddings => "/v1/embeddings",
        RelayMode::Images => "/v1/images/generations",
    }
}

/// Everything the settle step needs once usage is known, cloneable
/// into the streaming finalizer.
#[derive(Clone)]
struct SettleArgs {
    store: Store,
    user_id: i64,
    username: String,
    token_id: i64,
    token_name: String,
    token_unlimited: bool,
    channel_id: i64,
    model: String,
    request_id: String,
    trace_id: String,
    transaction_id: String,
    pricing: Pricing,
    is_stream: bool,
    started: std::time::Instant,
}

/// Reconcile the hold, write the accounting counters and the
/// consumption log. Billing failures never undo the response the
/// caller already got; they are logged for reconciliation.
fn settle(args: &SettleArgs, usage: &Usage) {
    let final_quota = args.pricing.final_quota(usage);
    let elapsed_ms = args.started.elapsed().as_millis() as i64;

    if let Err(e) = transaction::post_consume(
        &args.store,
        args.token_id,
        &args.transaction_id,
        args.token_unlimited,
        final_quota,
        elapsed_ms,
    ) {
        logger::error(
            "dispatch",
            &format!(
                "post-consume failed for ({}, {}): {}",
                args.token_id, args.transaction_id, e
            ),
        );
    }
    if let Err(e) = quota::record_usage(
        &args.store,
        args.user_id,
        args.token_id,
        args.channel_id,
        final_quota,
    ) {
        logger::error("dispatch", &format!("usage accounting failed: {}", e));
    }

    let entry = LogEntry {
        user_id: args.user_id,
        log_type: LogType::Consume.as_i64(),
        content: format!(
            "ratio {:.4}, completion ratio {:.4}",
            args.pricing.ratio, args.pricing.completion_ratio
        ),
        username: args.username.clone(),
        token_name: args.token_name.clone(),
        model_name: args.model.clone(),
        quota: final_quota,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        channel_id: args.channel_id,
        request_id: args.request_id.clone(),
        trace_id: args.trace_id.clone(),
        elapsed_time: elapsed_ms,
        is_stream: args.is_stream,
        cached_prompt_tokens: usage.cached_prompt_tokens,
        cached_completion_tokens: usage.cached_completion_tokens,
        cache_write_5m_tokens: usage.cache_write_5m_tokens,
        cache_write_1h_tokens: usage.cache_write_1h_tokens,
        ..Default::default()
    };
    if let Err(e) = args.store.insert_log(&entry) {
        logger::error("dispatch", &format!("consume log write failed: {}", e));
    }
    if let Err(e) = args.store.update_user_request_cost_quota_by_request_id(
        args.user_id,
        &args.request_id,
        final_quota,
    ) {
        logger::error("dispatch", &format!("request cost write failed: {}", e));
    }
    let _ = args
        .store
        .stamp_trace(&args.trace_id, TraceStamp::RequestCompleted);

    // Sampled housekeeping on the happy path. The try-lock keeps
    // concurrent settles from stacking sweeps.
    if rand::thread_rng().gen_range(0..1024) == 0 {
        static SWEEP_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        if let Ok(_guard) = SWEEP_LOCK.try_lock() {
            if let Err(e) = args.store.sweep_expired_request_costs(clock::now_ms()) {
                logger::debug("dispatch", &format!("request cost sweep failed: {}", e));
            }
        }
    }
}

fn cancel_hold(store: &Store, args: &SettleArgs) {
    if let Err(e) = transaction::cancel(
        store,
        args.token_id,
        &args.transaction_id,
        args.token_unlimited,
    ) {
        logger::error(
            "dispatch",
            &format!(
                "cancel failed for ({}, {}): {}",
                args.token_id, args.transaction_id, e
            ),
        );
    }
}

/// Entry point shared by the unified endpoints.
pub async fn relay_request(headers: HeaderMap, body: Value, mode: RelayMode) -> Response {
    let store = crate::db::global().clone();
    match relay_inner(&store, headers, body, mode).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn relay_inner(
    store: &Store,
    headers: HeaderMap,
    body: Value,
    mode: RelayMode,
) -> GatewayResult<Response> {
    let key = middleware::extract_bearer_key(&headers)
        .ok_or_else(|| GatewayError::Unauthorized("missing bearer key".to_string()))?;
    let token = middleware::resolve_token(store, &key)?;
    let user = middleware::resolve_user(store, token.user_id)?;
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .map(str::to_string);
    middleware::check_subnet(&token, client_ip.as_deref())?;

    let request: GeneralRequest = serde_json::from_value(body.clone())
        .map_err(|e| GatewayError::InvalidInput(format!("malformed request: {}", e)))?;
    if request.model.trim().is_empty() {
        return Err(GatewayError::InvalidInput("missing model".to_string()));
    }
    middleware::check_model_allowed(&token, &request.model)?;
    if let Err(e) = store.touch_token(token.id) {
        logger::debug("dispatch", &format!("token touch failed: {}", e));
    }

    let ctx = RelayContext::new(
        token.clone(),
        user.id,
        user.username.clone(),
        user.group.clone(),
        request.model.clone(),
    );
    let body_size = body.to_string().len() as i64;
    store.insert_trace(&ctx.trace_id, mode_path(mode), "POST", body_size)?;

    dispatch(store, &ctx, &request, mode).await
}

async fn dispatch(
    store: &Store,
    ctx: &RelayContext,
    request: &GeneralRequest,
    mode: RelayMode,
) -> GatewayResult<Response> {
    let settings = config::load();
    let estimated_prompt = request.estimate_prompt_tokens();
    let completion_budget = request.completion_budget(settings.default_max_token);

    let mut excluded: HashSet<i64> = HashSet::new();
    let mut prefer_larger = false;
    let mut current_max = 0i64;
    let mut tried_larger = false;
    let mut hold: Option<SettleArgs> = None;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let selection = Selection {
            group: &ctx.group,
            model: &ctx.requested_model,
            excluded: &excluded,
            prefer_larger_max_tokens: prefer_larger,
            current_max_tokens: current_max,
        };
        let entry = match ability::select(&selection) {
            Ok(entry) => entry,
            Err(e) => {
                if let Some(args) = &hold {
                    cancel_hold(store, args);
                }
                return Err(e);
            }
        };
        let channel = store.get_channel(entry.channel_id)?.ok_or_else(|| {
            GatewayError::Internal(format!("channel {} vanished from store", entry.channel_id))
        })?;
        let adapter = get_adapter(channel.channel_type);
        let pricing = Pricing::from_model_config(channel.model_config(&ctx.requested_model));

        let args = SettleArgs {
            store: store.clone(),
            user_id: ctx.user_id,
            username: ctx.username.clone(),
            token_id: ctx.token.id,
            token_name: ctx.token.name.clone(),
            token_unlimited: ctx.token.unlimited_quota,
            channel_id: channel.id,
            model: ctx.requested_model.clone(),
            request_id: ctx.request_id.clone(),
            trace_id: ctx.trace_id.clone(),
            transaction_id: ctx.transaction_id.clone(),
            pricing,
            is_stream: request.stream,
            started: ctx.started,
        };

        if hold.is_none() {
            let pre_quota = pricing.pre_quota(estimated_prompt, completion_budget);
            transaction::pre_consume(
                store,
                &HoldRequest {
                    transaction_id: ctx.transaction_id.clone(),
                    token_id: ctx.token.id,
                    user_id: ctx.user_id,
                    token_unlimited: ctx.token.unlimited_quota,
                    pre_quota,
                    reason: format!("relay {}", ctx.requested_model),
                    request_id: ctx.request_id.clone(),
                    trace_id: ctx.trace_id.clone(),
                },
            )?;
        }
        hold = Some(args.clone());

        match attempt_channel(store, ctx, request, mode, &channel, adapter, &args).await {
            Ok(response) => return Ok(response),
            Err(AttemptError::Upstream { status, error }) => {
                logger::warn(
                    "dispatch",
                    &format!(
                        "channel {} failed for {} (attempt {}): {}",
                        channel.id, ctx.requested_model, attempts, error
                    ),
                );
                if status == Some(413) {
                    // One shot at a channel with more headroom; a
                    // second 413 ends the request.
                    if tried_larger {
                        if let Some(args) = &hold {
                            cancel_hold(store, args);
                        }
                        let _ = store.set_trace_status(&ctx.trace_id, 413);
                        return Err(GatewayError::UpstreamPermanent(
                            "request too large for every candidate channel".to_string(),
                        ));
                    }
                    tried_larger = true;
                    prefer_larger = true;
                    current_max = entry.max_tokens;
                    excluded.insert(channel.id);
                    continue;
                }
                let retriable = error.is_retriable() && attempts < settings.max_channel_retries;
                if retriable {
                    if let Err(e) = ability::suspend_ability(
                        store,
                        channel.id,
                        &ctx.group,
                        &ctx.requested_model,
                        settings.channel_suspend_secs * 1000,
                    ) {
                        logger::debug("dispatch", &format!("suspension failed: {}", e));
                    }
                    excluded.insert(channel.id);
                    tokio::time::sleep(client::retry_delay(
                        attempts,
                        RETRY_BACKOFF_INITIAL_MS,
                        RETRY_BACKOFF_MAX_MS,
                    ))
                    .await;
                    continue;
                }
                if let Some(args) = &hold {
                    cancel_hold(store, args);
                }
                if let Some(status) = status {
                    let _ = store.set_trace_status(&ctx.trace_id, status as i64);
                }
                return Err(error);
            }
            Err(AttemptError::Fatal(error)) => {
                if let Some(args) = &hold {
                    cancel_hold(store, args);
                }
                return Err(error);
            }
        }
    }
}

/// Failure of a single channel attempt: upstream errors may trigger
/// re-selection; fatal errors end the request at once.
enum AttemptError {
    Upstream {
        status: Option<u16>,
        error: GatewayError,
    },
    Fatal(GatewayError),
}

async fn attempt_channel(
    store: &Store,
    ctx: &RelayContext,
    request: &GeneralRequest,
    mode: RelayMode,
    channel: &Channel,
    adapter: &'static dyn Adapter,
    args: &SettleArgs,
) -> Result<Response, AttemptError> {
    let streaming =
        request.stream && adapter.supports_streaming() && mode == RelayMode::ChatCompletions;

    let wire = adapter
        .convert_request(request, channel, mode)
        .map_err(AttemptError::Fatal)?;
    let url = adapter.build_url(channel, &wire.provider_model, mode, streaming);
    let upstream_headers = adapter.build_headers(channel);

    let http_client = if streaming {
        client::streaming_client()
    } else {
        client::default_client()
    }
    .map_err(AttemptError::Fatal)?;

    let _ = store.stamp_trace(&ctx.trace_id, TraceStamp::RequestForwarded);
    let response = client::post_json(&http_client, &url, upstream_headers, &wire.payload)
        .await
        .map_err(|e| AttemptError::Upstream {
            status: None,
            error: e,
        })?;

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let body = response.text().await.unwrap_or_default();
        return Err(AttemptError::Upstream {
            status: Some(status),
            error: client::classify_upstream_status(status, &body),
        });
    }

    if streaming {
        let translator = adapter.stream_translator(request);
        let finalize_args = args.clone();
        let finalizer: sse::StreamFinalizer = Box::new(move |usage, _finish_reason| {
            settle(&finalize_args, &usage);
        });
        let response = sse::stream_response(
            response,
            translator,
            format!("chatcmpl-{}", ctx.request_id),
            ctx.requested_model.clone(),
            store.clone(),
            ctx.trace_id.clone(),
            ctx.cancel.clone(),
            finalizer,
        );
        let _ = store.set_trace_status(&ctx.trace_id, 200);
        return Ok(response);
    }

    let _ = store.stamp_trace(&ctx.trace_id, TraceStamp::FirstUpstreamResponse);
    let text = response.text().await.map_err(|e| AttemptError::Upstream {
        status: Some(status),
        error: GatewayError::UpstreamTransient(format!("failed to read upstream body: {}", e)),
    })?;
    let body: Value = serde_json::from_str(&text).map_err(|e| AttemptError::Upstream {
        status: Some(status),
        error: GatewayError::UpstreamPermanent(format!("unparseable upstream body: {}", e)),
    })?;
    let _ = store.stamp_trace(&ctx.trace_id, TraceStamp::UpstreamCompleted);

    let mut parsed = adapter
        .parse_response(&body, request, mode)
        .map_err(AttemptError::Fatal)?;
    if parsed.usage.prompt_tokens == 0 && parsed.usage.completion_tokens == 0 {
        parsed.usage = Usage::new(request.estimate_prompt_tokens(), 0);
    }

    let _ = store.stamp_trace(&ctx.trace_id, TraceStamp::FirstClientResponse);
    let _ = store.set_trace_status(&ctx.trace_id, 200);
    settle(args, &parsed.usage);

    Ok(Json(parsed.body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_paths_cover_the_surface() {
        assert_eq!(mode_path(RelayMode::ChatCompletions), "/v1/chat/completions");
        assert_eq!(mode_path(RelayMode::Embeddings), "/v1/embeddings");
        assert_eq!(mode_path(RelayMode::Images), "/v1/images/generations");
    }
}
