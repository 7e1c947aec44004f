//! End-to-end relay flows against a mock upstream: buffered chat with
//! billing, 413 fallback to a larger-budget channel, and streaming.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse, routing::post, Router};
use serde_json::{json, Value};

use relay_gateway::db::channels::ChannelType;
use relay_gateway::db::logs::{LogQuery, LogType};
use relay_gateway::db::users::UserRole;
use relay_gateway::{ability, config, db, server};

const TOKEN_KEY: &str = "integrationtestkey000000000000000000000000000000";

struct MockUpstream {
    addr: SocketAddr,
    calls_a: Arc<AtomicUsize>,
    calls_b: Arc<AtomicUsize>,
    calls_stream: Arc<AtomicUsize>,
}

async fn start_mock_upstream() -> MockUpstream {
    let calls_a = Arc::new(AtomicUsize::new(0));
    let calls_b = Arc::new(AtomicUsize::new(0));
    let calls_stream = Arc::new(AtomicUsize::new(0));

    let a_counter = Arc::clone(&calls_a);
    let b_counter = Arc::clone(&calls_b);
    let stream_counter = Arc::clone(&calls_stream);

    let chat_body = || {
        json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "hello there" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 40, "completion_tokens": 30, "total_tokens": 70 }
        })
    };

    let app = Router::new()
        .route(
            "/a/v1/chat/completions",
            post(move || {
                a_counter.fetch_add(1, Ordering::SeqCst);
                async { (StatusCode::PAYLOAD_TOO_LARGE, "request too large").into_response() }
            }),
        )
        .route(
            "/b/v1/chat/completions",
            post(move || {
                b_counter.fetch_add(1, Ordering::SeqCst);
                let body = chat_body();
                async move { axum::Json(body).into_response() }
            }),
        )
        .route(
            "/stream/v1/chat/completions",
            post(move || {
                stream_counter.fetch_add(1, Ordering::SeqCst);
                async {
                    let body = concat!(
                        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"},\"index\":0}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"},\"index\":0}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\",\"index\":0}]}\n\n",
                        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n\n",
                        "data: [DONE]\n\n",
                    );
                    ([("content-type", "text/event-stream")], body).into_response()
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    MockUpstream {
        addr,
        calls_a,
        calls_b,
        calls_stream,
    }
}

fn wait_for_consume_log(
    store: &db::Store,
    user_id: i64,
) -> Option<relay_gateway::db::logs::LogEntry> {
    for _ in 0..100 {
        let logs = store
            .list_logs(&LogQuery {
                log_type: Some(LogType::Consume),
                user_id: Some(user_id),
                ..Default::default()
            })
            .unwrap();
        if !logs.is_empty() {
            return logs.into_iter().next();
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    None
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relay_flows_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("gateway.db");
    db::init_global(db_path.to_str().unwrap()).unwrap();
    let store = db::global().clone();
    config::install(config::Settings::from_env());

    let mock = start_mock_upstream().await;
    let base = |path: &str| format!("http://{}{}", mock.addr, path);

    // Caller: one user, one limited token.
    let user_id = store
        .insert_user("it-user", "IT", "h", UserRole::Common, "default", 10_000)
        .unwrap();
    let token_id = store
        .insert_token(user_id, TOKEN_KEY, "it-token", -1, 1000, false, None)
        .unwrap();

    // Channel A rejects with 413 and has the small budget; channel B
    // carries the larger budget and answers. A outranks B on priority
    // so the first attempt always lands on A.
    let channel_a = store
        .insert_channel(
            ChannelType::OpenAI,
            "upstream-key-a",
            "small",
            1,
            10,
            &base("/a"),
            "gpt-4o",
            "default",
            Some(r#"{"gpt-4o":{"ratio":0,"completion_ratio":0,"max_tokens":8192}}"#),
            None,
        )
        .unwrap();
    let channel_b = store
        .insert_channel(
            ChannelType::OpenAI,
            "upstream-key-b",
            "large",
            1,
            0,
            &base("/b"),
            "gpt-4o",
            "default",
            Some(r#"{"gpt-4o":{"ratio":0,"completion_ratio":0,"max_tokens":128000}}"#),
            None,
        )
        .unwrap();
    for id in [channel_a, channel_b] {
        let channel = store.get_channel(id).unwrap().unwrap();
        store.rebuild_channel_abilities(&channel).unwrap();
    }
    ability::init_channel_cache(&store).unwrap();

    // Gateway itself.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, server::app()).await.unwrap() });
    let client = reqwest::Client::new();
    let auth = format!("Bearer sk-{}", TOKEN_KEY);

    // ---- 413 fallback: A is tried once, B serves, billing lands on B.
    let response = client
        .post(format!("http://{}/v1/chat/completions", gateway))
        .header("authorization", &auth)
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 60
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "hello there");
    assert_eq!(body["usage"]["total_tokens"], 70);

    assert_eq!(mock.calls_a.load(Ordering::SeqCst), 1);
    assert_eq!(mock.calls_b.load(Ordering::SeqCst), 1);

    // Billing: cost 70 at unit ratio, on both balances.
    let log = wait_for_consume_log(&store, user_id).expect("consume log written");
    assert_eq!(log.channel_id, channel_b);
    assert_eq!(log.quota, 70);
    assert_eq!(log.prompt_tokens, 40);
    assert_eq!(log.completion_tokens, 30);
    assert!(!log.is_stream);
    assert_eq!(store.get_user_quota(user_id).unwrap(), 10_000 - 70);
    assert_eq!(store.get_token_quota(token_id).unwrap().0, 1000 - 70);

    // Trace carries every milestone.
    let trace = store.get_trace(&log.trace_id).unwrap().unwrap();
    assert!(trace.request_received.is_some());
    assert!(trace.request_forwarded.is_some());
    assert!(trace.first_upstream_response.is_some());
    assert!(trace.first_client_response.is_some());
    assert!(trace.upstream_completed.is_some());
    assert!(trace.request_completed.is_some());

    // Request cost row is addressable by request id.
    let cost = store.get_cost_by_request_id(&log.request_id).unwrap().unwrap();
    assert_eq!(cost.quota, 70);
    assert_eq!(cost.user_id, user_id);

    // ---- Streaming: swap in a streaming channel and read SSE back.
    store
        .update_channel_status(
            channel_a,
            relay_gateway::db::channels::ChannelStatus::ManuallyDisabled,
        )
        .unwrap();
    store
        .update_channel_status(
            channel_b,
            relay_gateway::db::channels::ChannelStatus::ManuallyDisabled,
        )
        .unwrap();
    let channel_stream = store
        .insert_channel(
            ChannelType::OpenAI,
            "upstream-key-s",
            "streamer",
            1,
            20,
            &base("/stream"),
            "gpt-4o",
            "default",
            None,
            None,
        )
        .unwrap();
    for id in [channel_a, channel_b, channel_stream] {
        let channel = store.get_channel(id).unwrap().unwrap();
        store.rebuild_channel_abilities(&channel).unwrap();
    }
    ability::init_channel_cache(&store).unwrap();

    let quota_before = store.get_user_quota(user_id).unwrap();
    let response = client
        .post(format!("http://{}/v1/chat/completions", gateway))
        .header("authorization", &auth)
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 60,
            "stream": true
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(
        response
            .headers()
            .get("x-accel-buffering")
            .and_then(|v| v.to_str().ok()),
        Some("no")
    );
    let text = response.text().await.unwrap();
    assert!(text.contains("\"content\":\"Hello\""));
    assert!(text.trim_end().ends_with("data: [DONE]"));

    // Streamed billing settles asynchronously; the hold is released
    // once the upstream side finishes. Usage frame said 5 + 2 tokens
    // at unit ratio.
    let mut settled = None;
    for _ in 0..200 {
        let quota = store.get_user_quota(user_id).unwrap();
        if quota == quota_before - 7 {
            settled = Some(quota);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(settled, Some(quota_before - 7));

    let logs = store
        .list_logs(&LogQuery {
            log_type: Some(LogType::Consume),
            user_id: Some(user_id),
            ..Default::default()
        })
        .unwrap();
    let stream_log = logs.iter().find(|l| l.is_stream).expect("stream log");
    assert_eq!(stream_log.quota, 7);
    assert_eq!(stream_log.channel_id, channel_stream);

    // ---- Insufficient quota refuses before any upstream call.
    let calls_before = mock.calls_stream.load(Ordering::SeqCst);
    let poor_key = "poorintegrationkey000000000000000000000000000000";
    store
        .insert_token(user_id, poor_key, "poor", -1, 1, false, None)
        .unwrap();
    let response = client
        .post(format!("http://{}/v1/chat/completions", gateway))
        .header("authorization", format!("Bearer sk-{}", poor_key))
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 60
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 402);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "insufficient_quota");
    assert_eq!(mock.calls_stream.load(Ordering::SeqCst), calls_before);
}
