//! Unified streaming: provider event streams are translated into one
//! delta-event vocabulary, then written to the client as OpenAI-shaped
//! SSE chunks ending with `data: [DONE]`.
//!
//! Two tasks cooperate per request: an upstream reader feeding a
//! bounded channel, and the response body draining it. Dropping the
//! body (client disconnect) closes the channel and stops the reader.

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::clock::{self, CancelToken};
use crate::db::traces::TraceStamp;
use crate::db::Store;
use crate::logger;
use crate::relay::request::Usage;

/// Buffered events between the upstream reader and the client writer.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Terminator payload on both sides of the relay.
const DONE_MARKER: &str = "[DONE]";

/// Splits an upstream byte stream into `data:` payloads. A line is
/// only decoded once its newline arrives, so multi-byte characters
/// straddling a network chunk stay intact. Event names, comments,
/// and blank separator lines carry nothing the translators need and
/// are dropped here.
struct SseDataLines {
    carry: Vec<u8>,
}

impl SseDataLines {
    fn new() -> Self {
        Self { carry: Vec::new() }
    }

    /// Feed one chunk; returns the payload of every line it completed.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut payloads = Vec::new();
        let mut pieces = chunk.split(|&b| b == b'\n');
        // The first piece extends whatever the previous chunk left
        // unfinished; every later piece means a newline closed the
        // carry before it.
        if let Some(first) = pieces.next() {
            self.carry.extend_from_slice(first);
        }
        for piece in pieces {
            let line = String::from_utf8_lossy(&self.carry);
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
            self.carry.clear();
            self.carry.extend_from_slice(piece);
        }
        payloads
    }
}

/// The trimmed payload of a `data:` line; None for anything else or
/// an empty payload.
fn data_payload(line: &str) -> Option<String> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        None
    } else {
        Some(payload.to_string())
    }
}

/// One delta in the unified stream vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart,
    ContentDelta(Delta),
    ContentBlockEnd,
    MessageStop { finish_reason: Option<String> },
    Usage(Usage),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Text(String),
    ReasoningText(String),
    ToolCallArguments {
        index: i64,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
}

/// Stateful translator from one provider's event stream to the
/// unified vocabulary. One instance per request.
pub trait StreamTranslator: Send {
    /// Translate one SSE data payload.
    fn on_data(&mut self, data: &str) -> Vec<StreamEvent>;
    /// Flush any trailing state once the upstream ends.
    fn finish(&mut self) -> Vec<StreamEvent>;
    /// Usage accumulated so far.
    fn usage(&self) -> Usage;
    /// Finish reason observed so far.
    fn finish_reason(&self) -> Option<String>;
}

/// Called exactly once when the upstream side is done (or the client
/// went away) with the accumulated usage and finish reason.
pub type StreamFinalizer = Box<dyn FnOnce(Usage, Option<String>) + Send>;

/// Format one unified event as an OpenAI chat chunk frame. Events
/// with no client-visible payload yield None.
pub fn format_chunk(event: &StreamEvent, id: &str, model: &str, created: i64) -> Option<String> {
    let chunk = |choices: Value, usage: Option<&Usage>| {
        let mut body = json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": choices,
        });
        if let Some(usage) = usage {
            body["usage"] = serde_json::to_value(usage).unwrap_or(Value::Null);
        }
        format!("data: {}\n\n", body)
    };

    match event {
        StreamEvent::MessageStart => Some(chunk(
            json!([{ "index": 0, "delta": { "role": "assistant", "content": "" }, "finish_reason": null }]),
            None,
        )),
        StreamEvent::ContentDelta(Delta::Text(text)) => Some(chunk(
            json!([{ "index": 0, "delta": { "content": text }, "finish_reason": null }]),
            None,
        )),
        StreamEvent::ContentDelta(Delta::ReasoningText(text)) => Some(chunk(
            json!([{ "index": 0, "delta": { "reasoning_content": text }, "finish_reason": null }]),
            None,
        )),
        StreamEvent::ContentDelta(Delta::ToolCallArguments {
            index,
            id: call_id,
            name,
            arguments,
        }) => {
            let mut call = json!({ "index": index, "type": "function", "function": {} });
            if let Some(call_id) = call_id {
                call["id"] = json!(call_id);
            }
            if let Some(name) = name {
                call["function"]["name"] = json!(name);
            }
            call["function"]["arguments"] = json!(arguments);
            Some(chunk(
                json!([{ "index": 0, "delta": { "tool_calls": [call] }, "finish_reason": null }]),
                None,
            ))
        }
        StreamEvent::ContentBlockEnd => None,
        StreamEvent::MessageStop { finish_reason } => Some(chunk(
            json!([{ "index": 0, "delta": {}, "finish_reason": finish_reason }]),
            None,
        )),
        StreamEvent::Usage(usage) => Some(chunk(json!([]), Some(usage))),
    }
}

fn apply_sse_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
}

/// Bridge an upstream SSE response to the client.
///
/// The reader task translates upstream lines into unified events; the
/// response body formats them as neutral chunks. `finalizer` runs when
/// the upstream ends, whether or not the client is still connected.
pub fn stream_response(
    upstream: reqwest::Response,
    mut translator: Box<dyn StreamTranslator>,
    response_id: String,
    model: String,
    store: Store,
    trace_id: String,
    cancel: CancelToken,
    finalizer: StreamFinalizer,
) -> Response {
    let created = clock::now_s();
    let (tx, rx) = mpsc::channel::<StreamEvent>(STREAM_CHANNEL_CAPACITY);

    let reader_store = store.clone();
    let reader_trace = trace_id.clone();
    tokio::spawn(async move {
        let mut byte_stream = upstream.bytes_stream();
        let mut lines = SseDataLines::new();
        let mut first_chunk = true;
        let mut sent_stop = false;

        'read: while let Some(chunk) = byte_stream.next().await {
            if cancel.is_cancelled() {
                break;
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    logger::warn("sse", &format!("upstream stream error: {}", e));
                    break;
                }
            };
            if first_chunk {
                first_chunk = false;
                let _ = reader_store
                    .stamp_trace(&reader_trace, TraceStamp::FirstUpstreamResponse);
            }
            for payload in lines.push(&chunk) {
                if payload == DONE_MARKER {
                    break 'read;
                }
                for event in translator.on_data(&payload) {
                    if matches!(event, StreamEvent::MessageStop { .. }) {
                        sent_stop = true;
                    }
                    if tx.send(event).await.is_err() {
                        // Client went away; stop reading upstream.
                        cancel.cancel();
                        break 'read;
                    }
                }
            }
        }

        let _ = reader_store.stamp_trace(&reader_trace, TraceStamp::UpstreamCompleted);

        for event in translator.finish() {
            if matches!(event, StreamEvent::MessageStop { .. }) {
                sent_stop = true;
            }
            let _ = tx.send(event).await;
        }
        let usage = translator.usage();
        let finish_reason = translator.finish_reason();
        if !sent_stop {
            let _ = tx
                .send(StreamEvent::MessageStop {
                    finish_reason: finish_reason.clone(),
                })
                .await;
        }
        let _ = tx.send(StreamEvent::Usage(usage.clone())).await;
        drop(tx);

        finalizer(usage, finish_reason);
    });

    let writer_store = store;
    let writer_trace = trace_id;
    let body_stream = futures_util::stream::unfold(
        (Some(rx), true),
        move |(state, first_frame)| {
            let writer_store = writer_store.clone();
            let writer_trace = writer_trace.clone();
            let response_id = response_id.clone();
            let model = model.clone();
            async move {
                let mut rx = state?;
                loop {
                    match rx.recv().await {
                        Some(event) => {
                            let Some(frame) = format_chunk(&event, &response_id, &model, created)
                            else {
                                continue;
                            };
                            if first_frame {
                                let _ = writer_store
                                    .stamp_trace(&writer_trace, TraceStamp::FirstClientResponse);
                            }
                            return Some((
                                Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(frame)),
                                (Some(rx), false),
                            ));
                        }
                        None => {
                            return Some((
                                Ok(axum::body::Bytes::from_static(b"data: [DONE]\n\n")),
                                (None, false),
                            ));
                        }
                    }
                }
            }
        },
    );

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.status_mut() = StatusCode::OK;
    apply_sse_headers(&mut response);
    response
}
