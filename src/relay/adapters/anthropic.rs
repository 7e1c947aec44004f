//! Anthropic Messages API adapter.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Map, Value};

use crate::config;
use crate::db::channels::Channel;
use crate::error::{GatewayError, GatewayResult};
use crate::relay::request::{
    ContentPart, GeneralRequest, MessageContent, ReasoningEffort, Role, ToolChoice, Usage,
};
use crate::relay::sse::{Delta, StreamEvent, StreamTranslator};

use super::{map_stop_reason, Adapter, RelayMode, WireRequest, WireResponse};

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter;

fn thinking_budget(effort: ReasoningEffort) -> Option<i64> {
    match effort {
        ReasoningEffort::None => None,
        ReasoningEffort::Low => Some(1024),
        ReasoningEffort::Medium => Some(4096),
        ReasoningEffort::High => Some(16384),
    }
}

fn content_to_blocks(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => json!([{ "type": "text", "text": text }]),
        MessageContent::Parts(parts) => {
            let blocks: Vec<Value> = parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => {
                        Some(json!({ "type": "text", "text": text }))
                    }
                    ContentPart::ImageUrl { image_url } => Some(json!({
                        "type": "image",
                        "source": { "type": "url", "url": image_url.url }
                    })),
                    ContentPart::ToolCall { tool_call } => Some(tool_call.clone()),
                    ContentPart::ToolResult { tool_result } => Some(tool_result.clone()),
                })
                .collect();
            Value::Array(blocks)
        }
    }
}

/// Build the Anthropic messages array plus the system string.
fn convert_messages(request: &GeneralRequest) -> GatewayResult<(Value, Option<String>)> {
    let mut system = String::new();
    let mut messages: Vec<Value> = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System => {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&message.content.flat_text());
            }
            Role::User => {
                messages.push(json!({
                    "role": "user",
                    "content": content_to_blocks(&message.content)
                }));
            }
            Role::Assistant => {
                // Empty text blocks are rejected upstream; tool-call
                // turns usually carry no text at all.
                let mut blocks: Vec<Value> = match content_to_blocks(&message.content) {
                    Value::Array(blocks) => blocks
                        .into_iter()
                        .filter(|b| {
                            b["type"] != "text" || !b["text"].as_str().unwrap_or("").is_empty()
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        let input: Value = if call.function.arguments.trim().is_empty() {
                            json!({})
                        } else {
                            serde_json::from_str(&call.function.arguments).map_err(|e| {
                                GatewayError::InvalidInput(format!(
                                    "tool call arguments are not valid JSON: {}",
                                    e
                                ))
                            })?
                        };
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.function.name,
                            "input": input
                        }));
                    }
                }
                messages.push(json!({ "role": "assistant", "content": blocks }));
            }
            Role::Tool => {
                let tool_use_id = message.tool_call_id.clone().unwrap_or_default();
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": message.content.flat_text()
                    }]
                }));
            }
        }
    }
    let system = if system.is_empty() { None } else { Some(system) };
    Ok((Value::Array(messages), system))
}

impl Adapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn build_url(
        &self,
        channel: &Channel,
        _provider_model: &str,
        _mode: RelayMode,
        _stream: bool,
    ) -> String {
        let base = if channel.base_url.is_empty() {
            "https://api.anthropic.com"
        } else {
            channel.base_url.trim_end_matches('/')
        };
        format!("{}/v1/messages", base)
    }

    fn build_headers(&self, channel: &Channel) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&channel.key) {
            headers.insert("x-api-key", value);
        }
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers
    }

    fn convert_request(
        &self,
        request: &GeneralRequest,
        channel: &Channel,
        mode: RelayMode,
    ) -> GatewayResult<WireRequest> {
        if !matches!(mode, RelayMode::ChatCompletions) {
            return Err(GatewayError::InvalidInput(format!(
                "anthropic channels serve chat only, got {:?}",
                mode
            )));
        }
        let provider_model = channel.mapped_model(&request.model);
        let (messages, system) = convert_messages(request)?;

        let mut payload = Map::new();
        payload.insert("model".to_string(), json!(provider_model));
        payload.insert("messages".to_string(), messages);
        payload.insert(
            "max_tokens".to_string(),
            json!(request.completion_budget(config::load().default_max_token)),
        );
        if let Some(system) = system {
            payload.insert("system".to_string(), json!(system));
        }
        if let Some(temperature) = request.temperature {
            payload.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            payload.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(top_k) = request.top_k {
            payload.insert("top_k".to_string(), json!(top_k));
        }
        let stops = request.stop_sequences();
        if !stops.is_empty() {
            payload.insert("stop_sequences".to_string(), json!(stops));
        }
        if let Some(effort) = request.reasoning_effort {
            if let Some(budget) = thinking_budget(effort) {
                payload.insert(
                    "thinking".to_string(),
                    json!({ "type": "enabled", "budget_tokens": budget }),
                );
            }
        }
        if let Some(tools) = &request.tools {
            let tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.function.name,
                        "description": t.function.description,
                        "input_schema": t.function.parameters.clone().unwrap_or(json!({"type":"object"}))
                    })
                })
                .collect();
            payload.insert("tools".to_string(), json!(tools));
        }
        if let Some(choice) = &request.tool_choice {
            let wire = match choice {
                ToolChoice::Auto => json!({ "type": "auto" }),
                ToolChoice::Any => json!({ "type": "any" }),
                ToolChoice::Function(name) => json!({ "type": "tool", "name": name }),
            };
            payload.insert("tool_choice".to_string(), wire);
        }
        if request.stream {
            payload.insert("stream".to_string(), json!(true));
        }

        Ok(WireRequest {
            payload: Value::Object(payload),
            provider_model,
        })
    }

    fn parse_response(
        &self,
        body: &Value,
        _request: &GeneralRequest,
        _mode: RelayMode,
    ) -> GatewayResult<WireResponse> {
        let usage = extract_anthropic_usage(&body["usage"]);

        let mut text = String::new();
        let mut reasoning = String::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        if let Some(blocks) = body["content"].as_array() {
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
                    Some("thinking") => {
                        reasoning.push_str(block["thinking"].as_str().unwrap_or_default())
                    }
                    Some("tool_use") => {
                        tool_calls.push(json!({
                            "id": block["id"],
                            "type": "function",
                            "function": {
                                "name": block["name"],
                                "arguments": block["input"].to_string()
                            }
                        }));
                    }
                    _ => {}
                }
            }
        }

        let finish_reason = body["stop_reason"]
            .as_str()
            .map(map_stop_reason)
            .unwrap_or_else(|| "stop".to_string());

        let mut message = json!({ "role": "assistant", "content": text });
        if !reasoning.is_empty() {
            message["reasoning_content"] = json!(reasoning);
        }
        if !tool_calls.is_empty() {
            message["tool_calls"] = json!(tool_calls);
        }

        let unified = json!({
            "id": body["id"],
            "object": "chat.completion",
            "created": crate::clock::now_s(),
            "model": body["model"],
            "choices": [{ "index": 0, "message": message, "finish_reason": finish_reason }],
            "usage": {
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
                "total_tokens": usage.total_tokens
            }
        });
        Ok(WireResponse {
            body: unified,
            usage,
        })
    }

    fn stream_translator(&self, request: &GeneralRequest) -> Box<dyn StreamTranslator> {
        Box::new(AnthropicStreamTranslator {
            usage: Usage::default(),
            estimated_prompt: request.estimate_prompt_tokens(),
            finish_reason: None,
            block_index: 0,
            block_tool_id: None,
            block_tool_name: None,
        })
    }

    fn model_list(&self) -> Vec<&'static str> {
        vec![
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
            "claude-3-7-sonnet-20250219",
            "claude-3-opus-20240229",
        ]
    }
}

fn extract_anthropic_usage(usage: &Value) -> Usage {
    let prompt = usage["input_tokens"].as_i64().unwrap_or(0);
    let completion = usage["output_tokens"].as_i64().unwrap_or(0);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
        cached_prompt_tokens: usage["cache_read_input_tokens"].as_i64().unwrap_or(0),
        cached_completion_tokens: 0,
        cache_write_5m_tokens: usage["cache_creation"]["ephemeral_5m_input_tokens"]
            .as_i64()
            .or_else(|| usage["cache_creation_input_tokens"].as_i64())
            .unwrap_or(0),
        cache_write_1h_tokens: usage["cache_creation"]["ephemeral_1h_input_tokens"]
            .as_i64()
            .unwrap_or(0),
    }
}

struct AnthropicStreamTranslator {
    usage: Usage,
    estimated_prompt: i64,
    finish_reason: Option<String>,
    block_index: i64,
    block_tool_id: Option<String>,
    block_tool_name: Option<String>,
}

impl StreamTranslator for AnthropicStreamTranslator {
    fn on_data(&mut self, data: &str) -> Vec<StreamEvent> {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        match event["type"].as_str() {
            Some("message_start") => {
                let usage = extract_anthropic_usage(&event["message"]["usage"]);
                if usage.prompt_tokens > 0 {
                    self.usage.prompt_tokens = usage.prompt_tokens;
                    self.usage.cached_prompt_tokens = usage.cached_prompt_tokens;
                    self.usage.cache_write_5m_tokens = usage.cache_write_5m_tokens;
                    self.usage.cache_write_1h_tokens = usage.cache_write_1h_tokens;
                }
                vec![StreamEvent::MessageStart]
            }
            Some("content_block_start") => {
                self.block_index = event["index"].as_i64().unwrap_or(0);
                let block = &event["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    self.block_tool_id = block["id"].as_str().map(str::to_string);
                    self.block_tool_name = block["name"].as_str().map(str::to_string);
                } else {
                    self.block_tool_id = None;
                    self.block_tool_name = None;
                }
                Vec::new()
            }
            Some("content_block_delta") => {
                let delta = &event["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        vec![StreamEvent::ContentDelta(Delta::Text(text.to_string()))]
                    }
                    Some("thinking_delta") => {
                        let text = delta["thinking"].as_str().unwrap_or_default();
                        vec![StreamEvent::ContentDelta(Delta::ReasoningText(
                            text.to_string(),
                        ))]
                    }
                    Some("input_json_delta") => {
                        let arguments = delta["partial_json"].as_str().unwrap_or_default();
                        vec![StreamEvent::ContentDelta(Delta::ToolCallArguments {
                            index: self.block_index,
                            id: self.block_tool_id.take(),
                            name: self.block_tool_name.take(),
                            arguments: arguments.to_string(),
                        })]
                    }
                    _ => Vec::new(),
                }
            }
            Some("content_block_stop") => vec![StreamEvent::ContentBlockEnd],
            Some("message_delta") => {
                if let Some(output) = event["usage"]["output_tokens"].as_i64() {
                    self.usage.completion_tokens = output;
                }
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.finish_reason = Some(map_stop_reason(reason));
                }
                Vec::new()
            }
            Some("message_stop") => vec![StreamEvent::MessageStop {
                finish_reason: self.finish_reason.clone(),
            }],
            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        Vec::new()
    }

    fn usage(&self) -> Usage {
        let mut usage = self.usage.clone();
        if usage.prompt_tokens == 0 {
            usage.prompt_tokens = self.estimated_prompt;
        }
        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        usage
    }

    fn finish_reason(&self) -> Option<String> {
        self.finish_reason.clone()
    }
}
