//! OpenAI-compatible adapter. Also serves Azure OpenAI and the other
//! OpenAI-dialect providers (Qwen/DashScope compatible mode).

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};

use crate::db::channels::{Channel, ChannelType};
use crate::error::{GatewayError, GatewayResult};
use crate::relay::request::{GeneralRequest, Usage};
use crate::relay::sse::{Delta, StreamEvent, StreamTranslator};

use super::{extract_openai_usage, map_stop_reason, Adapter, RelayMode, WireRequest, WireResponse};

const AZURE_API_VERSION: &str = "2024-06-01";

pub struct OpenAIAdapter;

fn default_base(channel: &Channel) -> &str {
    if !channel.base_url.is_empty() {
        return channel.base_url.trim_end_matches('/');
    }
    match channel.channel_type {
        ChannelType::Qwen => "https://dashscope.aliyuncs.com/compatible-mode",
        _ => "https://api.openai.com",
    }
}

fn mode_path(mode: RelayMode) -> &'static str {
    match mode {
        RelayMode::ChatCompletions => "/v1/chat/completions",
        RelayMode::Completions => "/v1/completions",
        RelayMode::Embeddings => "/v1/embeddings",
        RelayMode::Images => "/v1/images/generations",
    }
}

impl Adapter for OpenAIAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn build_url(
        &self,
        channel: &Channel,
        provider_model: &str,
        mode: RelayMode,
        _stream: bool,
    ) -> String {
        let base = default_base(channel);
        if channel.channel_type == ChannelType::Azure {
            let suffix = match mode {
                RelayMode::ChatCompletions => "chat/completions",
                RelayMode::Completions => "completions",
                RelayMode::Embeddings => "embeddings",
                RelayMode::Images => "images/generations",
            };
            return format!(
                "{}/openai/deployments/{}/{}?api-version={}",
                base, provider_model, suffix, AZURE_API_VERSION
            );
        }
        format!("{}{}", base, mode_path(mode))
    }

    fn build_headers(&self, channel: &Channel) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if channel.channel_type == ChannelType::Azure {
            if let Ok(value) = HeaderValue::from_str(&channel.key) {
                headers.insert("api-key", value);
            }
        } else if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", channel.key)) {
            headers.insert("authorization", value);
        }
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers
    }

    fn convert_request(
        &self,
        request: &GeneralRequest,
        channel: &Channel,
        mode: RelayMode,
    ) -> GatewayResult<WireRequest> {
        let provider_model = channel.mapped_model(&request.model);
        // The neutral shape is already the OpenAI dialect; serialize
        // and swap the model id.
        let mut payload = serde_json::to_value(request)?;
        let obj = payload
            .as_object_mut()
            .ok_or_else(|| GatewayError::Internal("request did not serialize to an object".into()))?;
        obj.insert("model".to_string(), json!(provider_model));
        if matches!(mode, RelayMode::Embeddings | RelayMode::Images) {
            obj.remove("messages");
            obj.remove("stream");
        } else if mode == RelayMode::Completions {
            obj.remove("messages");
        }
        if request.stream && mode == RelayMode::ChatCompletions {
            obj.insert("stream_options".to_string(), json!({ "include_usage": true }));
        }
        Ok(WireRequest {
            payload,
            provider_model,
        })
    }

    fn parse_response(
        &self,
        body: &Value,
        request: &GeneralRequest,
        _mode: RelayMode,
    ) -> GatewayResult<WireResponse> {
        let mut usage = extract_openai_usage(body);
        if usage.prompt_tokens == 0 {
            usage.prompt_tokens = request.estimate_prompt_tokens();
            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        }
        let mut body = body.clone();
        if let Some(choices) = body.get_mut("choices").and_then(|c| c.as_array_mut()) {
            for choice in choices {
                if let Some(reason) = choice["finish_reason"].as_str() {
                    choice["finish_reason"] = json!(map_stop_reason(reason));
                }
            }
        }
        Ok(WireResponse { body, usage })
    }

    fn stream_translator(&self, request: &GeneralRequest) -> Box<dyn StreamTranslator> {
        Box::new(OpenAIStreamTranslator {
            usage: Usage::default(),
            estimated_prompt: request.estimate_prompt_tokens(),
            completion_chars: 0,
            finish_reason: None,
        })
    }

    fn model_list(&self) -> Vec<&'static str> {
        vec![
            "gpt-4o",
            "gpt-4o-mini",
            "gpt-4.1",
            "gpt-4.1-mini",
            "o3-mini",
            "text-embedding-3-small",
            "text-embedding-3-large",
        ]
    }
}

struct OpenAIStreamTranslator {
    usage: Usage,
    estimated_prompt: i64,
    completion_chars: usize,
    finish_reason: Option<String>,
}

impl StreamTranslator for OpenAIStreamTranslator {
    fn on_data(&mut self, data: &str) -> Vec<StreamEvent> {
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let mut events = Vec::new();

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            let parsed = extract_openai_usage(&json!({ "usage": usage }));
            if parsed.total_tokens > 0 {
                self.usage = parsed;
            }
        }

        let Some(choice) = chunk["choices"].get(0) else {
            return events;
        };
        let delta = &choice["delta"];
        if delta["role"].as_str() == Some("assistant") && delta["content"].as_str() == Some("") {
            events.push(StreamEvent::MessageStart);
        }
        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            self.completion_chars += text.chars().count();
            events.push(StreamEvent::ContentDelta(Delta::Text(text.to_string())));
        }
        if let Some(text) = delta["reasoning_content"].as_str().filter(|t| !t.is_empty()) {
            events.push(StreamEvent::ContentDelta(Delta::ReasoningText(
                text.to_string(),
            )));
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                events.push(StreamEvent::ContentDelta(Delta::ToolCallArguments {
                    index: call["index"].as_i64().unwrap_or(0),
                    id: call["id"].as_str().map(str::to_string),
                    name: call["function"]["name"].as_str().map(str::to_string),
                    arguments: call["function"]["arguments"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                }));
            }
        }
        if let Some(reason) = choice["finish_reason"].as_str() {
            let mapped = map_stop_reason(reason);
            self.finish_reason = Some(mapped.clone());
            events.push(StreamEvent::MessageStop {
                finish_reason: Some(mapped),
            });
        }
        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        Vec::new()
    }

    fn usage(&self) -> Usage {
        if self.usage.total_tokens > 0 {
            return self.usage.clone();
        }
        // Upstream sent no usage frame; estimate both sides.
        let completion = (self.completion_chars as f64 / 3.5).round() as i64;
        Usage::new(self.estimated_prompt, completion)
    }

    fn finish_reason(&self) -> Option<String> {
        self.finish_reason.clone()
    }
}
