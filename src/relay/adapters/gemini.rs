//! Google Gemini / Vertex adapter (generateContent API).

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Map, Value};

use crate::db::channels::Channel;
use crate::error::{GatewayError, GatewayResult};
use crate::relay::request::{GeneralRequest, ReasoningEffort, Role, ToolChoice, Usage};
use crate::relay::sse::{Delta, StreamEvent, StreamTranslator};

use super::{map_stop_reason, Adapter, RelayMode, WireRequest, WireResponse};

pub struct GeminiAdapter;

fn thinking_budget(effort: ReasoningEffort) -> i64 {
    match effort {
        ReasoningEffort::None => 0,
        ReasoningEffort::Low => 1024,
        ReasoningEffort::Medium => 8192,
        ReasoningEffort::High => 24576,
    }
}

impl Adapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn build_url(
        &self,
        channel: &Channel,
        provider_model: &str,
        mode: RelayMode,
        stream: bool,
    ) -> String {
        let base = if channel.base_url.is_empty() {
            "https://generativelanguage.googleapis.com"
        } else {
            channel.base_url.trim_end_matches('/')
        };
        let method = match mode {
            RelayMode::Embeddings => "embedContent",
            _ if stream => "streamGenerateContent?alt=sse",
            _ => "generateContent",
        };
        format!("{}/v1beta/models/{}:{}", base, provider_model, method)
    }

    fn build_headers(&self, channel: &Channel) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&channel.key) {
            headers.insert("x-goog-api-key", value);
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
        if mode == RelayMode::Embeddings {
            let payload = json!({
                "model": format!("models/{}", provider_model),
                "content": { "parts": [{ "text": request.input.clone().unwrap_or_default() }] }
            });
            return Ok(WireRequest {
                payload,
                provider_model,
            });
        }
        if mode != RelayMode::ChatCompletions {
            return Err(GatewayError::InvalidInput(format!(
                "gemini channels serve chat and embeddings only, got {:?}",
                mode
            )));
        }

        let mut system = String::new();
        let mut contents: Vec<Value> = Vec::new();
        for message in &request.messages {
            match message.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&message.content.flat_text());
                }
                Role::User | Role::Tool => {
                    contents.push(json!({
                        "role": "user",
                        "parts": [{ "text": message.content.flat_text() }]
                    }));
                }
                Role::Assistant => {
                    contents.push(json!({
                        "role": "model",
                        "parts": [{ "text": message.content.flat_text() }]
                    }));
                }
            }
        }

        let mut payload = Map::new();
        payload.insert("contents".to_string(), Value::Array(contents));
        if !system.is_empty() {
            payload.insert(
                "systemInstruction".to_string(),
                json!({ "parts": [{ "text": system }] }),
            );
        }

        let mut generation = Map::new();
        if let Some(temperature) = request.temperature {
            generation.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            generation.insert("topP".to_string(), json!(top_p));
        }
        if let Some(top_k) = request.top_k {
            generation.insert("topK".to_string(), json!(top_k));
        }
        if let Some(max) = request.max_completion_tokens.or(request.max_tokens) {
            generation.insert("maxOutputTokens".to_string(), json!(max));
        }
        let stops = request.stop_sequences();
        if !stops.is_empty() {
            generation.insert("stopSequences".to_string(), json!(stops));
        }
        if let Some(effort) = request.reasoning_effort {
            generation.insert(
                "thinkingConfig".to_string(),
                json!({ "thinkingBudget": thinking_budget(effort) }),
            );
        }
        if !generation.is_empty() {
            payload.insert("generationConfig".to_string(), Value::Object(generation));
        }

        if let Some(tools) = &request.tools {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.function.name,
                        "description": t.function.description,
                        "parameters": t.function.parameters
                    })
                })
                .collect();
            payload.insert(
                "tools".to_string(),
                json!([{ "functionDeclarations": declarations }]),
            );
        }
        if let Some(choice) = &request.tool_choice {
            let config = match choice {
                ToolChoice::Auto => json!({ "mode": "AUTO" }),
                ToolChoice::Any => json!({ "mode": "ANY" }),
                ToolChoice::Function(name) => {
                    json!({ "mode": "ANY", "allowedFunctionNames": [name] })
                }
            };
            payload.insert(
                "toolConfig".to_string(),
                json!({ "functionCallingConfig": config }),
            );
        }

        Ok(WireRequest {
            payload: Value::Object(payload),
            provider_model,
        })
    }

    fn parse_response(
        &self,
        body: &Value,
        request: &GeneralRequest,
        mode: RelayMode,
    ) -> GatewayResult<WireResponse> {
        if mode == RelayMode::Embeddings {
            let values = body["embedding"]["values"].clone();
            let usage = Usage::new(request.estimate_prompt_tokens(), 0);
            let unified = json!({
                "object": "list",
                "data": [{ "object": "embedding", "index": 0, "embedding": values }],
                "model": request.model,
                "usage": { "prompt_tokens": usage.prompt_tokens, "total_tokens": usage.total_tokens }
            });
            return Ok(WireResponse {
                body: unified,
                usage,
            });
        }

        let usage = extract_gemini_usage(&body["usageMetadata"]);
        let candidate = &body["candidates"][0];
        let mut text = String::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(t) = part["text"].as_str() {
                    text.push_str(t);
                }
                if let Some(call) = part.get("functionCall").filter(|c| !c.is_null()) {
                    tool_calls.push(json!({
                        "id": format!("call_{}", tool_calls.len()),
                        "type": "function",
                        "function": {
                            "name": call["name"],
                            "arguments": call["args"].to_string()
                        }
                    }));
                }
            }
        }
        let finish_reason = candidate["finishReason"]
            .as_str()
            .map(map_stop_reason)
            .unwrap_or_else(|| "stop".to_string());

        let mut message = json!({ "role": "assistant", "content": text });
        if !tool_calls.is_empty() {
            message["tool_calls"] = json!(tool_calls);
        }
        let unified = json!({
            "id": format!("chatcmpl-{}", crate::clock::new_request_id()),
            "object": "chat.completion",
            "created": crate::clock::now_s(),
            "model": request.model,
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
        Box::new(GeminiStreamTranslator {
            usage: Usage::default(),
            estimated_prompt: request.estimate_prompt_tokens(),
            finish_reason: None,
            started: false,
        })
    }

    fn model_list(&self) -> Vec<&'static str> {
        vec![
            "gemini-2.0-flash",
            "gemini-2.5-flash",
            "gemini-2.5-pro",
            "text-embedding-004",
        ]
    }
}

fn extract_gemini_usage(metadata: &Value) -> Usage {
    let prompt = metadata["promptTokenCount"].as_i64().unwrap_or(0);
    let completion = metadata["candidatesTokenCount"].as_i64().unwrap_or(0);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: metadata["totalTokenCount"]
            .as_i64()
            .unwrap_or(prompt + completion),
        cached_prompt_tokens: metadata["cachedContentTokenCount"].as_i64().unwrap_or(0),
        ..Default::default()
    }
}

struct GeminiStreamTranslator {
    usage: Usage,
    estimated_prompt: i64,
    finish_reason: Option<String>,
    started: bool,
}

impl StreamTranslator for GeminiStreamTranslator {
    fn on_data(&mut self, data: &str) -> Vec<StreamEvent> {
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart);
        }
        if chunk.get("usageMetadata").map(|m| !m.is_null()).unwrap_or(false) {
            let usage = extract_gemini_usage(&chunk["usageMetadata"]);
            if usage.total_tokens > 0 {
                self.usage = usage;
            }
        }
        let candidate = &chunk["candidates"][0];
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(text) = part["text"].as_str().filter(|t| !t.is_empty()) {
                    events.push(StreamEvent::ContentDelta(Delta::Text(text.to_string())));
                }
            }
        }
        if let Some(reason) = candidate["finishReason"].as_str() {
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
        let mut usage = self.usage.clone();
        if usage.prompt_tokens == 0 {
            usage.prompt_tokens = self.estimated_prompt;
            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        }
        usage
    }

    fn finish_reason(&self) -> Option<String> {
        self.finish_reason.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::channels::{ChannelStatus, ChannelType};

    fn channel() -> Channel {
        Channel {
            id: 1,
            channel_type: ChannelType::Vertex,
            key: "secret".into(),
            status: ChannelStatus::Enabled,
            name: "c".into(),
            weight: 1,
            priority: 0,
            base_url: String::new(),
            models: "gemini-2.5-flash".into(),
            model_mapping: None,
            model_configs: None,
            groups: "default".into(),
            config: None,
            test_model: None,
            rate_limit: 0,
            inference_profile_arn_map: None,
            created_time: 0,
        }
    }

    fn request(payload: Value) -> GeneralRequest {
        serde_json::from_value(payload).unwrap()
    }

    #[test]
    fn stream_flag_switches_url_method() {
        let adapter = GeminiAdapter;
        let url = adapter.build_url(&channel(), "gemini-2.5-flash", RelayMode::ChatCompletions, false);
        assert!(url.ends_with("models/gemini-2.5-flash:generateContent"));
        let url = adapter.build_url(&channel(), "gemini-2.5-flash", RelayMode::ChatCompletions, true);
        assert!(url.ends_with(":streamGenerateContent?alt=sse"));
    }

    #[test]
    fn convert_builds_contents_and_generation_config() {
        let req = request(json!({
            "model": "gemini-2.5-flash",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"}
            ],
            "temperature": 0.5,
            "max_tokens": 256,
            "stop": ["END"]
        }));
        let wire = GeminiAdapter
            .convert_request(&req, &channel(), RelayMode::ChatCompletions)
            .unwrap();
        assert_eq!(wire.payload["systemInstruction"]["parts"][0]["text"], "be brief");
        let contents = wire.payload["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[1]["role"], "model");
        let config = &wire.payload["generationConfig"];
        assert_eq!(config["maxOutputTokens"], 256);
        assert_eq!(config["stopSequences"][0], "END");
        // topP/topK omitted when unset.
        assert!(config.get("topP").is_none());
    }

    #[test]
    fn response_maps_finish_reason_and_usage() {
        let body = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "hi there" }] },
                "finishReason": "MAX_TOKENS"
            }],
            "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 5, "totalTokenCount": 15 }
        });
        let req = request(json!({"model": "gemini-2.5-flash", "messages": []}));
        let parsed = GeminiAdapter
            .parse_response(&body, &req, RelayMode::ChatCompletions)
            .unwrap();
        assert_eq!(parsed.body["choices"][0]["finish_reason"], "length");
        assert_eq!(parsed.body["choices"][0]["message"]["content"], "hi there");
        assert_eq!(parsed.usage.total_tokens, 15);
    }

    #[test]
    fn stream_translator_emits_start_text_stop() {
        let req = request(json!({"model": "m", "messages": [{"role":"user","content":"hi"}]}));
        let mut translator = GeminiAdapter.stream_translator(&req);
        let events = translator.on_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"he"}]}}]}"#,
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::MessageStart);
        let events = translator.on_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"y"}]},"finishReason":"STOP"}],
                "usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2,"totalTokenCount":6}}"#,
        );
        assert!(matches!(
            events.last().unwrap(),
            StreamEvent::MessageStop { finish_reason: Some(r) } if r == "stop"
        ));
        assert_eq!(translator.usage(), Usage::new(4, 2));
    }
}
