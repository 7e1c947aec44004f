//! Cohere adapter (v2 chat and embed APIs).

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Map, Value};

use crate::db::channels::Channel;
use crate::error::{GatewayError, GatewayResult};
use crate::relay::request::{GeneralRequest, Usage};
use crate::relay::sse::{Delta, StreamEvent, StreamTranslator};

use super::{map_stop_reason, Adapter, RelayMode, WireRequest, WireResponse};

pub struct CohereAdapter;

impl Adapter for CohereAdapter {
    fn name(&self) -> &'static str {
        "cohere"
    }

    fn build_url(
        &self,
        channel: &Channel,
        _provider_model: &str,
        mode: RelayMode,
        _stream: bool,
    ) -> String {
        let base = if channel.base_url.is_empty() {
            "https://api.cohere.com"
        } else {
            channel.base_url.trim_end_matches('/')
        };
        match mode {
            RelayMode::Embeddings => format!("{}/v2/embed", base),
            _ => format!("{}/v2/chat", base),
        }
    }

    fn build_headers(&self, channel: &Channel) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", channel.key)) {
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
        if mode == RelayMode::Embeddings {
            let texts = match &request.input {
                Some(Value::String(s)) => json!([s]),
                Some(Value::Array(items)) => json!(items),
                _ => json!([]),
            };
            let payload = json!({
                "model": provider_model,
                "texts": texts,
                "input_type": "search_document",
                "embedding_types": ["float"]
            });
            return Ok(WireRequest {
                payload,
                provider_model,
            });
        }
        if mode != RelayMode::ChatCompletions {
            return Err(GatewayError::InvalidInput(format!(
                "cohere channels serve chat and embeddings only, got {:?}",
                mode
            )));
        }

        // Cohere v2 accepts the OpenAI message list directly.
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.as_str(),
                    "content": m.content.flat_text()
                })
            })
            .collect();

        let mut payload = Map::new();
        payload.insert("model".to_string(), json!(provider_model));
        payload.insert("messages".to_string(), json!(messages));
        if let Some(temperature) = request.temperature {
            payload.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            payload.insert("p".to_string(), json!(top_p));
        }
        if let Some(top_k) = request.top_k {
            payload.insert("k".to_string(), json!(top_k));
        }
        if let Some(max) = request.max_completion_tokens.or(request.max_tokens) {
            payload.insert("max_tokens".to_string(), json!(max));
        }
        let stops = request.stop_sequences();
        if !stops.is_empty() {
            payload.insert("stop_sequences".to_string(), json!(stops));
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
        request: &GeneralRequest,
        mode: RelayMode,
    ) -> GatewayResult<WireResponse> {
        if mode == RelayMode::Embeddings {
            let usage = Usage::new(
                body["meta"]["billed_units"]["input_tokens"]
                    .as_i64()
                    .unwrap_or_else(|| request.estimate_prompt_tokens()),
                0,
            );
            let data: Vec<Value> = body["embeddings"]["float"]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(i, e)| json!({ "object": "embedding", "index": i, "embedding": e }))
                .collect();
            let unified = json!({
                "object": "list",
                "data": data,
                "model": request.model,
                "usage": { "prompt_tokens": usage.prompt_tokens, "total_tokens": usage.total_tokens }
            });
            return Ok(WireResponse {
                body: unified,
                usage,
            });
        }

        let usage = extract_cohere_usage(&body["usage"]);
        let mut text = String::new();
        if let Some(parts) = body["message"]["content"].as_array() {
            for part in parts {
                if let Some(t) = part["text"].as_str() {
                    text.push_str(t);
                }
            }
        }
        let finish_reason = body["finish_reason"]
            .as_str()
            .map(map_stop_reason)
            .unwrap_or_else(|| "stop".to_string());
        let unified = json!({
            "id": body["id"],
            "object": "chat.completion",
            "created": crate::clock::now_s(),
            "model": request.model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": text },
                "finish_reason": finish_reason
            }],
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
        Box::new(CohereStreamTranslator {
            usage: Usage::default(),
            estimated_prompt: request.estimate_prompt_tokens(),
            finish_reason: None,
        })
    }

    fn model_list(&self) -> Vec<&'static str> {
        vec!["command-r-plus", "command-r", "command-a-03-2025", "embed-v4.0"]
    }
}

fn extract_cohere_usage(usage: &Value) -> Usage {
    let prompt = usage["billed_units"]["input_tokens"]
        .as_i64()
        .or_else(|| usage["tokens"]["input_tokens"].as_i64())
        .unwrap_or(0);
    let completion = usage["billed_units"]["output_tokens"]
        .as_i64()
        .or_else(|| usage["tokens"]["output_tokens"].as_i64())
        .unwrap_or(0);
    Usage::new(prompt, completion)
}

struct CohereStreamTranslator {
    usage: Usage,
    estimated_prompt: i64,
    finish_reason: Option<String>,
}

impl StreamTranslator for CohereStreamTranslator {
    fn on_data(&mut self, data: &str) -> Vec<StreamEvent> {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        match event["type"].as_str() {
            Some("message-start") => vec![StreamEvent::MessageStart],
            Some("content-delta") => {
                let text = event["delta"]["message"]["content"]["text"]
                    .as_str()
                    .unwrap_or_default();
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![StreamEvent::ContentDelta(Delta::Text(text.to_string()))]
                }
            }
            Some("content-end") => vec![StreamEvent::ContentBlockEnd],
            Some("message-end") => {
                let usage = extract_cohere_usage(&event["delta"]["usage"]);
                if usage.total_tokens > 0 {
                    self.usage = usage;
                }
                let reason = event["delta"]["finish_reason"]
                    .as_str()
                    .map(map_stop_reason);
                self.finish_reason = reason.clone();
                vec![StreamEvent::MessageStop {
                    finish_reason: reason,
                }]
            }
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
            channel_type: ChannelType::Cohere,
            key: "secret".into(),
            status: ChannelStatus::Enabled,
            name: "c".into(),
            weight: 1,
            priority: 0,
            base_url: String::new(),
            models: "command-r-plus".into(),
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

    #[test]
    fn chat_payload_uses_v2_shape() {
        let req: GeneralRequest = serde_json::from_value(json!({
            "model": "command-r-plus",
            "messages": [{"role": "user", "content": "hi"}],
            "top_p": 0.9
        }))
        .unwrap();
        let wire = CohereAdapter
            .convert_request(&req, &channel(), RelayMode::ChatCompletions)
            .unwrap();
        assert_eq!(wire.payload["messages"][0]["content"], "hi");
        assert_eq!(wire.payload["p"], 0.9);
        assert!(wire.payload.get("top_p").is_none());
    }

    #[test]
    fn response_flattens_content_parts() {
        let body = json!({
            "id": "res_1",
            "message": { "content": [{"type": "text", "text": "hel"}, {"type": "text", "text": "lo"}] },
            "finish_reason": "COMPLETE",
            "usage": { "billed_units": { "input_tokens": 8, "output_tokens": 3 } }
        });
        let req: GeneralRequest =
            serde_json::from_value(json!({"model": "command-r-plus", "messages": []})).unwrap();
        let parsed = CohereAdapter
            .parse_response(&body, &req, RelayMode::ChatCompletions)
            .unwrap();
        assert_eq!(parsed.body["choices"][0]["message"]["content"], "hello");
        // Unknown reason passes through lowercased.
        assert_eq!(parsed.body["choices"][0]["finish_reason"], "complete");
        assert_eq!(parsed.usage, Usage::new(8, 3));
    }

    #[test]
    fn stream_events_translate() {
        let req: GeneralRequest =
            serde_json::from_value(json!({"model": "m", "messages": [{"role":"user","content":"hi"}]}))
                .unwrap();
        let mut translator = CohereAdapter.stream_translator(&req);
        assert_eq!(
            translator.on_data(r#"{"type":"message-start"}"#),
            vec![StreamEvent::MessageStart]
        );
        assert_eq!(
            translator.on_data(
                r#"{"type":"content-delta","delta":{"message":{"content":{"text":"yo"}}}}"#
            ),
            vec![StreamEvent::ContentDelta(Delta::Text("yo".into()))]
        );
        let events = translator.on_data(
            r#"{"type":"message-end","delta":{"finish_reason":"MAX_TOKENS",
                "usage":{"billed_units":{"input_tokens":5,"output_tokens":2}}}}"#,
        );
        assert!(matches!(
            &events[0],
            StreamEvent::MessageStop { finish_reason: Some(r) } if r == "length"
        ));
        assert_eq!(translator.usage(), Usage::new(5, 2));
    }
}
