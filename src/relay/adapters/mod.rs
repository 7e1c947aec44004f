//! Provider adapters: translate the neutral request into each
//! provider's wire format, the provider's reply back into the unified
//! shape, and provider event streams into unified deltas.

pub mod anthropic;
pub mod bedrock;
pub mod cohere;
pub mod gemini;
pub mod openai;

use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::db::channels::{Channel, ChannelType};
use crate::error::GatewayResult;
use crate::relay::request::{GeneralRequest, Usage};
use crate::relay::sse::StreamTranslator;

/// Which unified surface the request came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Images,
}

/// A provider-specific payload plus the resolved provider model id.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub payload: Value,
    pub provider_model: String,
}

/// Unified response plus the usage measured from it.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub body: Value,
    pub usage: Usage,
}

/// The capability set every provider family implements.
pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Absolute upstream URL for this channel and mode.
    fn build_url(
        &self,
        channel: &Channel,
        provider_model: &str,
        mode: RelayMode,
        stream: bool,
    ) -> String;

    /// Authentication and protocol headers for this channel.
    fn build_headers(&self, channel: &Channel) -> HeaderMap;

    /// Neutral request -> provider payload. Omitted neutral fields
    /// must stay omitted so upstream defaults survive.
    fn convert_request(
        &self,
        request: &GeneralRequest,
        channel: &Channel,
        mode: RelayMode,
    ) -> GatewayResult<WireRequest>;

    /// Provider reply -> unified response + usage.
    fn parse_response(
        &self,
        body: &Value,
        request: &GeneralRequest,
        mode: RelayMode,
    ) -> GatewayResult<WireResponse>;

    /// Whether this adapter can stream. Buffering adapters are driven
    /// through the non-streaming path even for stream requests.
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Fresh per-request translator for the provider's event stream.
    fn stream_translator(&self, request: &GeneralRequest) -> Box<dyn StreamTranslator>;

    /// Models this provider family is known to serve; used by channel
    /// bootstrap when the operator lists none.
    fn model_list(&self) -> Vec<&'static str>;
}

/// Resolve the adapter for a channel type. Static registry; resolved
/// once per request from the selected channel.
pub fn get_adapter(channel_type: ChannelType) -> &'static dyn Adapter {
    match channel_type {
        ChannelType::OpenAI | ChannelType::Azure | ChannelType::Qwen => &openai::OpenAIAdapter,
        ChannelType::Anthropic => &anthropic::AnthropicAdapter,
        ChannelType::Bedrock => &bedrock::BedrockAdapter,
        ChannelType::Vertex => &gemini::GeminiAdapter,
        ChannelType::Cohere => &cohere::CohereAdapter,
    }
}

/// Uniform stop-reason mapping. Unknown provider reasons pass through
/// lowercased, unchanged in meaning.
pub fn map_stop_reason(raw: &str) -> String {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "max_tokens" => "length".to_string(),
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "content_filtered" => "content_filter".to_string(),
        "tool_use" => "tool_calls".to_string(),
        _ => normalized,
    }
}

/// Usage extraction for OpenAI-shaped `usage` objects, shared by the
/// OpenAI-compatible families.
pub fn extract_openai_usage(body: &Value) -> Usage {
    let usage = &body["usage"];
    let prompt = usage["prompt_tokens"].as_i64().unwrap_or(0);
    let completion = usage["completion_tokens"].as_i64().unwrap_or(0);
    let total = usage["total_tokens"].as_i64().unwrap_or(prompt + completion);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
        cached_prompt_tokens: usage["prompt_tokens_details"]["cached_tokens"]
            .as_i64()
            .unwrap_or(0),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_channel_type() {
        assert_eq!(get_adapter(ChannelType::OpenAI).name(), "openai");
        assert_eq!(get_adapter(ChannelType::Qwen).name(), "openai");
        assert_eq!(get_adapter(ChannelType::Azure).name(), "openai");
        assert_eq!(get_adapter(ChannelType::Anthropic).name(), "anthropic");
        assert_eq!(get_adapter(ChannelType::Bedrock).name(), "bedrock");
        assert_eq!(get_adapter(ChannelType::Vertex).name(), "gemini");
        assert_eq!(get_adapter(ChannelType::Cohere).name(), "cohere");
    }

    #[test]
    fn stop_reason_table() {
        assert_eq!(map_stop_reason("MAX_TOKENS"), "length");
        assert_eq!(map_stop_reason("end_turn"), "stop");
        assert_eq!(map_stop_reason("stop_sequence"), "stop");
        assert_eq!(map_stop_reason("content_filtered"), "content_filter");
        assert_eq!(map_stop_reason("tool_use"), "tool_calls");
        // Unknown reasons pass through.
        assert_eq!(map_stop_reason("weird_reason"), "weird_reason");
    }

    #[test]
    fn usage_extraction_fills_total() {
        let body = serde_json::json!({
            "usage": { "prompt_tokens": 40, "completion_tokens": 30 }
        });
        let usage = extract_openai_usage(&body);
        assert_eq!(usage.total_tokens, 70);
    }
}
