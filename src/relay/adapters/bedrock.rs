//! AWS Bedrock adapter (Anthropic models via the Bedrock runtime).
//!
//! Speaks the Anthropic payload dialect with the Bedrock envelope.
//! Responses are buffered: the Bedrock event-stream framing is not a
//! text SSE stream, so stream requests are served from the buffered
//! reply.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};

use crate::db::channels::Channel;
use crate::error::GatewayResult;
use crate::relay::request::GeneralRequest;
use crate::relay::sse::StreamTranslator;

use super::{anthropic::AnthropicAdapter, Adapter, RelayMode, WireRequest, WireResponse};

const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

pub struct BedrockAdapter;

fn region(channel: &Channel) -> String {
    channel
        .config
        .as_deref()
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|cfg| cfg["region"].as_str().map(str::to_string))
        .unwrap_or_else(|| "us-east-1".to_string())
}

/// Model id on the wire: the per-model inference-profile ARN when the
/// channel maps one, otherwise the mapped model id.
fn wire_model(channel: &Channel, requested: &str) -> String {
    channel
        .inference_profile_arn(requested)
        .unwrap_or_else(|| channel.mapped_model(requested))
}

impl Adapter for BedrockAdapter {
    fn name(&self) -> &'static str {
        "bedrock"
    }

    fn build_url(
        &self,
        channel: &Channel,
        provider_model: &str,
        _mode: RelayMode,
        _stream: bool,
    ) -> String {
        let base = if channel.base_url.is_empty() {
            format!("https://bedrock-runtime.{}.amazonaws.com", region(channel))
        } else {
            channel.base_url.trim_end_matches('/').to_string()
        };
        // ARNs carry '/' and ':'; keep them URL-safe.
        let encoded: String = provider_model
            .chars()
            .map(|c| match c {
                '/' => "%2F".to_string(),
                ':' => "%3A".to_string(),
                other => other.to_string(),
            })
            .collect();
        format!("{}/model/{}/invoke", base, encoded)
    }

    fn build_headers(&self, channel: &Channel) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", channel.key)) {
            headers.insert("authorization", value);
        }
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("accept", HeaderValue::from_static("application/json"));
        headers
    }

    fn convert_request(
        &self,
        request: &GeneralRequest,
        channel: &Channel,
        mode: RelayMode,
    ) -> GatewayResult<WireRequest> {
        // Same body dialect as Anthropic, minus the fields the
        // Bedrock envelope owns.
        let mut wire = AnthropicAdapter.convert_request(request, channel, mode)?;
        if let Some(obj) = wire.payload.as_object_mut() {
            obj.remove("model");
            obj.remove("stream");
            obj.insert(
                "anthropic_version".to_string(),
                json!(BEDROCK_ANTHROPIC_VERSION),
            );
        }
        wire.provider_model = wire_model(channel, &request.model);
        Ok(WireRequest {
            payload: wire.payload,
            provider_model: wire.provider_model,
        })
    }

    fn parse_response(
        &self,
        body: &Value,
        request: &GeneralRequest,
        mode: RelayMode,
    ) -> GatewayResult<WireResponse> {
        AnthropicAdapter.parse_response(body, request, mode)
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    fn stream_translator(&self, request: &GeneralRequest) -> Box<dyn StreamTranslator> {
        // Unreachable in practice (supports_streaming is false); the
        // Anthropic translator keeps the contract total.
        AnthropicAdapter.stream_translator(request)
    }

    fn model_list(&self) -> Vec<&'static str> {
        vec![
            "anthropic.claude-3-5-sonnet-20241022-v2:0",
            "anthropic.claude-3-5-haiku-20241022-v1:0",
            "anthropic.claude-3-opus-20240229-v1:0",
        ]
    }
}
