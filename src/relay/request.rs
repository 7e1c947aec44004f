//! The neutral request/response shapes the gateway accepts and emits.
//! A superset of the OpenAI chat wire format; adapters translate this
//! into each provider's native payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Message content: a bare string or an ordered list of parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

/// Assistant tool-call messages arrive with `"content": null`; read
/// that (and a missing field) as empty text.
fn content_or_empty<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<MessageContent, D::Error> {
    Ok(Option::<MessageContent>::deserialize(deserializer)?.unwrap_or_default())
}

impl MessageContent {
    /// Flatten to plain text, for estimation and providers without
    /// multimodal support.
    pub fn flat_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    ToolCall {
        tool_call: Value,
    },
    ToolResult {
        tool_result: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, deserialize_with = "content_or_empty")]
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn default_tool_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Serialized JSON for wire formats that require strings.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default = "default_tool_type")]
    pub tool_type: String,
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    None,
    Low,
    Medium,
    High,
}

/// Tool-choice directive: auto, any tool, or one named function.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    Any,
    Function(String),
}

impl<'de> Deserialize<'de> for ToolChoice {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::String(s) => match s.as_str() {
                "auto" | "none" => Ok(ToolChoice::Auto),
                "any" | "required" => Ok(ToolChoice::Any),
                other => Ok(ToolChoice::Function(other.to_string())),
            },
            Value::Object(obj) => {
                let name = obj
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .or_else(|| obj.get("name"))
                    .and_then(|n| n.as_str());
                match name {
                    Some(name) => Ok(ToolChoice::Function(name.to_string())),
                    None => Ok(ToolChoice::Auto),
                }
            }
            _ => Ok(ToolChoice::Auto),
        }
    }
}

impl Serialize for ToolChoice {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ToolChoice::Auto => serializer.serialize_str("auto"),
            ToolChoice::Any => serializer.serialize_str("required"),
            ToolChoice::Function(name) => serde_json::json!({
                "type": "function",
                "function": { "name": name }
            })
            .serialize(serializer),
        }
    }
}

/// The neutral request. Omitted fields stay omitted on the wire so
/// upstream defaults are preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<i64>,
    /// Raw stop value; use `stop_sequences()` for the normalized list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub stream: bool,
    /// Prompt body for the plain completions endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Value>,
    /// Input body for the embeddings endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Passthrough for dialect extras (image count/size, penalties the
    /// neutral shape does not model, ...). Round-trips untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl GeneralRequest {
    /// Ordered stop sequences; non-string entries are dropped.
    pub fn stop_sequences(&self) -> Vec<String> {
        match &self.stop {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Effective completion budget: max_completion_tokens wins over
    /// max_tokens; `default` fills the gap.
    pub fn completion_budget(&self, default: i64) -> i64 {
        self.max_completion_tokens
            .or(self.max_tokens)
            .unwrap_or(default)
    }

    /// Rough prompt-token estimate over all message text.
    pub fn estimate_prompt_tokens(&self) -> i64 {
        let mut text = String::new();
        for message in &self.messages {
            text.push_str(&message.content.flat_text());
            text.push('\n');
        }
        if let Some(prompt) = &self.prompt {
            text.push_str(&prompt.to_string());
        }
        if let Some(input) = &self.input {
            text.push_str(&input.to_string());
        }
        estimate_tokens(&text)
    }
}

/// Estimate tokens from text (rough approximation: ~3.5 chars per token).
pub fn estimate_tokens(text: &str) -> i64 {
    let char_count = text.chars().count();
    (char_count as f64 / 3.5).round() as i64
}

/// Usage measured from the upstream reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cached_prompt_tokens: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cached_completion_tokens: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_write_5m_tokens: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_write_1h_tokens: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Usage {
    pub fn new(prompt: i64, completion: i64) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            ..Default::default()
        }
    }
}

/// Unified non-streaming response, OpenAI shaped.
#[derive(Debug, Clone, Serialize)]
pub struct GeneralResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub index: i64,
    pub message: ResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMessage {
    pub role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_chat_request() {
        let req: GeneralRequest = serde_json::from_str(
            r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        assert_eq!(req.model, "gpt-4o");
        assert!(!req.stream);
        assert!(req.temperature.is_none());
        assert_eq!(req.messages[0].content.flat_text(), "hi");
    }

    #[test]
    fn parses_multimodal_parts() {
        let req: GeneralRequest = serde_json::from_str(
            r#"{"model":"m","messages":[{"role":"user","content":[
                {"type":"text","text":"what is this"},
                {"type":"image_url","image_url":{"url":"https://x/1.png"}}
            ]}]}"#,
        )
        .unwrap();
        assert_eq!(req.messages[0].content.flat_text(), "what is this");
        match &req.messages[0].content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn stop_sequences_drop_non_strings() {
        let req: GeneralRequest = serde_json::from_str(
            r#"{"model":"m","messages":[],"stop":["a", 7, "b", null]}"#,
        )
        .unwrap();
        assert_eq!(req.stop_sequences(), vec!["a".to_string(), "b".to_string()]);

        let req: GeneralRequest =
            serde_json::from_str(r#"{"model":"m","messages":[],"stop":"END"}"#).unwrap();
        assert_eq!(req.stop_sequences(), vec!["END".to_string()]);
    }

    #[test]
    fn null_content_reads_as_empty_text() {
        let req: GeneralRequest = serde_json::from_str(
            r#"{"model":"m","messages":[{"role":"assistant","content":null,
                "tool_calls":[{"id":"c1","type":"function",
                "function":{"name":"f","arguments":"{}"}}]}]}"#,
        )
        .unwrap();
        assert_eq!(req.messages[0].content.flat_text(), "");
        assert_eq!(req.messages[0].tool_calls.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn tool_choice_forms() {
        let auto: ToolChoice = serde_json::from_str(r#""auto""#).unwrap();
        assert_eq!(auto, ToolChoice::Auto);
        let any: ToolChoice = serde_json::from_str(r#""required""#).unwrap();
        assert_eq!(any, ToolChoice::Any);
        let named: ToolChoice =
            serde_json::from_str(r#"{"type":"function","function":{"name":"get_weather"}}"#)
                .unwrap();
        assert_eq!(named, ToolChoice::Function("get_weather".to_string()));
    }

    #[test]
    fn completion_budget_precedence() {
        let mut req: GeneralRequest =
            serde_json::from_str(r#"{"model":"m","messages":[]}"#).unwrap();
        assert_eq!(req.completion_budget(2048), 2048);
        req.max_tokens = Some(1000);
        assert_eq!(req.completion_budget(2048), 1000);
        req.max_completion_tokens = Some(500);
        assert_eq!(req.completion_budget(2048), 500);
    }

    #[test]
    fn omitted_fields_stay_off_the_wire() {
        let req: GeneralRequest = serde_json::from_str(
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        let wire = serde_json::to_value(&req).unwrap();
        assert!(wire.get("temperature").is_none());
        assert!(wire.get("max_tokens").is_none());
        assert!(wire.get("tools").is_none());
    }

    #[test]
    fn estimate_tracks_length() {
        assert_eq!(estimate_tokens(""), 0);
        let long = "x".repeat(350);
        assert_eq!(estimate_tokens(&long), 100);
    }
}
