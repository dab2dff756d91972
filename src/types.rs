//! Canonical OpenAI-shaped chat types.
//!
//! The request model is deliberately lossless: message content keeps its
//! wire form (bare string or part list), and fields the gateway never
//! interprets (tools, tool_choice, stop, response_format) ride through as raw
//! JSON values so an OpenAI-family upstream sees exactly what the caller sent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
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

/// Coarse request classifier derived from message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    Vision,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Text => "text",
            Capability::Vision => "vision",
        }
    }
}

/// An image reference inside a content part. Callers send either a bare URL
/// string or the OpenAI object form `{"url": "..."}`; both round-trip as sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageRef {
    Url(String),
    Object { url: String },
}

impl ImageRef {
    pub fn url(&self) -> &str {
        match self {
            ImageRef::Url(url) => url,
            ImageRef::Object { url } => url,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<ImageRef>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            image_url: None,
        }
    }

    pub fn is_image(&self) -> bool {
        self.kind == "image_url"
            && self
                .image_url
                .as_ref()
                .is_some_and(|image| !image.url().is_empty())
    }
}

/// Message content: a bare string or an ordered list of typed parts.
/// The variant is preserved through the pipeline; adapters that need a flat
/// string use [`MessageContent::text`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of the content, ignoring non-text parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => {
                let mut out = String::new();
                for part in parts {
                    if let Some(text) = part.text.as_deref() {
                        out.push_str(text);
                    }
                }
                out
            }
        }
    }

    pub fn has_image(&self) -> bool {
        match self {
            MessageContent::Text(_) => false,
            MessageContent::Parts(parts) => parts.iter().any(ContentPart::is_image),
        }
    }

    /// Part-list view; a bare string becomes a single text part.
    pub fn as_parts(&self) -> Vec<ContentPart> {
        match self {
            MessageContent::Text(text) => vec![ContentPart::text(text.clone())],
            MessageContent::Parts(parts) => parts.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(MessageContent::Text(text.into())),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn content_text(&self) -> String {
        self.content
            .as_ref()
            .map(MessageContent::text)
            .unwrap_or_default()
    }

    /// Assistant tool calls, with JSON `null` treated as absent.
    pub fn tool_calls(&self) -> Option<&Value> {
        self.tool_calls.as_ref().filter(|value| !value.is_null())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ChatRequest {
    /// `vision` when any message carries an image part with a non-empty URL.
    pub fn capability(&self) -> Capability {
        let has_image = self
            .messages
            .iter()
            .any(|message| message.content.as_ref().is_some_and(MessageContent::has_image));
        if has_image {
            Capability::Vision
        } else {
            Capability::Text
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
}

impl AssistantMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_content_round_trips() {
        let raw = r#"{"role":"user","content":"hello  world"}"#;
        let message: ChatMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            message.content,
            Some(MessageContent::Text(ref text)) if text == "hello  world"
        ));
        let back = serde_json::to_string(&message).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn part_content_round_trips_and_detects_vision() {
        let raw = r#"{"role":"user","content":[{"type":"text","text":"look"},{"type":"image_url","image_url":"https://x/cat.jpg"}]}"#;
        let message: ChatMessage = serde_json::from_str(raw).unwrap();
        let content = message.content.as_ref().unwrap();
        assert!(content.has_image());
        assert_eq!(content.text(), "look");
        assert_eq!(serde_json::to_string(&message).unwrap(), raw);
    }

    #[test]
    fn object_form_image_url_is_accepted() {
        let raw = r#"{"type":"image_url","image_url":{"url":"https://x/dog.jpg"}}"#;
        let part: ContentPart = serde_json::from_str(raw).unwrap();
        assert!(part.is_image());
        assert_eq!(part.image_url.as_ref().unwrap().url(), "https://x/dog.jpg");
        assert_eq!(serde_json::to_string(&part).unwrap(), raw);
    }

    #[test]
    fn capability_is_text_without_image_parts() {
        let request = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            ..ChatRequest::default()
        };
        assert_eq!(request.capability(), Capability::Text);
    }

    #[test]
    fn empty_image_url_does_not_flag_vision() {
        let raw = r#"{"model":"m","messages":[{"role":"user","content":[{"type":"image_url","image_url":""}]}]}"#;
        let request: ChatRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.capability(), Capability::Text);
    }

    #[test]
    fn null_tool_calls_are_treated_as_absent() {
        let raw = r#"{"role":"assistant","content":null,"tool_calls":null}"#;
        let message: ChatMessage = serde_json::from_str(raw).unwrap();
        assert!(message.tool_calls().is_none());
    }

    #[test]
    fn unknown_request_fields_are_tolerated() {
        let raw = r#"{"model":"m","messages":[],"parallel_tool_calls":true}"#;
        let request: ChatRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.model, "m");
    }
}
