//! Anthropic Messages adapter.
//!
//! Bridges the OpenAI shape to the Messages API: system messages fold into
//! the `system` string, assistant tool calls become `tool_use` blocks, tool
//! results become `tool_result` blocks on a user turn, and streaming events
//! are re-encoded as OpenAI-shaped deltas for the client.

use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::store::ProviderInstance;
use crate::types::{AssistantMessage, ChatRequest, ChatResponse, Choice, Role, Usage};

use super::{
    ChatOutcome, ChatProvider, ProviderError, StreamSender, dummy_chat, estimate_tokens,
    http_client, json_string, sse,
};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    instance: ProviderInstance,
    enable_real: bool,
    http: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(instance: ProviderInstance, enable_real: bool) -> Self {
        Self {
            instance,
            enable_real,
            http: http_client(),
        }
    }

    fn messages_url(&self) -> String {
        match self.instance.base_url.as_deref().filter(|b| !b.is_empty()) {
            Some(base) => format!("{}/v1/messages", base.trim_end_matches('/')),
            None => MESSAGES_URL.to_string(),
        }
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.instance
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                ProviderError::Config(format!(
                    "no API key configured for provider {} (anthropic)",
                    self.instance.name
                ))
            })
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    #[serde(default)]
    id: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiTool {
    function: OpenAiToolDef,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolDef {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Value,
}

fn build_messages_body(request: &ChatRequest, stream: bool) -> Value {
    let mut system = String::new();
    let mut messages = Vec::<Value>::new();

    for message in &request.messages {
        match message.role {
            Role::System => {
                system.push_str(&message.content_text());
                system.push('\n');
            }
            Role::Tool => {
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                        "content": message.content_text(),
                    }],
                }));
            }
            Role::Assistant if message.tool_calls().is_some() => {
                let calls: Vec<OpenAiToolCall> = message
                    .tool_calls()
                    .cloned()
                    .and_then(|value| serde_json::from_value(value).ok())
                    .unwrap_or_default();
                if calls.is_empty() {
                    messages.push(json!({
                        "role": "assistant",
                        "content": message.content_text(),
                    }));
                    continue;
                }
                let mut blocks = Vec::<Value>::new();
                let text = message.content_text();
                if !text.is_empty() {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                for call in calls {
                    // Arguments arrive as a JSON string; Anthropic wants the
                    // parsed object.
                    let input: Value =
                        serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.function.name,
                        "input": input,
                    }));
                }
                messages.push(json!({"role": "assistant", "content": blocks}));
            }
            _ => {
                messages.push(json!({
                    "role": message.role.as_str(),
                    "content": message.content_text(),
                }));
            }
        }
    }

    let max_tokens = request
        .max_completion_tokens
        .or(request.max_tokens)
        .unwrap_or(DEFAULT_MAX_TOKENS);

    let mut body = Map::<String, Value>::new();
    body.insert("model".to_string(), Value::String(request.model.clone()));
    body.insert("messages".to_string(), Value::Array(messages));
    body.insert("max_tokens".to_string(), json!(max_tokens));
    if !system.trim().is_empty() {
        body.insert(
            "system".to_string(),
            Value::String(system.trim().to_string()),
        );
    }
    if stream {
        body.insert("stream".to_string(), Value::Bool(true));
    }
    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(stop) = request.stop.as_ref().filter(|value| !value.is_null()) {
        body.insert("stop_sequences".to_string(), stop.clone());
    }

    if let Some(tools) = request.tools.as_ref().filter(|value| !value.is_null()) {
        if let Ok(tools) = serde_json::from_value::<Vec<OpenAiTool>>(tools.clone()) {
            let mapped: Vec<Value> = tools
                .into_iter()
                .map(|tool| {
                    let mut out = Map::<String, Value>::new();
                    out.insert("name".to_string(), Value::String(tool.function.name));
                    if let Some(description) = tool.function.description {
                        out.insert("description".to_string(), Value::String(description));
                    }
                    out.insert("input_schema".to_string(), tool.function.parameters);
                    Value::Object(out)
                })
                .collect();
            body.insert("tools".to_string(), Value::Array(mapped));
        }
    }

    if let Some(choice) = request.tool_choice.as_ref().filter(|value| !value.is_null()) {
        match choice {
            Value::String(mode) => match mode.as_str() {
                "auto" => {
                    body.insert("tool_choice".to_string(), json!({"type": "auto"}));
                }
                "required" => {
                    body.insert("tool_choice".to_string(), json!({"type": "any"}));
                }
                "none" => {
                    // tool_choice "none" means don't offer tools at all.
                    body.remove("tools");
                }
                _ => {}
            },
            Value::Object(obj) => {
                if let Some(name) = obj
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                {
                    body.insert(
                        "tool_choice".to_string(),
                        json!({"type": "tool", "name": name}),
                    );
                }
            }
            _ => {}
        }
    }

    Value::Object(body)
}

#[derive(Debug, Deserialize)]
struct MessagesContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Deserialize, Default)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<MessagesContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: MessagesUsage,
}

fn response_from_messages(parsed: MessagesResponse, model: &str) -> ChatResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::<Value>::new();
    for block in &parsed.content {
        match block.kind.as_str() {
            "text" => text.push_str(&block.text),
            "tool_use" => {
                let arguments = block.input.to_string();
                tool_calls.push(json!({
                    "id": block.id,
                    "type": "function",
                    "function": {"name": block.name, "arguments": arguments},
                }));
            }
            _ => {}
        }
    }

    let finish_reason = if parsed.stop_reason.as_deref() == Some("tool_use") {
        "tool_calls"
    } else {
        "stop"
    };
    let message = AssistantMessage {
        role: "assistant".to_string(),
        content: (!text.is_empty()).then_some(text),
        tool_calls: (!tool_calls.is_empty()).then(|| Value::Array(tool_calls)),
    };

    ChatResponse {
        id: parsed.id,
        object: "chat.completion".to_string(),
        created: crate::util::now_epoch_secs() as i64,
        model: if parsed.model.is_empty() {
            model.to_string()
        } else {
            parsed.model
        },
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: finish_reason.to_string(),
        }],
        usage: Usage {
            prompt_tokens: parsed.usage.input_tokens,
            completion_tokens: parsed.usage.output_tokens,
            total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
        },
    }
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    usage: MessagesUsage,
}

async fn handle_anthropic_stream(
    response: reqwest::Response,
    model: &str,
    sender: &StreamSender,
    start: Instant,
) -> Result<ChatOutcome, ProviderError> {
    let status = response.status();
    if status.as_u16() >= 300 {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::UpstreamStatus {
            status: status.as_u16(),
            body,
        });
    }

    let mut lines = sse::data_lines(response);
    let mut full_text = String::new();
    let mut total_tokens = 0u32;
    let mut ttft = None;

    while let Some(item) = lines.next().await {
        let data = item?;
        let Ok(event) = serde_json::from_str::<StreamEvent>(&data) else {
            continue;
        };
        match event.kind.as_str() {
            "content_block_delta" => {
                if event.delta.text.is_empty() {
                    continue;
                }
                if ttft.is_none() {
                    ttft = Some(start.elapsed());
                }
                full_text.push_str(&event.delta.text);
                let chunk = format!(
                    "{{\"choices\":[{{\"delta\":{{\"content\":{}}}}}]}}",
                    json_string(&event.delta.text)
                );
                sender.send(&chunk)?;
            }
            "message_delta" => {
                if event.usage.output_tokens > 0 {
                    total_tokens = event.usage.input_tokens + event.usage.output_tokens;
                }
            }
            "message_stop" => {
                sender.send("[DONE]")?;
                break;
            }
            _ => {}
        }
    }

    if total_tokens == 0 {
        total_tokens = estimate_tokens(&full_text);
    }

    let response = ChatResponse {
        id: format!("anthropic_{}", crate::util::now_epoch_nanos()),
        object: "chat.completion".to_string(),
        created: crate::util::now_epoch_secs() as i64,
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage::text(full_text),
            finish_reason: "stop".to_string(),
        }],
        usage: Usage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens,
        },
    };
    Ok(ChatOutcome {
        tokens: total_tokens,
        ttft: ttft.unwrap_or_else(|| start.elapsed()),
        response,
    })
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.instance.name
    }

    fn supports_text(&self) -> bool {
        self.instance.supports_text
    }

    fn supports_vision(&self) -> bool {
        self.instance.supports_vision
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        stream: bool,
        sender: Option<&StreamSender>,
    ) -> Result<ChatOutcome, ProviderError> {
        if !self.enable_real {
            return dummy_chat(&self.instance.name, request, stream, sender).await;
        }
        let api_key = self.api_key()?;
        let body = build_messages_body(request, stream);

        let start = Instant::now();
        let response = self
            .http
            .post(self.messages_url())
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        if let (true, Some(sender)) = (stream, sender) {
            return handle_anthropic_stream(response, &request.model, sender, start).await;
        }

        let status = response.status();
        if status.as_u16() >= 300 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;
        let out = response_from_messages(parsed, &request.model);
        let tokens = out.usage.total_tokens;
        Ok(ChatOutcome {
            response: out,
            ttft: start.elapsed(),
            tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, MessageContent};

    fn tool_request() -> ChatRequest {
        serde_json::from_value(serde_json::json!({
            "model": "claude-3-5-sonnet",
            "messages": [
                {"role": "system", "content": "you are terse"},
                {"role": "user", "content": "weather in SF?"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "get_weather", "arguments": "{\"city\":\"SF\"}"}}
                ]},
                {"role": "tool", "content": "sunny, 21C", "tool_call_id": "call_1"}
            ],
            "tools": [
                {"type": "function", "function": {
                    "name": "get_weather",
                    "description": "Look up weather",
                    "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
                }}
            ],
            "tool_choice": "auto"
        }))
        .unwrap()
    }

    #[test]
    fn system_messages_fold_into_system_string() {
        let body = build_messages_body(&tool_request(), false);
        assert_eq!(body["system"], serde_json::json!("you are terse"));
        // System turns never appear in the messages array.
        let roles: Vec<&str> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
    }

    #[test]
    fn assistant_tool_calls_become_tool_use_blocks() {
        let body = build_messages_body(&tool_request(), false);
        let assistant = &body["messages"][1];
        let block = &assistant["content"][0];
        assert_eq!(block["type"], serde_json::json!("tool_use"));
        assert_eq!(block["id"], serde_json::json!("call_1"));
        assert_eq!(block["name"], serde_json::json!("get_weather"));
        // Arguments are parsed from the JSON string into an object.
        assert_eq!(block["input"], serde_json::json!({"city": "SF"}));
    }

    #[test]
    fn tool_role_becomes_user_tool_result() {
        let body = build_messages_body(&tool_request(), false);
        let result = &body["messages"][2];
        assert_eq!(result["role"], serde_json::json!("user"));
        let block = &result["content"][0];
        assert_eq!(block["type"], serde_json::json!("tool_result"));
        assert_eq!(block["tool_use_id"], serde_json::json!("call_1"));
        assert_eq!(block["content"], serde_json::json!("sunny, 21C"));
    }

    #[test]
    fn tools_are_renamed_to_input_schema() {
        let body = build_messages_body(&tool_request(), false);
        let tool = &body["tools"][0];
        assert_eq!(tool["name"], serde_json::json!("get_weather"));
        assert!(tool["input_schema"].is_object());
        assert!(tool.get("parameters").is_none());
        assert_eq!(body["tool_choice"], serde_json::json!({"type": "auto"}));
    }

    #[test]
    fn tool_choice_variants_map_per_contract() {
        let mut request = tool_request();
        request.tool_choice = Some(serde_json::json!("required"));
        let body = build_messages_body(&request, false);
        assert_eq!(body["tool_choice"], serde_json::json!({"type": "any"}));

        request.tool_choice = Some(serde_json::json!({"function": {"name": "get_weather"}}));
        let body = build_messages_body(&request, false);
        assert_eq!(
            body["tool_choice"],
            serde_json::json!({"type": "tool", "name": "get_weather"})
        );

        request.tool_choice = Some(serde_json::json!("none"));
        let body = build_messages_body(&request, false);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn max_tokens_defaults_to_4096() {
        let request = ChatRequest {
            model: "claude-3-5-haiku".to_string(),
            messages: vec![ChatMessage::user("hi")],
            ..ChatRequest::default()
        };
        let body = build_messages_body(&request, true);
        assert_eq!(body["max_tokens"], serde_json::json!(4096));
        assert_eq!(body["stream"], serde_json::json!(true));
    }

    #[test]
    fn part_content_flattens_to_text() {
        let request = ChatRequest {
            model: "claude-3-5-sonnet".to_string(),
            messages: vec![ChatMessage {
                role: Role::User,
                content: Some(MessageContent::Parts(vec![
                    crate::types::ContentPart::text("first "),
                    crate::types::ContentPart::text("second"),
                ])),
                tool_call_id: None,
                tool_calls: None,
            }],
            ..ChatRequest::default()
        };
        let body = build_messages_body(&request, false);
        assert_eq!(
            body["messages"][0]["content"],
            serde_json::json!("first second")
        );
    }

    #[test]
    fn tool_use_response_round_trips_to_openai_shape() {
        let parsed: MessagesResponse = serde_json::from_value(serde_json::json!({
            "id": "msg_1",
            "model": "claude-3-5-sonnet",
            "content": [
                {"type": "text", "text": "Checking."},
                {"type": "tool_use", "id": "call_1", "name": "get_weather",
                 "input": {"city": "SF"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 8}
        }))
        .unwrap();
        let response = response_from_messages(parsed, "claude-3-5-sonnet");
        assert_eq!(response.choices[0].finish_reason, "tool_calls");
        assert_eq!(response.usage.total_tokens, 20);

        let calls = response.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0]["id"], serde_json::json!("call_1"));
        assert_eq!(calls[0]["function"]["name"], serde_json::json!("get_weather"));
        // Arguments re-parse to the same object the caller sent.
        let arguments: Value =
            serde_json::from_str(calls[0]["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(arguments, serde_json::json!({"city": "SF"}));
    }
}
