//! OpenAI-family adapter, also serving DeepSeek, Mistral, and arbitrary
//! OpenAI-compatible endpoints. The canonical request is the wire format, so
//! translation is limited to flipping the stream flags.

use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;

use crate::store::{ProviderFamily, ProviderInstance};
use crate::types::{AssistantMessage, ChatRequest, ChatResponse, Choice, StreamOptions, Usage};

use super::{
    ChatOutcome, ChatProvider, ProviderError, StreamSender, dummy_chat, estimate_tokens,
    http_client, sse,
};

pub struct OpenAiCompatibleProvider {
    instance: ProviderInstance,
    enable_real: bool,
    http: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(instance: ProviderInstance, enable_real: bool) -> Self {
        Self {
            instance,
            enable_real,
            http: http_client(),
        }
    }

    fn chat_url(&self) -> Result<String, ProviderError> {
        let base = match self.instance.base_url.as_deref().filter(|b| !b.is_empty()) {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => match self.instance.family {
                ProviderFamily::OpenAi => "https://api.openai.com".to_string(),
                ProviderFamily::DeepSeek => "https://api.deepseek.com".to_string(),
                ProviderFamily::Mistral => "https://api.mistral.ai".to_string(),
                _ => {
                    return Err(ProviderError::Config(format!(
                        "base_url required for provider {} ({})",
                        self.instance.name,
                        self.instance.family.as_str()
                    )));
                }
            },
        };
        Ok(format!("{base}/v1/chat/completions"))
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.instance
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                ProviderError::Config(format!(
                    "no API key configured for provider {} ({})",
                    self.instance.name,
                    self.instance.family.as_str()
                ))
            })
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleProvider {
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
        let url = self.chat_url()?;

        // The canonical request is forwarded whole; every OpenAI-compatible
        // field rides through untouched.
        let mut body = request.clone();
        body.stream = stream;
        body.stream_options = stream.then_some(StreamOptions {
            include_usage: true,
        });

        let start = Instant::now();
        let response = self
            .http
            .post(url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        match (stream, sender) {
            (true, Some(sender)) => {
                handle_openai_stream(response, &request.model, sender, start).await
            }
            _ => {
                let response = parse_openai_response(response, &request.model).await?;
                let tokens = response.usage.total_tokens;
                Ok(ChatOutcome {
                    response,
                    ttft: start.elapsed(),
                    tokens,
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    tool_calls: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawChoice {
    #[serde(default)]
    index: u32,
    message: RawMessage,
    #[serde(default)]
    finish_reason: String,
}

#[derive(Debug, Deserialize)]
struct RawChatResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    object: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<RawChoice>,
    #[serde(default)]
    usage: Usage,
}

pub(crate) async fn parse_openai_response(
    response: reqwest::Response,
    model: &str,
) -> Result<ChatResponse, ProviderError> {
    let status = response.status();
    if status.as_u16() >= 300 {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::UpstreamStatus {
            status: status.as_u16(),
            body,
        });
    }

    let raw: RawChatResponse = response
        .json()
        .await
        .map_err(|err| ProviderError::Decode(err.to_string()))?;

    let mut out = ChatResponse {
        id: raw.id,
        object: if raw.object.is_empty() {
            "chat.completion".to_string()
        } else {
            raw.object
        },
        created: raw.created,
        model: if raw.model.is_empty() {
            model.to_string()
        } else {
            raw.model
        },
        choices: Vec::with_capacity(raw.choices.len()),
        usage: raw.usage,
    };
    for choice in raw.choices {
        // Content is a string for text answers and null alongside tool calls.
        let content = match choice.message.content {
            Value::String(text) => Some(text),
            _ => None,
        };
        let role = if choice.message.role.is_empty() {
            "assistant".to_string()
        } else {
            choice.message.role
        };
        out.choices.push(Choice {
            index: choice.index,
            message: AssistantMessage {
                role,
                content,
                tool_calls: choice.message.tool_calls.filter(|value| !value.is_null()),
            },
            finish_reason: choice.finish_reason,
        });
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

/// Forwards every upstream chunk verbatim, accumulating the full text and
/// usage for the synthetic response the accountant needs.
pub(crate) async fn handle_openai_stream(
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
    let mut response_id = String::new();
    let mut ttft = None;

    while let Some(item) = lines.next().await {
        let data = item?;
        if data == "[DONE]" {
            sender.send("[DONE]")?;
            break;
        }
        sender.send(&data)?;

        let Ok(chunk) = serde_json::from_str::<StreamChunk>(&data) else {
            continue;
        };
        if !chunk.id.is_empty() {
            response_id = chunk.id;
        }
        for choice in chunk.choices {
            let Some(content) = choice.delta.and_then(|delta| delta.content) else {
                continue;
            };
            if content.is_empty() {
                continue;
            }
            if ttft.is_none() {
                ttft = Some(start.elapsed());
            }
            full_text.push_str(&content);
        }
        if let Some(usage) = chunk.usage {
            if usage.total_tokens > 0 {
                total_tokens = usage.total_tokens;
            }
        }
    }

    if total_tokens == 0 {
        total_tokens = estimate_tokens(&full_text);
    }

    let response = ChatResponse {
        id: response_id,
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
