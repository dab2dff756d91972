//! Gemini generateContent adapter.
//!
//! Role mapping is lossy by design: `assistant` becomes `model`, everything
//! else becomes `user`, and the first text part of a system message gets a
//! `System: ` prefix. Image URLs are flattened into `[image] <url>` text
//! parts; a faithful implementation would send `inline_data`/`file_data`
//! parts instead, so treat the flattening as provisional.

use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::store::ProviderInstance;
use crate::types::{AssistantMessage, ChatMessage, ChatRequest, ChatResponse, Choice, Role, Usage};

use super::{
    ChatOutcome, ChatProvider, ProviderError, StreamSender, dummy_chat, estimate_tokens,
    http_client, json_string, sse,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    instance: ProviderInstance,
    enable_real: bool,
    http: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(instance: ProviderInstance, enable_real: bool) -> Self {
        Self {
            instance,
            enable_real,
            http: http_client(),
        }
    }

    fn base_url(&self) -> String {
        self.instance
            .base_url
            .as_deref()
            .filter(|base| !base.is_empty())
            .map(|base| base.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.instance
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                ProviderError::Config(format!(
                    "no API key configured for provider {} (gemini)",
                    self.instance.name
                ))
            })
    }

    async fn send_generate(
        &self,
        model: &str,
        method: &str,
        payload: &Value,
        api_key: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        // The streaming method already carries `?alt=sse`.
        let separator = if method.contains('?') { '&' } else { '?' };
        let url = format!(
            "{}/v1beta/models/{model}:{method}{separator}key={api_key}",
            self.base_url()
        );
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(payload)
            .send()
            .await?;
        Ok(response)
    }
}

pub(crate) fn to_gemini_contents(messages: &[ChatMessage]) -> Vec<Value> {
    let mut contents = Vec::with_capacity(messages.len());
    for message in messages {
        let role = match message.role {
            Role::Assistant => "model",
            _ => "user",
        };

        let mut parts = Vec::<Value>::new();
        let mut system_prefixed = false;
        for part in message
            .content
            .as_ref()
            .map(|content| content.as_parts())
            .unwrap_or_default()
        {
            if part.kind.is_empty() || part.kind == "text" {
                let mut text = part.text.unwrap_or_default();
                if message.role == Role::System && !system_prefixed && !text.is_empty() {
                    text = format!("System: {text}");
                    system_prefixed = true;
                }
                parts.push(json!({"text": text}));
            } else if part.kind == "image_url" {
                if let Some(url) = part.image_url.as_ref().map(|image| image.url()) {
                    if !url.is_empty() {
                        parts.push(json!({"text": format!("[image] {url}")}));
                    }
                }
            }
        }
        if parts.is_empty() {
            parts.push(json!({"text": ""}));
        }
        contents.push(json!({"role": role, "parts": parts}));
    }
    contents
}

pub(crate) fn build_generate_payload(request: &ChatRequest) -> Value {
    let mut payload = Map::<String, Value>::new();
    payload.insert(
        "contents".to_string(),
        Value::Array(to_gemini_contents(&request.messages)),
    );

    let mut generation = Map::<String, Value>::new();
    if let Some(max_tokens) = request.max_completion_tokens.or(request.max_tokens) {
        generation.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        generation.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        generation.insert("topP".to_string(), json!(top_p));
    }
    if let Some(stop) = request.stop.as_ref().filter(|value| !value.is_null()) {
        generation.insert("stopSequences".to_string(), stop.clone());
    }
    if !generation.is_empty() {
        payload.insert("generationConfig".to_string(), Value::Object(generation));
    }

    Value::Object(payload)
}

#[derive(Debug, Deserialize, Default)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize, Default)]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiContent,
}

#[derive(Debug, Deserialize, Default)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_tokens: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_tokens: u32,
    #[serde(rename = "totalTokenCount", default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize, Default)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: GeminiUsage,
}

fn synthetic_response(id_prefix: &str, model: &str, text: String, usage: Usage) -> ChatResponse {
    ChatResponse {
        id: format!("{id_prefix}_{}", crate::util::now_epoch_nanos()),
        object: "chat.completion".to_string(),
        created: crate::util::now_epoch_secs() as i64,
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage::text(text),
            finish_reason: "stop".to_string(),
        }],
        usage,
    }
}

async fn handle_gemini_stream(
    response: reqwest::Response,
    model: &str,
    sender: &StreamSender,
    start: Instant,
) -> Result<ChatOutcome, ProviderError> {
    let mut lines = sse::data_lines(response);
    let mut full_text = String::new();
    let mut total_tokens = 0u32;
    let mut ttft = None;

    while let Some(item) = lines.next().await {
        let data = item?;
        let Ok(parsed) = serde_json::from_str::<GeminiResponse>(&data) else {
            continue;
        };
        for candidate in &parsed.candidates {
            for part in &candidate.content.parts {
                if part.text.is_empty() {
                    continue;
                }
                if ttft.is_none() {
                    ttft = Some(start.elapsed());
                }
                full_text.push_str(&part.text);
                let chunk = format!(
                    "{{\"choices\":[{{\"delta\":{{\"content\":{}}}}}]}}",
                    json_string(&part.text)
                );
                sender.send(&chunk)?;
            }
        }
        if parsed.usage_metadata.total_tokens > 0 {
            total_tokens = parsed.usage_metadata.total_tokens;
        }
    }

    sender.send("[DONE]")?;

    if total_tokens == 0 {
        total_tokens = estimate_tokens(&full_text);
    }

    let usage = Usage {
        prompt_tokens: 0,
        completion_tokens: 0,
        total_tokens,
    };
    Ok(ChatOutcome {
        tokens: total_tokens,
        ttft: ttft.unwrap_or_else(|| start.elapsed()),
        response: synthetic_response("gemini", model, full_text, usage),
    })
}

#[async_trait]
impl ChatProvider for GeminiProvider {
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
        let payload = build_generate_payload(request);
        let method = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };

        let start = Instant::now();
        let mut response = self
            .send_generate(&request.model, method, &payload, api_key)
            .await?;

        if response.status().as_u16() >= 300 {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            // Model ids frequently need the -latest suffix; retry once
            // before giving up.
            if body.contains("not found") && !request.model.ends_with("-latest") {
                let retry_model = format!("{}-latest", request.model);
                let retried = self
                    .send_generate(&retry_model, method, &payload, api_key)
                    .await?;
                if retried.status().as_u16() >= 300 {
                    let status = retried.status().as_u16();
                    let body = retried.text().await.unwrap_or_default();
                    return Err(ProviderError::UpstreamStatus { status, body });
                }
                response = retried;
            } else {
                return Err(ProviderError::UpstreamStatus { status, body });
            }
        }

        if let (true, Some(sender)) = (stream, sender) {
            return handle_gemini_stream(response, &request.model, sender, start).await;
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;

        let mut text = String::new();
        if let Some(candidate) = parsed.candidates.first() {
            for part in &candidate.content.parts {
                if part.text.is_empty() {
                    continue;
                }
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&part.text);
            }
        }
        if text.is_empty() {
            text = "(empty gemini response)".to_string();
        }

        let mut usage = Usage {
            prompt_tokens: parsed.usage_metadata.prompt_tokens,
            completion_tokens: parsed.usage_metadata.candidates_tokens,
            total_tokens: parsed.usage_metadata.total_tokens,
        };
        if usage.total_tokens == 0 {
            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        }
        if usage.total_tokens == 0 {
            usage.total_tokens = estimate_tokens(&text);
        }

        let tokens = usage.total_tokens;
        Ok(ChatOutcome {
            response: synthetic_response("gemini", &request.model, text, usage),
            ttft: start.elapsed(),
            tokens,
        })
    }
}
