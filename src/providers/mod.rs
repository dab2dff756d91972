//! Provider adapters: canonical request in, canonical response out.
//!
//! Each adapter owns the wire translation for one upstream family and the
//! streaming forward path. In dummy mode (the operational default) every
//! adapter answers with a deterministic canned response so the pipeline can
//! be smoke-tested without upstream keys.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::{ProviderFamily, ProviderInstance};
use crate::types::{AssistantMessage, ChatRequest, ChatResponse, Choice, Usage};

mod anthropic;
mod gemini;
mod openai;
pub mod sse;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiCompatibleProvider;

pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
    #[error("failed to decode upstream response: {0}")]
    Decode(String),
    #[error("{0}")]
    Config(String),
    #[error("client cancelled")]
    ClientCancelled,
}

impl ProviderError {
    /// Whether the candidate planner should advance to the next provider.
    /// 4xx answers are terminal: the next candidate would likely fail the
    /// same way. A cancelled client never triggers a fallback.
    pub fn retriable(&self) -> bool {
        match self {
            ProviderError::Transport(_)
            | ProviderError::Decode(_)
            | ProviderError::Config(_) => true,
            ProviderError::UpstreamStatus { status, .. } => *status >= 500,
            ProviderError::ClientCancelled => false,
        }
    }

    /// Error category recorded in the request log.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Transport(_) => "transport_error",
            ProviderError::UpstreamStatus { status, .. } if *status < 500 => {
                "upstream_client_error"
            }
            ProviderError::UpstreamStatus { .. } => "upstream_server_error",
            ProviderError::Decode(_) => "decode_error",
            ProviderError::Config(_) => "provider_config",
            ProviderError::ClientCancelled => "client_cancelled",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transport(err.to_string())
    }
}

/// Client-side SSE sink handed to adapters. `send` frames one event as
/// `data: <event>\n\n`; a failed send means the client is gone, which the
/// adapter surfaces as [`ProviderError::ClientCancelled`] to abort the
/// upstream read.
#[derive(Clone)]
pub struct StreamSender {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl StreamSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: &str) -> Result<(), ProviderError> {
        let frame = Bytes::from(format!("data: {event}\n\n"));
        self.tx
            .send(frame)
            .map_err(|_| ProviderError::ClientCancelled)
    }
}

#[derive(Debug)]
pub struct ChatOutcome {
    pub response: ChatResponse,
    pub ttft: Duration,
    pub tokens: u32,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    fn supports_text(&self) -> bool;
    fn supports_vision(&self) -> bool;

    /// Issues one chat completion. With `stream` set and a sender present,
    /// forwards upstream chunks to the sender and still returns a complete
    /// synthetic response for accounting.
    async fn chat(
        &self,
        request: &ChatRequest,
        stream: bool,
        sender: Option<&StreamSender>,
    ) -> Result<ChatOutcome, ProviderError>;
}

/// Instantiates the adapter for a provider instance. DeepSeek and Mistral
/// speak the OpenAI wire format and only differ in their default base URL.
pub fn provider_for(
    instance: &ProviderInstance,
    enable_real: bool,
    api_key_override: Option<&str>,
) -> Box<dyn ChatProvider> {
    let mut instance = instance.clone();
    if let Some(key) = api_key_override {
        instance.api_key = Some(key.to_string());
    }
    match instance.family {
        ProviderFamily::Anthropic => Box::new(AnthropicProvider::new(instance, enable_real)),
        ProviderFamily::Gemini => Box::new(GeminiProvider::new(instance, enable_real)),
        ProviderFamily::OpenAi
        | ProviderFamily::DeepSeek
        | ProviderFamily::Mistral
        | ProviderFamily::GenericOpenAi => {
            Box::new(OpenAiCompatibleProvider::new(instance, enable_real))
        }
    }
}

pub(crate) fn json_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Token estimate when the upstream reports no usage.
pub(crate) fn estimate_tokens(text: &str) -> u32 {
    ((text.chars().count() / 4).max(1)) as u32
}

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

const DUMMY_STREAM_CHUNKS: [&str; 3] =
    ["This is a dummy ", "streamed response ", "from RouterX."];

/// Deterministic canned exchange used when real calls are disabled.
pub(crate) async fn dummy_chat(
    provider_name: &str,
    request: &ChatRequest,
    stream: bool,
    sender: Option<&StreamSender>,
) -> Result<ChatOutcome, ProviderError> {
    let start = Instant::now();
    let content = format!(
        "Dummy response from {provider_name}. Model={}. Messages={}.",
        request.model,
        request.messages.len()
    );
    let response = ChatResponse {
        id: format!("dummy_{}", crate::util::now_epoch_nanos()),
        object: "chat.completion".to_string(),
        created: crate::util::now_epoch_secs() as i64,
        model: request.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage::text(content),
            finish_reason: "stop".to_string(),
        }],
        usage: Usage {
            prompt_tokens: 10,
            completion_tokens: 15,
            total_tokens: 25,
        },
    };

    if stream {
        if let Some(sender) = sender {
            for chunk in DUMMY_STREAM_CHUNKS {
                let data = format!(
                    "{{\"choices\":[{{\"delta\":{{\"content\":{}}}}}]}}",
                    json_string(chunk)
                );
                sender.send(&data)?;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            sender.send("[DONE]")?;
        }
    }

    Ok(ChatOutcome {
        tokens: response.usage.total_tokens,
        ttft: start.elapsed(),
        response,
    })
}
