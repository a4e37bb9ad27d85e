use crate::error::ProviderError;
use crate::models::{PreparedPrompt, ProviderResponse, RawResponse, TokenUsage};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{Provider, ProviderCapabilities, ProviderSettings};
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Adapter for the OpenAI chat completions API and compatible surfaces
/// (Cerebras inference uses the same wire format with a different base).
pub struct OpenAiProvider {
    http: HttpProviderClient,
    settings: ProviderSettings,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

impl OpenAiProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self, ProviderError> {
        Self::with_default_base(settings, "https://api.openai.com/v1")
    }

    pub fn with_default_base(
        settings: ProviderSettings,
        default_base: &str,
    ) -> Result<Self, ProviderError> {
        let http = HttpProviderClient::new(
            settings.timeout,
            settings.base_url.clone(),
            default_base,
            &settings.headers,
            AuthStrategy::Bearer {
                token: settings.api_key.clone(),
            },
        )?;
        let model = settings.resolved_model();
        Ok(Self {
            http,
            settings,
            model,
        })
    }

    fn build_request<'a>(
        &'a self,
        prompt: &'a PreparedPrompt,
        stream: bool,
    ) -> ChatCompletionRequest<'a> {
        let response_format = (prompt.json_mode && self.settings.capabilities.json_mode)
            .then_some(ResponseFormat {
                format_type: "json_object",
            });
        ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: prompt.temperature,
            max_tokens: prompt.max_tokens.min(self.settings.limits.max_tokens),
            response_format,
            stream: stream.then_some(true),
        }
    }
}

fn parse_usage(body: &Value) -> Option<TokenUsage> {
    let usage = body.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: usage.get("completion_tokens")?.as_u64()? as u32,
    })
}

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.settings.capabilities
    }

    async fn invoke(
        &self,
        prompt: &PreparedPrompt,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        if self.settings.capabilities.streaming {
            let assembled = self
                .http
                .post_sse_collect(
                    "/chat/completions",
                    &self.build_request(prompt, true),
                    timeout,
                    |event| {
                        event["choices"][0]["delta"]["content"]
                            .as_str()
                            .map(|s| s.to_string())
                    },
                )
                .await?;
            if assembled.is_empty() {
                return Err(ProviderError::Streaming {
                    message: "stream ended with no content".to_string(),
                });
            }
            Ok(ProviderResponse {
                raw: RawResponse::Text(assembled),
                model: self.model.clone(),
                tokens: None,
            })
        } else {
            let body = self
                .http
                .post_json_value("/chat/completions", &self.build_request(prompt, false), timeout)
                .await?;
            let tokens = parse_usage(&body);
            let model = body
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(&self.model)
                .to_string();
            Ok(ProviderResponse {
                raw: RawResponse::Json(body),
                model,
                tokens,
            })
        }
    }

    async fn probe(&self, timeout: Duration) -> Result<Duration, ProviderError> {
        let start = Instant::now();
        self.http.get_json::<Value>("/models", timeout).await?;
        Ok(start.elapsed())
    }
}
