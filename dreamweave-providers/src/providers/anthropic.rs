use crate::error::ProviderError;
use crate::models::{PreparedPrompt, ProviderResponse, RawResponse, TokenUsage};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{Provider, ProviderCapabilities, ProviderSettings};
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Adapter for the Anthropic messages API.
pub struct AnthropicProvider {
    http: HttpProviderClient,
    settings: ProviderSettings,
    model: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl AnthropicProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self, ProviderError> {
        let mut headers = settings.headers.clone();
        headers
            .entry("anthropic-version".to_string())
            .or_insert_with(|| "2023-06-01".to_string());
        let http = HttpProviderClient::new(
            settings.timeout,
            settings.base_url.clone(),
            "https://api.anthropic.com",
            &headers,
            AuthStrategy::Header {
                name: "x-api-key".to_string(),
                value: settings.api_key.clone(),
            },
        )?;
        let model = settings.resolved_model();
        Ok(Self {
            http,
            settings,
            model,
        })
    }

    fn build_request<'a>(&'a self, prompt: &'a PreparedPrompt) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.model,
            max_tokens: prompt.max_tokens.min(self.settings.limits.max_tokens),
            system: &prompt.system,
            messages: vec![AnthropicMessage {
                role: "user",
                content: &prompt.user,
            }],
            temperature: prompt.temperature,
        }
    }
}

fn parse_usage(body: &Value) -> Option<TokenUsage> {
    let usage = body.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage.get("input_tokens")?.as_u64()? as u32,
        completion_tokens: usage.get("output_tokens")?.as_u64()? as u32,
    })
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
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
        let body = self
            .http
            .post_json_value("/v1/messages", &self.build_request(prompt), timeout)
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

    // No cheap GET surface exists, so the probe is a one-token message.
    async fn probe(&self, timeout: Duration) -> Result<Duration, ProviderError> {
        let probe_prompt = PreparedPrompt {
            system: "Reply with the single word: ok".to_string(),
            user: "ping".to_string(),
            temperature: 0.0,
            max_tokens: 1,
            json_mode: false,
        };
        let mut request = self.build_request(&probe_prompt);
        request.max_tokens = 1;
        let start = Instant::now();
        self.http
            .post_json_value("/v1/messages", &request, timeout)
            .await?;
        Ok(start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn prompt() -> PreparedPrompt {
        PreparedPrompt {
            system: "You render dreams as JSON.".to_string(),
            user: "a lighthouse in fog".to_string(),
            temperature: 0.6,
            max_tokens: 1024,
            json_mode: true,
        }
    }

    #[tokio::test]
    async fn invoke_sends_api_key_header_and_parses_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "claude-3-5-haiku",
                "content": [{"type": "text", "text": "{\"title\":\"Fog\"}"}],
                "usage": {"input_tokens": 12, "output_tokens": 30}
            })))
            .mount(&server)
            .await;

        let settings =
            ProviderSettings::new("anthropic", "test-key").with_base_url(server.uri());
        let provider = AnthropicProvider::new(settings).expect("provider");
        let response = provider
            .invoke(&prompt(), Duration::from_secs(2))
            .await
            .expect("invoke");

        assert_eq!(response.model, "claude-3-5-haiku");
        assert_eq!(response.tokens.map(|t| t.total()), Some(42));
    }
}
