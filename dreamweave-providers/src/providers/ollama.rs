use crate::error::ProviderError;
use crate::models::{PreparedPrompt, ProviderResponse, RawResponse, TokenUsage};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{Provider, ProviderCapabilities, ProviderSettings};
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Adapter for local or remote Ollama instances. Runs without credentials,
/// which makes it the default development provider.
pub struct OllamaProvider {
    http: HttpProviderClient,
    settings: ProviderSettings,
    model: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

impl OllamaProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self, ProviderError> {
        let http = HttpProviderClient::new(
            settings.timeout,
            settings.base_url.clone(),
            "http://localhost:11434",
            &settings.headers,
            AuthStrategy::None,
        )?;
        let model = settings.resolved_model();
        Ok(Self {
            http,
            settings,
            model,
        })
    }

    fn build_request(&self, prompt: &PreparedPrompt) -> GenerateRequest<'_> {
        GenerateRequest {
            model: &self.model,
            prompt: format!("{}\n\n{}", prompt.system, prompt.user),
            stream: false,
            format: (prompt.json_mode && self.settings.capabilities.json_mode).then_some("json"),
            options: GenerateOptions {
                temperature: prompt.temperature,
                num_predict: prompt.max_tokens.min(self.settings.limits.max_tokens),
            },
        }
    }
}

fn parse_usage(body: &Value) -> Option<TokenUsage> {
    Some(TokenUsage {
        prompt_tokens: body.get("prompt_eval_count")?.as_u64()? as u32,
        completion_tokens: body.get("eval_count")?.as_u64()? as u32,
    })
}

#[async_trait::async_trait]
impl Provider for OllamaProvider {
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
            .post_json_value("/api/generate", &self.build_request(prompt), timeout)
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

    async fn probe(&self, timeout: Duration) -> Result<Duration, ProviderError> {
        let start = Instant::now();
        self.http.get_json::<Value>("/api/tags", timeout).await?;
        Ok(start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn invoke_requests_json_format_and_wraps_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({"format": "json", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "llama3.2",
                "response": "{\"title\":\"Tide Pools\"}",
                "prompt_eval_count": 25,
                "eval_count": 50
            })))
            .mount(&server)
            .await;

        let settings = ProviderSettings::new("ollama", "").with_base_url(server.uri());
        let provider = OllamaProvider::new(settings).expect("provider");
        let prompt = PreparedPrompt {
            system: "You render dreams as JSON.".to_string(),
            user: "tide pools under moonlight".to_string(),
            temperature: 0.7,
            max_tokens: 512,
            json_mode: true,
        };

        let response = provider
            .invoke(&prompt, Duration::from_secs(2))
            .await
            .expect("invoke");
        assert_eq!(response.tokens.map(|t| t.total()), Some(75));
        match response.raw {
            RawResponse::Json(body) => {
                assert_eq!(body["response"], "{\"title\":\"Tide Pools\"}")
            }
            other => panic!("expected json, got {other:?}"),
        }
    }
}
