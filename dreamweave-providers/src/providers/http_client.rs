use crate::error::ProviderError;
use futures::StreamExt;
use reqwest::{header::HeaderMap, Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Debug)]
pub enum AuthStrategy {
    Bearer { token: String },
    Header { name: String, value: String },
    None,
}

#[derive(Clone)]
pub struct HttpProviderClient {
    http: Client,
    base_url: String,
    default_headers: HeaderMap,
}

impl HttpProviderClient {
    pub fn new(
        timeout: Duration,
        base_url: Option<String>,
        default_base: &str,
        headers: &HashMap<String, String>,
        auth: AuthStrategy,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder().timeout(timeout).build().map_err(|e| {
            ProviderError::Configuration {
                message: format!("Failed to create HTTP client: {e}"),
            }
        })?;

        let mut default_headers = HeaderMap::new();

        match auth {
            AuthStrategy::Bearer { token } => {
                let value = format!("Bearer {token}")
                    .parse()
                    .map_err(|_| ProviderError::Configuration {
                        message: "API key contains invalid header characters".to_string(),
                    })?;
                default_headers.insert("Authorization", value);
            }
            AuthStrategy::Header { name, value } => {
                if let (Ok(name), Ok(value)) =
                    (name.parse::<reqwest::header::HeaderName>(), value.parse())
                {
                    default_headers.insert(name, value);
                }
            }
            AuthStrategy::None => {}
        }

        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (k.parse::<reqwest::header::HeaderName>(), v.parse()) {
                default_headers.insert(name, value);
            }
        }

        let base_url = base_url.unwrap_or_else(|| default_base.to_string());

        Ok(Self {
            http,
            base_url,
            default_headers,
        })
    }

    fn build_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url.trim_end_matches('/'), path)
        } else {
            format!("{}/{}", self.base_url.trim_end_matches('/'), path)
        }
    }

    /// POST a JSON body and decode a JSON response, bounded by `timeout`.
    pub async fn post_json<TReq: Serialize, TResp: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
        timeout: Duration,
    ) -> Result<TResp, ProviderError> {
        let url = self.build_url(path);
        let resp = self
            .http
            .request(Method::POST, url)
            .headers(self.default_headers.clone())
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(wrap_timeout)?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        resp.json::<TResp>().await.map_err(wrap_timeout)
    }

    /// POST a JSON body and return the raw JSON value.
    pub async fn post_json_value<TReq: Serialize>(
        &self,
        path: &str,
        body: &TReq,
        timeout: Duration,
    ) -> Result<Value, ProviderError> {
        self.post_json::<TReq, Value>(path, body, timeout).await
    }

    pub async fn get_json<TResp: DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<TResp, ProviderError> {
        let url = self.build_url(path);
        let resp = self
            .http
            .request(Method::GET, url)
            .headers(self.default_headers.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(wrap_timeout)?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        resp.json::<TResp>().await.map_err(wrap_timeout)
    }

    /// POST a JSON body and aggregate a server-sent-event stream into a
    /// single string. `extract_delta` pulls the text fragment out of each
    /// event payload; events it declines are skipped. Aggregation stops at
    /// the `[DONE]` terminator, the end of the stream, or the timeout,
    /// whichever comes first.
    pub async fn post_sse_collect<TReq, F>(
        &self,
        path: &str,
        body: &TReq,
        timeout: Duration,
        extract_delta: F,
    ) -> Result<String, ProviderError>
    where
        TReq: Serialize,
        F: Fn(&Value) -> Option<String>,
    {
        let url = self.build_url(path);
        let collect = async {
            let resp = self
                .http
                .request(Method::POST, url)
                .headers(self.default_headers.clone())
                .json(body)
                .send()
                .await
                .map_err(wrap_timeout)?;

            if !resp.status().is_success() {
                return Err(map_error_response(resp).await);
            }

            let mut stream = resp.bytes_stream();
            let mut pending = String::new();
            let mut assembled = String::new();

            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| ProviderError::Streaming {
                    message: format!("stream read failed: {e}"),
                })?;
                pending.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = pending.find('\n') {
                    let line = pending[..newline].trim().to_string();
                    pending.drain(..=newline);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        return Ok(assembled);
                    }
                    match serde_json::from_str::<Value>(data) {
                        Ok(event) => {
                            if let Some(delta) = extract_delta(&event) {
                                assembled.push_str(&delta);
                            }
                        }
                        Err(e) => {
                            return Err(ProviderError::Streaming {
                                message: format!("malformed stream event: {e}"),
                            });
                        }
                    }
                }
            }
            Ok(assembled)
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        }
    }
}

/// Per-request timeouts surface as reqwest errors; normalize them so the
/// taxonomy sees `timeout` rather than a generic transport failure.
fn wrap_timeout(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Http(e)
    }
}

pub async fn map_error_response(resp: Response) -> ProviderError {
    let status = resp.status();
    match resp.text().await {
        Ok(body) => {
            // Pull a message from the common JSON error shapes.
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| {
                    v.get("error")
                        .and_then(|e| e.get("message").cloned().or_else(|| Some(e.clone())))
                        .or_else(|| v.get("message").cloned())
                })
                .and_then(|m| m.as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| body.clone());

            match status.as_u16() {
                401 => ProviderError::InvalidApiKey,
                404 => ProviderError::ModelNotFound {
                    model: "unknown".to_string(),
                },
                429 if message.to_lowercase().contains("quota") => ProviderError::QuotaExceeded,
                429 => ProviderError::RateLimit,
                code => ProviderError::Api { code, message },
            }
        }
        Err(_) => ProviderError::Api {
            code: status.as_u16(),
            message: "Failed to read error response".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base: &str) -> HttpProviderClient {
        HttpProviderClient::new(
            Duration::from_secs(5),
            Some(base.to_string()),
            "http://unused",
            &HashMap::new(),
            AuthStrategy::Bearer {
                token: "test-key".to_string(),
            },
        )
        .expect("client")
    }

    #[tokio::test]
    async fn maps_429_to_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"message": "Rate limit reached"}
            })))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .post_json_value(
                "/v1/chat/completions",
                &serde_json::json!({}),
                Duration::from_secs(1),
            )
            .await
            .expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
    }

    #[tokio::test]
    async fn maps_quota_message_over_429_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"message": "You exceeded your current quota"}
            })))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .post_json_value("/v1/x", &serde_json::json!({}), Duration::from_secs(1))
            .await
            .expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }

    #[tokio::test]
    async fn maps_401_to_authentication() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .post_json_value("/v1/x", &serde_json::json!({}), Duration::from_secs(1))
            .await
            .expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn collects_sse_deltas_until_done() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"title\\\"\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\": \\\"Dream\\\"}\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let assembled = client(&server.uri())
            .post_sse_collect(
                "/v1/chat/completions",
                &serde_json::json!({}),
                Duration::from_secs(2),
                |event| {
                    event["choices"][0]["delta"]["content"]
                        .as_str()
                        .map(|s| s.to_string())
                },
            )
            .await
            .expect("stream collected");
        assert_eq!(assembled, r#"{"title": "Dream"}"#);
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"ok": true}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .post_json_value("/v1/x", &serde_json::json!({}), Duration::from_millis(50))
            .await
            .expect_err("should time out");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
