//! The token-metered external service behind the queue.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::errors::CompletionError;

static RETRY_HINT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:try again|retry)\s+(?:in|after)\s+(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?)\b")
        .unwrap()
});

/// Longest wait a provider hint can ask for; larger hints are clamped.
pub const MAX_RETRY_HINT: Duration = Duration::from_secs(24 * 60 * 60);

fn hint(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_RETRY_HINT)
            .min(MAX_RETRY_HINT),
    )
}

/// A successful call and the tokens it actually consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub response: Value,
    pub total_tokens: i64,
}

/// One call to the budgeted service. Implementations report provider rate
/// limiting as [`CompletionError::RateLimited`].
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, params: &Value) -> Result<Completion, CompletionError>;
}

/// Tokens consumed according to a response's `usage` block. Understands
/// `total_tokens`, `input_tokens + output_tokens` and
/// `prompt_tokens + completion_tokens`; a response without usage counts as 0.
pub fn usage_tokens(response: &Value) -> i64 {
    let Some(usage) = response.get("usage") else {
        return 0;
    };
    let field = |name: &str| usage.get(name).and_then(Value::as_i64);
    if let Some(total) = field("total_tokens") {
        return total;
    }
    let pair = |a: &str, b: &str| match (field(a), field(b)) {
        (None, None) => None,
        (x, y) => Some(x.unwrap_or(0) + y.unwrap_or(0)),
    };
    pair("input_tokens", "output_tokens")
        .or_else(|| pair("prompt_tokens", "completion_tokens"))
        .unwrap_or(0)
}

/// Wait suggested by `retry-after-ms` or `retry-after` (in seconds).
pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
    };
    header("retry-after-ms")
        .and_then(|ms| hint(ms / 1000.0))
        .or_else(|| header("retry-after").and_then(hint))
}

/// Wait suggested in an error message, e.g. "Please try again in 1.5s" or
/// "retry in 500ms".
pub fn retry_after_from_message(message: &str) -> Option<Duration> {
    let caps = RETRY_HINT_REGEX.captures(message)?;
    let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_ascii_lowercase();
    let secs = if unit.starts_with("ms") || unit.starts_with("milli") {
        amount / 1000.0
    } else {
        amount
    };
    hint(secs)
}

/// JSON-over-HTTP client for a chat-completions style endpoint.
pub struct HttpCompletionClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpCompletionClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, params: &Value) -> Result<Completion, CompletionError> {
        let mut request = self.client.post(&self.endpoint).json(params);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| CompletionError::Upstream(format!("request to {} failed: {}", self.endpoint, e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let header_wait = retry_after_from_headers(response.headers());
            let body = response.text().await.unwrap_or_default();
            let message = error_message(&body).unwrap_or(body);
            let retry_after = header_wait.or_else(|| retry_after_from_message(&message));
            tracing::warn!(endpoint = %self.endpoint, ?retry_after, "provider rate limit");
            return Err(CompletionError::RateLimited {
                retry_after,
                message,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(&body).unwrap_or(body);
            return Err(CompletionError::Upstream(format!("{}: {}", status, message)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CompletionError::Upstream(format!("invalid response body: {}", e)))?;
        let total_tokens = usage_tokens(&body);
        tracing::debug!(endpoint = %self.endpoint, tokens = total_tokens, "completion received");
        Ok(Completion {
            response: body,
            total_tokens,
        })
    }
}

/// `error.message` from a JSON error body, if there is one.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/message")
        .or_else(|| value.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_usage_tokens_variants() {
        assert_eq!(usage_tokens(&json!({"usage": {"total_tokens": 40000}})), 40000);
        assert_eq!(
            usage_tokens(&json!({"usage": {"input_tokens": 300, "output_tokens": 45}})),
            345
        );
        assert_eq!(
            usage_tokens(&json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5}})),
            15
        );
        assert_eq!(usage_tokens(&json!({"choices": []})), 0);
    }

    #[test]
    fn test_retry_hint_from_message() {
        assert_eq!(
            retry_after_from_message("Rate limit reached. Please try again in 1.5s."),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            retry_after_from_message("429: retry in 500ms"),
            Some(Duration::from_millis(500))
        );
        assert_eq!(
            retry_after_from_message("Retry after 2 seconds"),
            Some(Duration::from_secs(2))
        );
        assert_eq!(retry_after_from_message("slow down"), None);
    }

    #[test]
    fn test_retry_after_headers_prefer_milliseconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("3"));
        assert_eq!(retry_after_from_headers(&headers), Some(Duration::from_secs(3)));
        headers.insert("retry-after-ms", HeaderValue::from_static("250"));
        assert_eq!(retry_after_from_headers(&headers), Some(Duration::from_millis(250)));
        headers.insert("retry-after-ms", HeaderValue::from_static("soon"));
        assert_eq!(retry_after_from_headers(&headers), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_oversized_hints_are_clamped() {
        assert_eq!(
            retry_after_from_message("Rate limit, retry in 99999999999999999999999s"),
            Some(MAX_RETRY_HINT)
        );
        assert_eq!(
            retry_after_from_message("retry after 1e5 seconds"),
            None
        );
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("1e300"));
        assert_eq!(retry_after_from_headers(&headers), Some(MAX_RETRY_HINT));
        headers.insert("retry-after-ms", HeaderValue::from_static("1e308"));
        assert_eq!(retry_after_from_headers(&headers), Some(MAX_RETRY_HINT));
    }

    #[test]
    fn test_garbage_headers_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("NaN"));
        assert_eq!(retry_after_from_headers(&headers), None);
        headers.insert("retry-after", HeaderValue::from_static("inf"));
        assert_eq!(retry_after_from_headers(&headers), None);
        headers.insert("retry-after", HeaderValue::from_static("-5"));
        assert_eq!(retry_after_from_headers(&headers), None);
        headers.insert("retry-after", HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after_from_headers(&headers), None);
    }

    #[tokio::test]
    async fn test_http_client_survives_huge_retry_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "1e300")
                    .set_body_json(json!({"error": {"message": "slow down"}})),
            )
            .mount(&server)
            .await;

        let client = HttpCompletionClient::new(server.uri(), None);
        match client.complete(&json!({})).await {
            Err(CompletionError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Some(MAX_RETRY_HINT));
            }
            other => panic!("Expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_client_reports_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "patched"}}],
                "usage": {"total_tokens": 1234}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpCompletionClient::new(
            format!("{}/v1/chat/completions", server.uri()),
            Some("sk-test".into()),
        );
        let done = client.complete(&json!({"model": "m"})).await.unwrap();
        assert_eq!(done.total_tokens, 1234);
        assert_eq!(done.response["choices"][0]["message"]["content"], "patched");
    }

    #[tokio::test]
    async fn test_http_client_maps_429_with_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after-ms", "750")
                    .set_body_json(json!({"error": {"message": "Rate limit reached"}})),
            )
            .mount(&server)
            .await;

        let client = HttpCompletionClient::new(server.uri(), None);
        match client.complete(&json!({})).await {
            Err(CompletionError::RateLimited {
                retry_after,
                message,
            }) => {
                assert_eq!(retry_after, Some(Duration::from_millis(750)));
                assert_eq!(message, "Rate limit reached");
            }
            other => panic!("Expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_client_maps_429_with_message_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(
                json!({"error": {"message": "Too many tokens, please try again in 1.5s"}}),
            ))
            .mount(&server)
            .await;

        let client = HttpCompletionClient::new(server.uri(), None);
        match client.complete(&json!({})).await {
            Err(CompletionError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Some(Duration::from_millis(1500)));
            }
            other => panic!("Expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_client_maps_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = HttpCompletionClient::new(server.uri(), None);
        match client.complete(&json!({})).await {
            Err(CompletionError::Upstream(msg)) => {
                assert!(msg.contains("500"));
                assert!(msg.contains("boom"));
            }
            other => panic!("Expected Upstream, got {:?}", other),
        }
    }
}
