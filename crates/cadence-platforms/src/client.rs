//! Shared HTTP plumbing for platform APIs.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use crate::PlatformError;

/// Build the HTTP client used for platform calls.
///
/// Media uploads can take a while, so the overall timeout is generous.
pub(crate) fn http_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(300))
        .build()
        .expect("failed to build HTTP client")
}

/// HTTP client bound to one platform's API base URL.
#[derive(Clone)]
pub(crate) struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub(crate) fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(self.url(path))
    }

    pub(crate) fn post(&self, path: &str) -> RequestBuilder {
        self.http.post(self.url(path))
    }

    /// Request against an absolute URL (upload sessions, media downloads).
    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    /// Send and decode a JSON response.
    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, PlatformError> {
        let response = request.send().await?;
        handle_response(response).await
    }
}

/// Map non-success statuses to [`PlatformError`] and parse the JSON body.
pub(crate) async fn handle_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, PlatformError> {
    let response = check_status(response).await?;
    let body = response.json().await?;
    Ok(body)
}

/// Map non-success statuses to [`PlatformError`], returning the response
/// untouched on success.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, PlatformError> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());
        return Err(PlatformError::RateLimited { retry_after_secs });
    }

    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.map_err(|e| {
        PlatformError::InvalidResponse(format!(
            "request failed ({}): failed to read response: {}",
            status, e
        ))
    })?;

    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || is_graph_token_error(&body)
    {
        return Err(PlatformError::Unauthorized {
            status: status.as_u16(),
            body,
        });
    }

    Err(PlatformError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Graph API reports revoked or expired tokens as a 400 with code 190.
fn is_graph_token_error(body: &str) -> bool {
    #[derive(serde::Deserialize)]
    struct GraphErrorBody {
        error: GraphError,
    }

    #[derive(serde::Deserialize)]
    struct GraphError {
        code: Option<i64>,
    }

    serde_json::from_str::<GraphErrorBody>(body)
        .map(|b| b.error.code == Some(190))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        let client = ApiClient::new("https://api.example.com/v1/");
        assert_eq!(client.url("/posts"), "https://api.example.com/v1/posts");
    }

    #[tokio::test]
    async fn test_forbidden_is_unauthorized() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(ResponseTemplate::new(403).set_body_string("scope missing"))
            .mount(&mock_server)
            .await;

        let client = ApiClient::new(mock_server.uri());
        let err = client
            .send_json::<serde_json::Value>(client.get("/me"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Unauthorized { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_graph_code_190_is_unauthorized() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {
                    "message": "Error validating access token: Session has expired",
                    "type": "OAuthException",
                    "code": 190
                }
            })))
            .mount(&mock_server)
            .await;

        let client = ApiClient::new(mock_server.uri());
        let err = client
            .send_json::<serde_json::Value>(client.get("/me"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Unauthorized { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_rate_limited_reads_retry_after() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "60"))
            .mount(&mock_server)
            .await;

        let client = ApiClient::new(mock_server.uri());
        let err = client
            .send_json::<serde_json::Value>(client.get("/me"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PlatformError::RateLimited {
                retry_after_secs: Some(60)
            }
        ));
    }

    #[tokio::test]
    async fn test_server_error_keeps_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&mock_server)
            .await;

        let client = ApiClient::new(mock_server.uri());
        let err = client
            .send_json::<serde_json::Value>(client.get("/me"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "request failed (502): bad gateway");
    }
}
