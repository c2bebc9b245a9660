//! LinkedIn UGC posts.

use async_trait::async_trait;
use cadence_scheduler::{
    Credentials, PostRef, Provider, PublishAdapter, PublishError, PublishOutcome, Upload,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::text_setting;
use crate::client::{ApiClient, check_status};
use crate::{MediaUrls, PlatformError};

pub const DEFAULT_LINKEDIN_API_URL: &str = "https://api.linkedin.com";

#[derive(Debug, Deserialize)]
struct Created {
    #[serde(default)]
    id: Option<String>,
}

pub struct LinkedinAdapter {
    api: ApiClient,
    media: MediaUrls,
}

impl LinkedinAdapter {
    pub fn new(media: MediaUrls) -> Self {
        Self {
            api: ApiClient::new(DEFAULT_LINKEDIN_API_URL),
            media,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api = ApiClient::new(base_url);
        self
    }

    /// Member ids are stored bare; organization accounts are stored as URNs.
    fn author_urn(account_id: &str) -> String {
        if account_id.starts_with("urn:li:") {
            account_id.to_string()
        } else {
            format!("urn:li:person:{}", account_id)
        }
    }

    async fn share(
        &self,
        credentials: &Credentials,
        asset: &Upload,
        settings: &Value,
    ) -> Result<PostRef, PlatformError> {
        let commentary = text_setting(settings, &["caption", "description"]).unwrap_or_default();
        let title = text_setting(settings, &["title"]).unwrap_or_default();
        let body = json!({
            "author": Self::author_urn(&credentials.account_id),
            "lifecycleState": "PUBLISHED",
            "specificContent": {
                "com.linkedin.ugc.ShareContent": {
                    "shareCommentary": {"text": commentary},
                    "shareMediaCategory": "ARTICLE",
                    "media": [{
                        "status": "READY",
                        "originalUrl": self.media.url_for(asset),
                        "title": {"text": title},
                    }]
                }
            },
            "visibility": {"com.linkedin.ugc.MemberNetworkVisibility": "PUBLIC"}
        });

        let response = self
            .api
            .post("/v2/ugcPosts")
            .bearer_auth(&credentials.access_token)
            .header("X-Restli-Protocol-Version", "2.0.0")
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        // The URN comes back in a header; older API versions also echo it in
        // the body.
        let header_id = response
            .headers()
            .get("x-restli-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await?;
        let body_id = if text.trim().is_empty() {
            None
        } else {
            serde_json::from_str::<Created>(&text)?.id
        };

        header_id
            .or(body_id)
            .map(PostRef::new)
            .ok_or_else(|| PlatformError::InvalidResponse("UGC post returned no id".to_string()))
    }
}

#[async_trait]
impl PublishAdapter for LinkedinAdapter {
    fn provider(&self) -> Provider {
        Provider::Linkedin
    }

    #[tracing::instrument(skip_all, fields(upload_id = %asset.id))]
    async fn publish(
        &self,
        credentials: &Credentials,
        asset: &Upload,
        settings: &Value,
    ) -> Result<PublishOutcome, PublishError> {
        let post = self
            .share(credentials, asset, settings)
            .await
            .map_err(|e| e.into_publish_error(Provider::Linkedin))?;
        info!(urn = %post.post_id, "published LinkedIn post");
        Ok(PublishOutcome::Published(post))
    }
}

#[cfg(test)]
mod tests {
    use cadence_scheduler::ErrorKind;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::adapters::fixtures;

    fn adapter(mock_server: &MockServer) -> LinkedinAdapter {
        LinkedinAdapter::new(MediaUrls::new("https://cdn.example.com"))
            .with_base_url(mock_server.uri())
    }

    #[test]
    fn test_author_urn() {
        assert_eq!(LinkedinAdapter::author_urn("abc123"), "urn:li:person:abc123");
        assert_eq!(
            LinkedinAdapter::author_urn("urn:li:organization:42"),
            "urn:li:organization:42"
        );
    }

    #[tokio::test]
    async fn test_urn_from_header() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/ugcPosts"))
            .and(header("X-Restli-Protocol-Version", "2.0.0"))
            .and(body_partial_json(serde_json::json!({
                "author": "urn:li:person:member-1",
                "lifecycleState": "PUBLISHED"
            })))
            .respond_with(
                ResponseTemplate::new(201).insert_header("x-restli-id", "urn:li:share:7001"),
            )
            .mount(&mock_server)
            .await;

        let outcome = adapter(&mock_server)
            .publish(
                &fixtures::credentials("member-1"),
                &fixtures::video(),
                &serde_json::json!({"caption": "we shipped"}),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PublishOutcome::Published(PostRef::new("urn:li:share:7001"))
        );
    }

    #[tokio::test]
    async fn test_urn_from_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/ugcPosts"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({"id": "urn:li:ugcPost:88"})),
            )
            .mount(&mock_server)
            .await;

        let outcome = adapter(&mock_server)
            .publish(
                &fixtures::credentials("member-1"),
                &fixtures::image(),
                &Value::Null,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PublishOutcome::Published(PostRef::new("urn:li:ugcPost:88"))
        );
    }

    #[tokio::test]
    async fn test_missing_permission_needs_reconnect() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/ugcPosts"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "message": "Not enough permissions to access: ugcPosts.CREATE",
                "status": 403
            })))
            .mount(&mock_server)
            .await;

        let err = adapter(&mock_server)
            .publish(
                &fixtures::credentials("member-1"),
                &fixtures::video(),
                &Value::Null,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::AccountNotConnected);
    }
}
