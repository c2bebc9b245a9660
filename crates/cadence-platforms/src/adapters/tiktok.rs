//! TikTok Content Posting API.
//!
//! Videos are posted with `PULL_FROM_URL`: TikTok downloads the media from
//! its public URL, so nothing is streamed through the worker.

use async_trait::async_trait;
use cadence_scheduler::{
    Credentials, PostRef, Provider, PublishAdapter, PublishError, PublishOutcome, Upload,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::{bool_setting, text_setting};
use crate::client::ApiClient;
use crate::{MediaUrls, PlatformError};

pub const DEFAULT_TIKTOK_API_URL: &str = "https://open.tiktokapis.com";

/// Error codes TikTok uses for tokens that no longer work.
const TOKEN_ERRORS: &[&str] = &["access_token_invalid", "scope_not_authorized"];

#[derive(Debug, Deserialize)]
struct InitResponse {
    #[serde(default)]
    data: Option<InitData>,
    error: ApiStatus,
}

#[derive(Debug, Deserialize)]
struct InitData {
    publish_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    code: String,
    #[serde(default)]
    message: String,
}

pub struct TiktokAdapter {
    api: ApiClient,
    media: MediaUrls,
}

impl TiktokAdapter {
    pub fn new(media: MediaUrls) -> Self {
        Self {
            api: ApiClient::new(DEFAULT_TIKTOK_API_URL),
            media,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api = ApiClient::new(base_url);
        self
    }

    async fn direct_post(
        &self,
        credentials: &Credentials,
        asset: &Upload,
        settings: &Value,
    ) -> Result<PostRef, PlatformError> {
        if !asset.is_video() {
            return Err(PlatformError::Unsupported(format!(
                "TikTok direct posts must be video, got {}",
                asset.mime_type
            )));
        }

        let body = json!({
            "post_info": {
                "title": text_setting(settings, &["caption", "title"]).unwrap_or_default(),
                "privacy_level": text_setting(settings, &["privacy_level"]).unwrap_or("PUBLIC_TO_EVERYONE"),
                "disable_comment": bool_setting(settings, "disable_comment"),
                "disable_duet": bool_setting(settings, "disable_duet"),
                "disable_stitch": bool_setting(settings, "disable_stitch"),
            },
            "source_info": {
                "source": "PULL_FROM_URL",
                "video_url": self.media.url_for(asset),
            }
        });

        let response: InitResponse = self
            .api
            .send_json(
                self.api
                    .post("/v2/post/publish/video/init/")
                    .bearer_auth(&credentials.access_token)
                    .json(&body),
            )
            .await?;

        if response.error.code != "ok" {
            let detail = format!("{}: {}", response.error.code, response.error.message);
            if TOKEN_ERRORS.contains(&response.error.code.as_str()) {
                return Err(PlatformError::Unauthorized {
                    status: 200,
                    body: detail,
                });
            }
            return Err(PlatformError::InvalidResponse(detail));
        }

        let data = response.data.ok_or_else(|| {
            PlatformError::InvalidResponse("publish init returned no data".to_string())
        })?;
        Ok(PostRef::new(data.publish_id))
    }
}

#[async_trait]
impl PublishAdapter for TiktokAdapter {
    fn provider(&self) -> Provider {
        Provider::Tiktok
    }

    #[tracing::instrument(skip_all, fields(upload_id = %asset.id))]
    async fn publish(
        &self,
        credentials: &Credentials,
        asset: &Upload,
        settings: &Value,
    ) -> Result<PublishOutcome, PublishError> {
        let post = self
            .direct_post(credentials, asset, settings)
            .await
            .map_err(|e| e.into_publish_error(Provider::Tiktok))?;
        info!(publish_id = %post.post_id, "initialized TikTok direct post");
        Ok(PublishOutcome::Published(post))
    }
}
