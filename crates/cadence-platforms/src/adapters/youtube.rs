//! YouTube Data API video uploads.
//!
//! Uses the resumable upload protocol: one request opens an upload session
//! carrying the video metadata, a second sends the bytes to the session URL.

use async_trait::async_trait;
use cadence_scheduler::{
    Credentials, PostRef, Provider, PublishAdapter, PublishError, PublishOutcome, Upload,
};
use reqwest::header::{CONTENT_TYPE, LOCATION};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{bool_setting, text_setting};
use crate::client::{ApiClient, check_status};
use crate::{MediaUrls, PlatformError};

pub const DEFAULT_YOUTUBE_API_URL: &str = "https://www.googleapis.com";

/// YouTube caps titles at 100 characters.
const MAX_TITLE_CHARS: usize = 100;

#[derive(Debug, Deserialize)]
struct Video {
    id: String,
}

pub struct YoutubeAdapter {
    api: ApiClient,
    media: MediaUrls,
}

impl YoutubeAdapter {
    pub fn new(media: MediaUrls) -> Self {
        Self {
            api: ApiClient::new(DEFAULT_YOUTUBE_API_URL),
            media,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api = ApiClient::new(base_url);
        self
    }

    fn metadata(settings: &Value) -> Value {
        let title: String = text_setting(settings, &["title", "caption"])
            .unwrap_or("Untitled")
            .chars()
            .take(MAX_TITLE_CHARS)
            .collect();
        let description = text_setting(settings, &["description", "caption"]).unwrap_or_default();
        let privacy = text_setting(settings, &["privacy"]).unwrap_or("public");
        let tags = settings.get("tags").cloned().unwrap_or_else(|| json!([]));

        json!({
            "snippet": {
                "title": title,
                "description": description,
                "tags": tags,
                "categoryId": text_setting(settings, &["category_id"]).unwrap_or("22"),
            },
            "status": {
                "privacyStatus": privacy,
                "selfDeclaredMadeForKids": bool_setting(settings, "made_for_kids"),
            }
        })
    }

    async fn fetch_media(&self, asset: &Upload) -> Result<Vec<u8>, PlatformError> {
        let url = self.media.url_for(asset);
        let response = self
            .api
            .http()
            .get(&url)
            .send()
            .await
            .map_err(|e| PlatformError::Media(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(PlatformError::Media(format!(
                "{}: status {}",
                url,
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PlatformError::Media(format!("{}: {}", url, e)))?;
        debug!(size = bytes.len(), "fetched media");
        Ok(bytes.to_vec())
    }

    async fn upload(
        &self,
        credentials: &Credentials,
        asset: &Upload,
        settings: &Value,
    ) -> Result<PostRef, PlatformError> {
        if !asset.is_video() {
            return Err(PlatformError::Unsupported(format!(
                "YouTube only accepts video uploads, got {}",
                asset.mime_type
            )));
        }

        let bytes = self.fetch_media(asset).await?;

        let response = self
            .api
            .post("/upload/youtube/v3/videos")
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .bearer_auth(&credentials.access_token)
            .header("X-Upload-Content-Type", &asset.mime_type)
            .header("X-Upload-Content-Length", bytes.len())
            .json(&Self::metadata(settings))
            .send()
            .await?;
        let response = check_status(response).await?;
        let session_url = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                PlatformError::InvalidResponse("upload session has no Location header".to_string())
            })?
            .to_string();

        let video: Video = self
            .api
            .send_json(
                self.api
                    .http()
                    .put(&session_url)
                    .bearer_auth(&credentials.access_token)
                    .header(CONTENT_TYPE, &asset.mime_type)
                    .body(bytes),
            )
            .await?;

        Ok(PostRef::new(video.id))
    }
}

#[async_trait]
impl PublishAdapter for YoutubeAdapter {
    fn provider(&self) -> Provider {
        Provider::Youtube
    }

    #[tracing::instrument(skip_all, fields(upload_id = %asset.id))]
    async fn publish(
        &self,
        credentials: &Credentials,
        asset: &Upload,
        settings: &Value,
    ) -> Result<PublishOutcome, PublishError> {
        let post = self
            .upload(credentials, asset, settings)
            .await
            .map_err(|e| e.into_publish_error(Provider::Youtube))?;
        info!(video_id = %post.post_id, "uploaded YouTube video");
        Ok(PublishOutcome::Published(post))
    }
}
