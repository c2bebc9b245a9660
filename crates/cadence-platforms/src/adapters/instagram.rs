//! Instagram publishing through the Graph API.
//!
//! Instagram publishes in two phases. `publish` creates a media container
//! and returns immediately; Instagram then fetches and processes the media
//! in the background. `resume` reads the container's `status_code` and, once
//! it is `FINISHED`, publishes the container to the account.

use async_trait::async_trait;
use cadence_scheduler::{
    ContainerRef, Credentials, PostRef, Provider, PublishAdapter, PublishError, PublishOutcome,
    ResumeOutcome, Upload,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{DEFAULT_GRAPH_API_URL, text_setting};
use crate::client::ApiClient;
use crate::{MediaUrls, PlatformError};

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    status_code: String,
    /// Human-readable detail, present on errors.
    #[serde(default)]
    status: Option<String>,
}

pub struct InstagramAdapter {
    api: ApiClient,
    media: MediaUrls,
}

impl InstagramAdapter {
    pub fn new(media: MediaUrls) -> Self {
        Self {
            api: ApiClient::new(DEFAULT_GRAPH_API_URL),
            media,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api = ApiClient::new(base_url);
        self
    }

    async fn create_container(
        &self,
        credentials: &Credentials,
        asset: &Upload,
        settings: &Value,
    ) -> Result<ContainerRef, PlatformError> {
        let caption = text_setting(settings, &["caption"]).unwrap_or_default();
        let media_url = self.media.url_for(asset);
        let token = credentials.access_token.as_str();

        let mut form = vec![("caption", caption), ("access_token", token)];
        if asset.is_video() {
            form.push(("media_type", "REELS"));
            form.push(("video_url", media_url.as_str()));
        } else {
            form.push(("image_url", media_url.as_str()));
        }

        let created: Created = self
            .api
            .send_json(
                self.api
                    .post(&format!("/{}/media", credentials.account_id))
                    .form(&form),
            )
            .await?;
        Ok(ContainerRef {
            container_id: created.id,
        })
    }

    async fn check_container(
        &self,
        credentials: &Credentials,
        container: &ContainerRef,
    ) -> Result<ResumeOutcome, PlatformError> {
        let status: ContainerStatus = self
            .api
            .send_json(self.api.get(&format!("/{}", container.container_id)).query(&[
                ("fields", "status_code,status"),
                ("access_token", credentials.access_token.as_str()),
            ]))
            .await?;
        debug!(status_code = %status.status_code, "container status");

        match status.status_code.as_str() {
            "FINISHED" => {
                let published: Created = self
                    .api
                    .send_json(
                        self.api
                            .post(&format!("/{}/media_publish", credentials.account_id))
                            .form(&[
                                ("creation_id", container.container_id.as_str()),
                                ("access_token", credentials.access_token.as_str()),
                            ]),
                    )
                    .await?;
                Ok(ResumeOutcome::Published(
                    PostRef::new(published.id).with_media(container.container_id.clone()),
                ))
            }
            "ERROR" | "EXPIRED" => Ok(ResumeOutcome::Failed(format!(
                "Instagram media processing failed: {}",
                status.status.unwrap_or(status.status_code)
            ))),
            _ => Ok(ResumeOutcome::Pending),
        }
    }
}

#[async_trait]
impl PublishAdapter for InstagramAdapter {
    fn provider(&self) -> Provider {
        Provider::Instagram
    }

    #[tracing::instrument(skip_all, fields(upload_id = %asset.id))]
    async fn publish(
        &self,
        credentials: &Credentials,
        asset: &Upload,
        settings: &Value,
    ) -> Result<PublishOutcome, PublishError> {
        let container = self
            .create_container(credentials, asset, settings)
            .await
            .map_err(|e| e.into_publish_error(Provider::Instagram))?;
        info!(container_id = %container.container_id, "created Instagram media container");
        Ok(PublishOutcome::Container(container))
    }

    #[tracing::instrument(skip_all, fields(container_id = %container.container_id))]
    async fn resume(
        &self,
        credentials: &Credentials,
        container: &ContainerRef,
        _settings: &Value,
    ) -> Result<ResumeOutcome, PublishError> {
        self.check_container(credentials, container)
            .await
            .map_err(|e| e.into_publish_error(Provider::Instagram))
    }
}
