//! Facebook Page posts through the Graph API.

use async_trait::async_trait;
use cadence_scheduler::{
    Credentials, PostRef, Provider, PublishAdapter, PublishError, PublishOutcome, Upload,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{DEFAULT_GRAPH_API_URL, text_setting};
use crate::client::ApiClient;
use crate::{MediaUrls, PlatformError};

#[derive(Debug, Deserialize)]
struct GraphObject {
    id: String,
    /// Photos return the feed post separately from the photo object.
    #[serde(default)]
    post_id: Option<String>,
}

pub struct FacebookAdapter {
    api: ApiClient,
    media: MediaUrls,
}

impl FacebookAdapter {
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

    async fn page_post(
        &self,
        credentials: &Credentials,
        asset: &Upload,
        settings: &Value,
    ) -> Result<PostRef, PlatformError> {
        let page_id = &credentials.account_id;
        let text = text_setting(settings, &["caption", "description"]).unwrap_or_default();
        let media_url = self.media.url_for(asset);

        let request = if asset.is_video() {
            self.api.post(&format!("/{}/videos", page_id)).form(&[
                ("file_url", media_url.as_str()),
                ("description", text),
                ("access_token", credentials.access_token.as_str()),
            ])
        } else {
            self.api.post(&format!("/{}/photos", page_id)).form(&[
                ("url", media_url.as_str()),
                ("caption", text),
                ("access_token", credentials.access_token.as_str()),
            ])
        };

        let object: GraphObject = self.api.send_json(request).await?;
        let post_id = object.post_id.unwrap_or_else(|| object.id.clone());
        Ok(PostRef::new(post_id).with_media(object.id))
    }
}

#[async_trait]
impl PublishAdapter for FacebookAdapter {
    fn provider(&self) -> Provider {
        Provider::Facebook
    }

    #[tracing::instrument(skip_all, fields(upload_id = %asset.id))]
    async fn publish(
        &self,
        credentials: &Credentials,
        asset: &Upload,
        settings: &Value,
    ) -> Result<PublishOutcome, PublishError> {
        let post = self
            .page_post(credentials, asset, settings)
            .await
            .map_err(|e| e.into_publish_error(Provider::Facebook))?;
        info!(post_id = %post.post_id, "published Facebook page post");
        Ok(PublishOutcome::Published(post))
    }
}
