//! Publish adapters, one per platform.
//!
//! Every adapter takes a configurable API base URL so tests can point it at
//! a mock server, and a [`MediaUrls`] resolver for platforms that pull media
//! from a public URL.

mod facebook;
mod instagram;
mod linkedin;
mod tiktok;
mod youtube;

use std::sync::Arc;

use cadence_scheduler::AdapterRegistry;
use serde_json::Value;

pub use facebook::FacebookAdapter;
pub use instagram::InstagramAdapter;
pub use linkedin::LinkedinAdapter;
pub use tiktok::TiktokAdapter;
pub use youtube::YoutubeAdapter;

use crate::MediaUrls;

/// Graph API root shared by Facebook and Instagram.
pub const DEFAULT_GRAPH_API_URL: &str = "https://graph.facebook.com/v19.0";

/// Registry with every platform adapter at its production URL.
pub fn default_registry(media: MediaUrls) -> AdapterRegistry {
    AdapterRegistry::new()
        .with(Arc::new(YoutubeAdapter::new(media.clone())))
        .with(Arc::new(TiktokAdapter::new(media.clone())))
        .with(Arc::new(FacebookAdapter::new(media.clone())))
        .with(Arc::new(InstagramAdapter::new(media.clone())))
        .with(Arc::new(LinkedinAdapter::new(media)))
}

/// First non-empty string setting among `keys`.
pub(crate) fn text_setting<'a>(settings: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| settings.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

pub(crate) fn bool_setting(settings: &Value, key: &str) -> bool {
    settings.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use cadence_scheduler::{Credentials, Upload};

    pub fn credentials(account_id: &str) -> Credentials {
        Credentials {
            access_token: "test-access-token".to_string(),
            account_id: account_id.to_string(),
        }
    }

    pub fn video() -> Upload {
        Upload {
            id: "upload-1".to_string(),
            bucket: "media".to_string(),
            path: "team-1/clip.mp4".to_string(),
            mime_type: "video/mp4".to_string(),
        }
    }

    pub fn image() -> Upload {
        Upload {
            id: "upload-2".to_string(),
            bucket: "media".to_string(),
            path: "team-1/photo.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
        }
    }
}
