//! Public URLs for stored uploads.

use cadence_scheduler::Upload;

/// Resolves an upload to the URL platforms fetch it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUrls {
    base_url: String,
}

impl MediaUrls {
    /// `base_url` is the public root of the object store, e.g.
    /// `https://cdn.example.com/storage/v1/object/public`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, upload: &Upload) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            upload.bucket.trim_matches('/'),
            upload.path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_upload() {
        let urls = MediaUrls::new("https://cdn.example.com/public/");
        let upload = Upload {
            id: "u1".to_string(),
            bucket: "media".to_string(),
            path: "/team-1/clip.mp4".to_string(),
            mime_type: "video/mp4".to_string(),
        };
        assert_eq!(
            urls.url_for(&upload),
            "https://cdn.example.com/public/media/team-1/clip.mp4"
        );
    }
}
