//! Scheduler types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ErrorKind;

/// Target platform of a scheduled post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Youtube,
    Tiktok,
    Facebook,
    Instagram,
    Linkedin,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::Youtube,
        Provider::Tiktok,
        Provider::Facebook,
        Provider::Instagram,
        Provider::Linkedin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Youtube => "youtube",
            Provider::Tiktok => "tiktok",
            Provider::Facebook => "facebook",
            Provider::Instagram => "instagram",
            Provider::Linkedin => "linkedin",
        }
    }

    /// Human-readable platform name for messages and emails.
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Youtube => "YouTube",
            Provider::Tiktok => "TikTok",
            Provider::Facebook => "Facebook",
            Provider::Instagram => "Instagram",
            Provider::Linkedin => "LinkedIn",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown provider: {}", s))
    }
}

/// Lifecycle status of a scheduled post.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    /// Not yet scheduled; never eligible.
    Draft,
    /// Waiting for its scheduled time.
    #[default]
    Scheduled,
    /// Claimed by an invocation; publish in flight.
    Posting,
    /// Two-phase publish waiting on provider-side processing.
    IgProcessing,
    /// Published.
    Posted,
    /// Publishing failed.
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Posting => "posting",
            PostStatus::IgProcessing => "ig_processing",
            PostStatus::Posted => "posted",
            PostStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(PostStatus::Draft),
            "scheduled" => Some(PostStatus::Scheduled),
            "posting" => Some(PostStatus::Posting),
            "ig_processing" => Some(PostStatus::IgProcessing),
            "posted" => Some(PostStatus::Posted),
            "failed" => Some(PostStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PostStatus::Posted | PostStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Transitions are monotonic apart from the retry path `failed -> posting`.
    pub fn can_transition_to(&self, next: PostStatus) -> bool {
        use PostStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Scheduled, Posting)
                | (Failed, Posting)
                | (Posting, Posted)
                | (Posting, Failed)
                | (Posting, IgProcessing)
                | (IgProcessing, Posted)
                | (IgProcessing, Failed)
        )
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which statuses an invocation may claim from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClaimMode {
    /// Only `scheduled` posts.
    #[default]
    Normal,
    /// `scheduled` and `failed` posts.
    Retry,
}

impl ClaimMode {
    pub fn from_retry_flag(retry_failed: bool) -> Self {
        if retry_failed {
            ClaimMode::Retry
        } else {
            ClaimMode::Normal
        }
    }

    pub fn eligible(&self) -> &'static [PostStatus] {
        match self {
            ClaimMode::Normal => &[PostStatus::Scheduled],
            ClaimMode::Retry => &[PostStatus::Scheduled, PostStatus::Failed],
        }
    }
}

/// A post scheduled for publication to one platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledPost {
    pub id: String,
    pub owner_id: String,
    pub team_id: String,
    /// Links posts created together for several platforms.
    pub group_id: Option<String>,
    pub upload_id: String,
    pub thumbnail_ref: Option<String>,
    pub provider: Provider,
    /// Provider-specific settings (title, caption, privacy, ...).
    pub settings: serde_json::Value,
    pub scheduled_for: DateTime<Utc>,
    pub status: PostStatus,
    pub platform_post_id: Option<String>,
    pub platform_media_id: Option<String>,
    pub last_error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub posted_at: Option<DateTime<Utc>>,
    /// Provider-side processing handle (two-phase publish only).
    pub container_id: Option<String>,
    pub container_created_at: Option<DateTime<Utc>>,
    /// Number of times this post has been claimed.
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledPost {
    /// Create a new post in the `scheduled` state.
    pub fn new(
        owner_id: impl Into<String>,
        team_id: impl Into<String>,
        upload_id: impl Into<String>,
        provider: Provider,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            team_id: team_id.into(),
            group_id: None,
            upload_id: upload_id.into(),
            thumbnail_ref: None,
            provider,
            settings: serde_json::Value::Object(Default::default()),
            scheduled_for,
            status: PostStatus::Scheduled,
            platform_post_id: None,
            platform_media_id: None,
            last_error: None,
            error_kind: None,
            posted_at: None,
            container_id: None,
            container_created_at: None,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_status(mut self, status: PostStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether this post may be claimed at `now` in the given mode.
    ///
    /// Failed posts that have used up `max_attempts` claims are never due.
    pub fn is_due(&self, now: DateTime<Utc>, mode: ClaimMode, max_attempts: u32) -> bool {
        self.scheduled_for <= now && self.is_claimable(mode.eligible(), max_attempts)
    }

    /// Whether the status (and attempt budget) allows a claim, ignoring time.
    pub fn is_claimable(&self, eligible: &[PostStatus], max_attempts: u32) -> bool {
        if !eligible.contains(&self.status) {
            return false;
        }
        self.status != PostStatus::Failed || self.attempts < max_attempts
    }

    /// Whether a conditional write of `change` expecting `expected` would
    /// succeed against this post.
    pub fn accepts(&self, expected: &[PostStatus], change: &PostChange) -> bool {
        if !expected.contains(&self.status) {
            return false;
        }
        match change {
            PostChange::Claim { max_attempts, .. } => self.is_claimable(expected, *max_attempts),
            _ => true,
        }
    }

    /// Apply a state change in place.
    ///
    /// Callers check the expected source status first; this only writes fields.
    pub fn apply(&mut self, change: &PostChange) {
        match change {
            PostChange::Claim { at, .. } => {
                self.status = PostStatus::Posting;
                self.attempts += 1;
                self.updated_at = *at;
            }
            PostChange::Posted {
                post_id,
                media_id,
                at,
            } => {
                self.status = PostStatus::Posted;
                self.platform_post_id = Some(post_id.clone());
                self.platform_media_id = media_id.clone();
                self.posted_at = Some(*at);
                self.last_error = None;
                self.error_kind = None;
                self.updated_at = *at;
            }
            PostChange::Processing {
                container_id,
                created_at,
            } => {
                self.status = PostStatus::IgProcessing;
                self.container_id = Some(container_id.clone());
                self.container_created_at = Some(*created_at);
                self.last_error = None;
                self.error_kind = None;
                self.updated_at = *created_at;
            }
            PostChange::Failed { kind, message, at } => {
                self.status = PostStatus::Failed;
                self.last_error = Some(message.clone());
                self.error_kind = Some(*kind);
                self.updated_at = *at;
            }
        }
    }
}

/// A state change written through a conditional store update.
#[derive(Debug, Clone, PartialEq)]
pub enum PostChange {
    /// Take ownership: `-> posting`. Failed posts need `attempts < max_attempts`.
    Claim {
        at: DateTime<Utc>,
        max_attempts: u32,
    },
    /// Published: `-> posted`.
    Posted {
        post_id: String,
        media_id: Option<String>,
        at: DateTime<Utc>,
    },
    /// Container created, processing deferred: `-> ig_processing`.
    Processing {
        container_id: String,
        created_at: DateTime<Utc>,
    },
    /// Failed: `-> failed`.
    Failed {
        kind: ErrorKind,
        message: String,
        at: DateTime<Utc>,
    },
}

impl PostChange {
    /// The status a post ends up in after this change.
    pub fn target(&self) -> PostStatus {
        match self {
            PostChange::Claim { .. } => PostStatus::Posting,
            PostChange::Posted { .. } => PostStatus::Posted,
            PostChange::Processing { .. } => PostStatus::IgProcessing,
            PostChange::Failed { .. } => PostStatus::Failed,
        }
    }
}

/// A stored media asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    pub id: String,
    pub bucket: String,
    pub path: String,
    pub mime_type: String,
}

impl Upload {
    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn post_at(offset_secs: i64) -> ScheduledPost {
        ScheduledPost::new(
            "owner",
            "team",
            "upload",
            Provider::Youtube,
            Utc::now() + Duration::seconds(offset_secs),
        )
    }

    fn any_status() -> impl Strategy<Value = PostStatus> {
        prop_oneof![
            Just(PostStatus::Draft),
            Just(PostStatus::Scheduled),
            Just(PostStatus::Posting),
            Just(PostStatus::IgProcessing),
            Just(PostStatus::Posted),
            Just(PostStatus::Failed),
        ]
    }

    #[test]
    fn test_new_post_is_scheduled() {
        let post = post_at(0);
        assert_eq!(post.status, PostStatus::Scheduled);
        assert_eq!(post.attempts, 0);
        assert!(post.group_id.is_none());
    }

    #[test]
    fn test_past_scheduled_post_is_due() {
        let post = post_at(-60);
        assert!(post.is_due(Utc::now(), ClaimMode::Normal, 3));
    }

    #[test]
    fn test_future_post_not_due() {
        let post = post_at(3600);
        assert!(!post.is_due(Utc::now(), ClaimMode::Normal, 3));
    }

    #[test]
    fn test_draft_never_due() {
        let post = post_at(-60).with_status(PostStatus::Draft);
        assert!(!post.is_due(Utc::now(), ClaimMode::Normal, 3));
        assert!(!post.is_due(Utc::now(), ClaimMode::Retry, 3));
    }

    #[test]
    fn test_failed_due_only_in_retry_mode() {
        let mut post = post_at(-60).with_status(PostStatus::Failed);
        post.attempts = 1;
        assert!(!post.is_due(Utc::now(), ClaimMode::Normal, 3));
        assert!(post.is_due(Utc::now(), ClaimMode::Retry, 3));
    }

    #[test]
    fn test_failed_post_at_attempt_limit_not_due() {
        let mut post = post_at(-60).with_status(PostStatus::Failed);
        post.attempts = 3;
        assert!(!post.is_due(Utc::now(), ClaimMode::Retry, 3));
    }

    #[test]
    fn test_apply_posted_clears_error() {
        let mut post = post_at(-60);
        post.apply(&PostChange::Claim {
            at: Utc::now(),
            max_attempts: 3,
        });
        post.last_error = Some("old".to_string());
        post.error_kind = Some(ErrorKind::AdapterFailure);
        post.apply(&PostChange::Posted {
            post_id: "vid-1".to_string(),
            media_id: None,
            at: Utc::now(),
        });
        assert_eq!(post.status, PostStatus::Posted);
        assert_eq!(post.platform_post_id.as_deref(), Some("vid-1"));
        assert!(post.last_error.is_none());
        assert!(post.error_kind.is_none());
        assert!(post.posted_at.is_some());
        assert_eq!(post.attempts, 1);
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("instagram".parse::<Provider>(), Ok(Provider::Instagram));
        assert!("myspace".parse::<Provider>().is_err());
    }

    proptest! {
        // Terminal states only leave through the retry path.
        #[test]
        fn terminal_states_only_exit_to_posting(from in any_status(), to in any_status()) {
            if from.is_terminal() && from.can_transition_to(to) {
                prop_assert_eq!(from, PostStatus::Failed);
                prop_assert_eq!(to, PostStatus::Posting);
            }
        }

        // Nothing transitions back into scheduled or draft from a later state.
        #[test]
        fn no_transition_back_to_scheduled(from in any_status()) {
            prop_assert!(!from.can_transition_to(PostStatus::Draft));
            if from != PostStatus::Draft {
                prop_assert!(!from.can_transition_to(PostStatus::Scheduled));
            }
        }

        // The claimer never moves ig_processing posts.
        #[test]
        fn ig_processing_never_claimable(retry in any::<bool>(), attempts in 0u32..10) {
            let mut post = post_at(-60).with_status(PostStatus::IgProcessing);
            post.attempts = attempts;
            let mode = ClaimMode::from_retry_flag(retry);
            prop_assert!(!post.is_due(Utc::now(), mode, 10));
        }

        #[test]
        fn status_round_trips(status in any_status()) {
            prop_assert_eq!(PostStatus::parse(status.as_str()), Some(status));
        }
    }
}
