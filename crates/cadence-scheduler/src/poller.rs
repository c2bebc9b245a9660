//! Completion poller for two-phase publishes.
//!
//! Some providers cannot return a post id right away: the first call only
//! creates a container that the provider processes in the background. The
//! poller runs at the start of every invocation and advances posts parked in
//! `ig_processing` using nothing but the container id and creation time stored
//! on the row, so a restart between invocations loses nothing.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::claim::transition;
use crate::{
    AdapterRegistry, ContainerRef, CredentialSource, ErrorKind, JobStore, PostChange, PostStatus,
    PublishError, ResumeOutcome, ScheduledPost, SchedulerError,
};

/// What happened to one processing post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    /// Processing finished and the post is published.
    Posted { platform_post_id: String },
    /// The provider reported a failure, or the deadline passed.
    Failed { kind: ErrorKind, error: String },
    /// Still processing and within the deadline.
    Pending,
    /// Another invocation advanced the post first.
    Conflict,
}

/// Result of polling one post. `terminal` holds the post as written when it
/// reached `posted` or `failed`, for notification.
#[derive(Debug, Clone, Serialize)]
pub struct PollReport {
    pub post_id: String,
    pub outcome: PollOutcome,
    #[serde(skip)]
    pub terminal: Option<ScheduledPost>,
}

/// Advances `ig_processing` posts.
pub struct CompletionPoller {
    store: Arc<dyn JobStore>,
    adapters: AdapterRegistry,
    credentials: Arc<dyn CredentialSource>,
    batch_size: usize,
    deadline: Duration,
}

impl CompletionPoller {
    pub fn new(
        store: Arc<dyn JobStore>,
        adapters: AdapterRegistry,
        credentials: Arc<dyn CredentialSource>,
        batch_size: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            adapters,
            credentials,
            batch_size,
            deadline,
        }
    }

    /// Poll one batch of processing posts, sequentially.
    #[tracing::instrument(skip(self))]
    pub async fn poll(&self, now: DateTime<Utc>) -> Result<Vec<PollReport>, SchedulerError> {
        let posts = self.store.processing_posts(self.batch_size).await?;
        if !posts.is_empty() {
            debug!(count = posts.len(), "polling processing posts");
        }

        let mut reports = Vec::with_capacity(posts.len());
        for post in posts {
            reports.push(self.advance(&post, now).await);
        }
        Ok(reports)
    }

    #[tracing::instrument(skip(self, post, now), fields(post_id = %post.id, provider = %post.provider))]
    async fn advance(&self, post: &ScheduledPost, now: DateTime<Utc>) -> PollReport {
        let (Some(container_id), Some(created_at)) =
            (post.container_id.clone(), post.container_created_at)
        else {
            return self
                .fail(
                    post,
                    PublishError::processing_error("processing post has no container"),
                )
                .await;
        };

        let Some(adapter) = self.adapters.get(post.provider) else {
            return self
                .fail(
                    post,
                    PublishError::adapter(format!(
                        "no publish adapter registered for {}",
                        post.provider.display_name()
                    )),
                )
                .await;
        };

        let credentials = match self.credentials.credentials(post).await {
            Ok(credentials) => credentials,
            Err(e) => return self.fail(post, e).await,
        };

        let container = ContainerRef { container_id };
        let status = match adapter.resume(&credentials, &container, &post.settings).await {
            Ok(status) => status,
            Err(e) if e.kind == ErrorKind::AccountNotConnected => return self.fail(post, e).await,
            Err(e) => {
                // Treated like "still processing"; the deadline still applies.
                warn!(error = %e, "container status query failed");
                ResumeOutcome::Pending
            }
        };

        match status {
            ResumeOutcome::Published(post_ref) => {
                let change = PostChange::Posted {
                    post_id: post_ref.post_id.clone(),
                    media_id: post_ref.media_id,
                    at: now,
                };
                match self.write(post, change).await {
                    Some(updated) => {
                        info!(platform_post_id = %post_ref.post_id, "two-phase publish completed");
                        PollReport {
                            post_id: post.id.clone(),
                            outcome: PollOutcome::Posted {
                                platform_post_id: post_ref.post_id,
                            },
                            terminal: Some(updated),
                        }
                    }
                    None => conflict(post),
                }
            }
            ResumeOutcome::Failed(reason) => {
                self.fail(post, PublishError::processing_error(reason))
                    .await
            }
            ResumeOutcome::Pending if now - created_at > self.deadline => {
                let message = format!(
                    "{} media processing timed out after {} minutes",
                    post.provider.display_name(),
                    self.deadline.num_minutes()
                );
                self.fail(post, PublishError::processing_timeout(message))
                    .await
            }
            ResumeOutcome::Pending => {
                debug!(elapsed_secs = (now - created_at).num_seconds(), "still processing");
                PollReport {
                    post_id: post.id.clone(),
                    outcome: PollOutcome::Pending,
                    terminal: None,
                }
            }
        }
    }

    async fn fail(&self, post: &ScheduledPost, error: PublishError) -> PollReport {
        warn!(post_id = %post.id, kind = error.kind.as_str(), error = %error.message, "processing post failed");
        let change = PostChange::Failed {
            kind: error.kind,
            message: error.message.clone(),
            at: Utc::now(),
        };
        match self.write(post, change).await {
            Some(updated) => PollReport {
                post_id: post.id.clone(),
                outcome: PollOutcome::Failed {
                    kind: error.kind,
                    error: error.message,
                },
                terminal: Some(updated),
            },
            None => conflict(post),
        }
    }

    /// Conditional write out of `ig_processing`. A store error is logged and
    /// leaves the post for the next invocation.
    async fn write(&self, post: &ScheduledPost, change: PostChange) -> Option<ScheduledPost> {
        match transition(
            self.store.as_ref(),
            post,
            &[PostStatus::IgProcessing],
            change,
        )
        .await
        {
            Ok(updated) => updated,
            Err(e) => {
                warn!(post_id = %post.id, error = %e, "failed to persist poll result");
                None
            }
        }
    }
}

fn conflict(post: &ScheduledPost) -> PollReport {
    debug!(post_id = %post.id, "processing post advanced by another invocation");
    PollReport {
        post_id: post.id.clone(),
        outcome: PollOutcome::Conflict,
        terminal: None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        Credentials, MemoryStore, PostRef, Provider, PublishAdapter, PublishOutcome,
        StoredCredentials, Upload,
    };
    use crate::credentials::ConnectedAccount;

    /// Instagram-like adapter whose container status is scripted per call.
    struct Scripted {
        statuses: Mutex<Vec<Result<ResumeOutcome, PublishError>>>,
    }

    impl Scripted {
        fn new(statuses: Vec<Result<ResumeOutcome, PublishError>>) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses),
            })
        }
    }

    #[async_trait]
    impl PublishAdapter for Scripted {
        fn provider(&self) -> Provider {
            Provider::Instagram
        }

        async fn publish(
            &self,
            _credentials: &Credentials,
            _asset: &Upload,
            _settings: &serde_json::Value,
        ) -> Result<PublishOutcome, PublishError> {
            unreachable!("poller never publishes")
        }

        async fn resume(
            &self,
            _credentials: &Credentials,
            _container: &ContainerRef,
            _settings: &serde_json::Value,
        ) -> Result<ResumeOutcome, PublishError> {
            self.statuses.lock().unwrap().remove(0)
        }
    }

    async fn setup(
        statuses: Vec<Result<ResumeOutcome, PublishError>>,
        container_age: Duration,
    ) -> (Arc<MemoryStore>, CompletionPoller, String) {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_account(ConnectedAccount {
                team_id: "team-1".to_string(),
                provider: Provider::Instagram,
                external_account_id: "ig-user".to_string(),
                access_token: "token".to_string(),
                refresh_token: None,
                expires_at: None,
            })
            .await;

        let mut post = ScheduledPost::new(
            "user-1",
            "team-1",
            "upload-1",
            Provider::Instagram,
            Utc::now() - Duration::minutes(30),
        )
        .with_status(PostStatus::IgProcessing);
        post.container_id = Some("container-1".to_string());
        post.container_created_at = Some(Utc::now() - container_age);
        store.insert_post(&post).await.unwrap();

        let poller = CompletionPoller::new(
            store.clone(),
            AdapterRegistry::new().with(Scripted::new(statuses)),
            Arc::new(StoredCredentials::new(store.clone())),
            10,
            Duration::minutes(10),
        );
        (store, poller, post.id)
    }

    #[tokio::test]
    async fn test_ready_container_is_posted() {
        let ready = ResumeOutcome::Published(PostRef::new("ig-post-1").with_media("media-1"));
        let (store, poller, id) = setup(vec![Ok(ready)], Duration::minutes(1)).await;

        let reports = poller.poll(Utc::now()).await.unwrap();
        assert_eq!(
            reports[0].outcome,
            PollOutcome::Posted {
                platform_post_id: "ig-post-1".to_string()
            }
        );
        assert!(reports[0].terminal.is_some());

        let post = store.get_post(&id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Posted);
        assert_eq!(post.platform_media_id.as_deref(), Some("media-1"));
        assert!(post.last_error.is_none());
    }

    #[tokio::test]
    async fn test_provider_error_fails_post() {
        let (store, poller, id) = setup(
            vec![Ok(ResumeOutcome::Failed("unsupported aspect ratio".to_string()))],
            Duration::minutes(1),
        )
        .await;

        let reports = poller.poll(Utc::now()).await.unwrap();
        assert!(matches!(
            &reports[0].outcome,
            PollOutcome::Failed { kind: ErrorKind::AsyncProcessingError, .. }
        ));
        let post = store.get_post(&id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Failed);
        assert_eq!(post.last_error.as_deref(), Some("unsupported aspect ratio"));
    }

    #[tokio::test]
    async fn test_pending_within_deadline_is_left_alone() {
        let (store, poller, id) = setup(vec![Ok(ResumeOutcome::Pending)], Duration::minutes(4)).await;

        let reports = poller.poll(Utc::now()).await.unwrap();
        assert_eq!(reports[0].outcome, PollOutcome::Pending);
        assert!(reports[0].terminal.is_none());
        let post = store.get_post(&id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::IgProcessing);
    }

    #[tokio::test]
    async fn test_pending_past_deadline_times_out() {
        let (store, poller, id) = setup(vec![Ok(ResumeOutcome::Pending)], Duration::minutes(11)).await;

        poller.poll(Utc::now()).await.unwrap();
        let post = store.get_post(&id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Failed);
        assert_eq!(post.error_kind, Some(ErrorKind::AsyncProcessingTimeout));
        assert!(post.last_error.unwrap().contains("timed out after 10 minutes"));
    }

    #[tokio::test]
    async fn test_transport_error_counts_as_pending() {
        let (store, poller, id) = setup(
            vec![Err(PublishError::adapter("connection reset"))],
            Duration::minutes(2),
        )
        .await;

        let reports = poller.poll(Utc::now()).await.unwrap();
        assert_eq!(reports[0].outcome, PollOutcome::Pending);
        let post = store.get_post(&id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::IgProcessing);
    }

    #[tokio::test]
    async fn test_revoked_token_fails_as_reconnect() {
        let (store, poller, id) = setup(
            vec![Err(PublishError::not_connected("Instagram token expired"))],
            Duration::minutes(2),
        )
        .await;

        poller.poll(Utc::now()).await.unwrap();
        let post = store.get_post(&id).await.unwrap().unwrap();
        assert_eq!(post.error_kind, Some(ErrorKind::AccountNotConnected));
    }

    #[tokio::test]
    async fn test_missing_container_fails_immediately() {
        let (store, poller, id) = setup(vec![], Duration::minutes(1)).await;
        let mut broken = store.get_post(&id).await.unwrap().unwrap();
        broken.id = "broken".to_string();
        broken.container_id = None;
        store.insert_post(&broken).await.unwrap();
        // Only the broken post should be polled.
        store
            .transition(
                &id,
                &[PostStatus::IgProcessing],
                &PostChange::Failed {
                    kind: ErrorKind::AdapterFailure,
                    message: "x".to_string(),
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let reports = poller.poll(Utc::now()).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            &reports[0].outcome,
            PollOutcome::Failed { kind: ErrorKind::AsyncProcessingError, .. }
        ));
    }
}
