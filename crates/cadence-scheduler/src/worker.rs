//! One worker invocation.
//!
//! An invocation first advances two-phase posts that are still processing,
//! then claims and publishes a bounded batch of due posts, one at a time.
//! Per-post failures are recorded on the post and never abort the batch;
//! only a failure to query the store is reported as an invocation error.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::claim::transition;
use crate::{
    AdapterRegistry, Claim, ClaimMode, Claimer, CompletionPoller, CredentialSource, JobStore,
    NotificationDispatcher, Notifier, PostChange, PostStatus, PublishError,
    PublishOutcome, RecipientDirectory, ScheduledPost, SchedulerError,
};

/// Worker knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Due posts claimed per invocation.
    pub batch_size: usize,
    /// Processing posts polled per invocation.
    pub poll_batch_size: usize,
    /// How long a container may process before the post fails.
    pub processing_deadline: Duration,
    /// Claims allowed per post before retry mode gives up on it.
    pub max_attempts: u32,
    /// Honour the asset rebind parameter.
    pub allow_test_overrides: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            poll_batch_size: 10,
            processing_deadline: Duration::minutes(10),
            max_attempts: 3,
            allow_test_overrides: false,
        }
    }
}

/// Trigger parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvocationRequest {
    /// Process exactly this post, regardless of `scheduled_for`.
    pub job_id: Option<String>,
    /// Also claim `failed` posts.
    pub retry_failed: bool,
    /// Include a diagnostic payload in the response.
    pub debug: bool,
    /// Rebind the single post to another upload first (test overrides only).
    pub upload_id: Option<String>,
}

/// Per-post line of an invocation response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ig_processing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl JobResult {
    fn new(id: &str, ok: bool) -> Self {
        Self {
            id: id.to_string(),
            ok,
            platform_post_id: None,
            error: None,
            skipped: false,
            ig_processing: false,
            container_id: None,
        }
    }

    pub fn posted(id: &str, platform_post_id: impl Into<String>) -> Self {
        Self {
            platform_post_id: Some(platform_post_id.into()),
            ..Self::new(id, true)
        }
    }

    pub fn processing(id: &str, container_id: impl Into<String>) -> Self {
        Self {
            ig_processing: true,
            container_id: Some(container_id.into()),
            ..Self::new(id, true)
        }
    }

    /// Lost the claim; not an error.
    pub fn skipped(id: &str) -> Self {
        Self {
            skipped: true,
            ..Self::new(id, true)
        }
    }

    pub fn failed(id: &str, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(id, false)
        }
    }
}

/// Response body of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub ok: bool,
    pub processed: usize,
    pub results: Vec<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InvocationResponse {
    pub fn completed(results: Vec<JobResult>) -> Self {
        Self {
            ok: true,
            processed: results.len(),
            results,
            debug: None,
            error: None,
        }
    }

    /// Invocation-level failure: nothing was processed.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            processed: 0,
            results: Vec::new(),
            debug: None,
            error: Some(error.into()),
        }
    }
}

/// Runs invocations against one store.
pub struct Worker {
    store: Arc<dyn JobStore>,
    adapters: AdapterRegistry,
    credentials: Arc<dyn CredentialSource>,
    claimer: Claimer,
    poller: CompletionPoller,
    dispatcher: NotificationDispatcher,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        adapters: AdapterRegistry,
        credentials: Arc<dyn CredentialSource>,
        directory: Arc<dyn RecipientDirectory>,
        notifier: Arc<dyn Notifier>,
        config: WorkerConfig,
    ) -> Self {
        let claimer = Claimer::new(store.clone(), config.batch_size, config.max_attempts);
        let poller = CompletionPoller::new(
            store.clone(),
            adapters.clone(),
            credentials.clone(),
            config.poll_batch_size,
            config.processing_deadline,
        );
        let dispatcher = NotificationDispatcher::new(store.clone(), directory, notifier);
        Self {
            store,
            adapters,
            credentials,
            claimer,
            poller,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn run(
        &self,
        request: &InvocationRequest,
    ) -> Result<InvocationResponse, SchedulerError> {
        self.run_at(request, Utc::now()).await
    }

    /// Run one invocation as of `now`.
    #[tracing::instrument(skip(self, now), fields(retry_failed = request.retry_failed))]
    pub async fn run_at(
        &self,
        request: &InvocationRequest,
        now: DateTime<Utc>,
    ) -> Result<InvocationResponse, SchedulerError> {
        let mode = ClaimMode::from_retry_flag(request.retry_failed);

        let polled = self.poller.poll(now).await?;
        for report in &polled {
            if let Some(post) = &report.terminal {
                self.notify(post).await;
            }
        }

        let mut results = Vec::new();
        let candidates = match &request.job_id {
            Some(job_id) => match self.single(job_id, request).await? {
                Some(post) => vec![post],
                None => {
                    results.push(JobResult::failed(job_id, "post not found"));
                    Vec::new()
                }
            },
            None => self.claimer.due(now, mode).await?,
        };

        for post in &candidates {
            results.push(self.process(post, mode, now).await);
        }

        let published = results.iter().filter(|r| r.platform_post_id.is_some()).count();
        let failed = results.iter().filter(|r| !r.ok).count();
        let skipped = results.iter().filter(|r| r.skipped).count();
        info!(
            polled = polled.len(),
            processed = results.len(),
            published,
            failed,
            skipped,
            "invocation complete"
        );

        let debug = request.debug.then(|| {
            let candidate_ids: Vec<&str> = candidates.iter().map(|p| p.id.as_str()).collect();
            serde_json::json!({
                "now": now,
                "retryFailed": request.retry_failed,
                "batchSize": self.config.batch_size,
                "maxAttempts": self.config.max_attempts,
                "polled": polled,
                "candidates": candidate_ids,
            })
        });

        Ok(InvocationResponse {
            debug,
            ..InvocationResponse::completed(results)
        })
    }

    /// Load the post named by a single-job override, applying the asset
    /// rebind when allowed.
    async fn single(
        &self,
        job_id: &str,
        request: &InvocationRequest,
    ) -> Result<Option<ScheduledPost>, SchedulerError> {
        if let Some(upload_id) = &request.upload_id {
            if self.config.allow_test_overrides {
                let rows = self.store.rebind_upload(job_id, upload_id).await?;
                debug!(job_id, upload_id, rows, "rebound post upload");
            } else {
                warn!(job_id, "ignoring upload override; test overrides are disabled");
            }
        }
        self.store.get_post(job_id).await
    }

    /// Claim, publish and record one post.
    #[tracing::instrument(skip(self, post, now), fields(post_id = %post.id, provider = %post.provider))]
    async fn process(&self, post: &ScheduledPost, mode: ClaimMode, now: DateTime<Utc>) -> JobResult {
        let claimed = match self.claimer.claim(post, mode).await {
            Ok(Claim::Won(claimed)) => claimed,
            Ok(Claim::Conflict) => return JobResult::skipped(&post.id),
            Err(e) => {
                warn!(error = %e, "claim failed");
                return JobResult::failed(&post.id, e.to_string());
            }
        };

        match self.publish(&claimed).await {
            Ok(PublishOutcome::Published(post_ref)) => {
                let change = PostChange::Posted {
                    post_id: post_ref.post_id.clone(),
                    media_id: post_ref.media_id,
                    at: now,
                };
                match self.record(&claimed, change).await {
                    Ok(updated) => {
                        info!(platform_post_id = %post_ref.post_id, "post published");
                        self.notify(&updated).await;
                        JobResult::posted(&post.id, post_ref.post_id)
                    }
                    Err(error) => JobResult::failed(&post.id, error),
                }
            }
            Ok(PublishOutcome::Container(container)) => {
                let change = PostChange::Processing {
                    container_id: container.container_id.clone(),
                    created_at: now,
                };
                match self.record(&claimed, change).await {
                    Ok(_) => {
                        info!(container_id = %container.container_id, "media container processing");
                        JobResult::processing(&post.id, container.container_id)
                    }
                    Err(error) => JobResult::failed(&post.id, error),
                }
            }
            Err(e) => {
                warn!(kind = e.kind.as_str(), error = %e.message, "publish failed");
                let change = PostChange::Failed {
                    kind: e.kind,
                    message: e.message.clone(),
                    at: now,
                };
                if let Ok(updated) = self.record(&claimed, change).await {
                    self.notify(&updated).await;
                }
                JobResult::failed(&post.id, e.message)
            }
        }
    }

    async fn publish(&self, post: &ScheduledPost) -> Result<PublishOutcome, PublishError> {
        let upload = self
            .store
            .upload(&post.upload_id)
            .await
            .map_err(|e| PublishError::adapter(format!("failed to load upload: {}", e)))?
            .ok_or_else(|| {
                PublishError::asset_missing(format!("upload {} not found", post.upload_id))
            })?;

        let adapter = self.adapters.get(post.provider).ok_or_else(|| {
            PublishError::adapter(format!(
                "no publish adapter registered for {}",
                post.provider.display_name()
            ))
        })?;

        let credentials = self.credentials.credentials(post).await?;
        adapter
            .publish(&credentials, &upload, &post.settings)
            .await
    }

    /// Conditional write out of `posting`; the error string is what the
    /// caller reports for the post.
    async fn record(
        &self,
        post: &ScheduledPost,
        change: PostChange,
    ) -> Result<ScheduledPost, String> {
        match transition(self.store.as_ref(), post, &[PostStatus::Posting], change).await {
            Ok(Some(updated)) => Ok(updated),
            Ok(None) => {
                warn!(post_id = %post.id, "post left posting while it was being published");
                Err("post status changed during publish".to_string())
            }
            Err(e) => {
                warn!(post_id = %post.id, error = %e, "failed to record publish result");
                Err(e.to_string())
            }
        }
    }

    async fn notify(&self, post: &ScheduledPost) {
        match self.dispatcher.dispatch(post).await {
            Ok(outcome) => debug!(post_id = %post.id, ?outcome, "notification dispatched"),
            Err(e) => warn!(post_id = %post.id, error = %e, "notification dispatch failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_job_result_serializes_only_present_fields() {
        let posted = serde_json::to_value(JobResult::posted("p1", "yt-1")).unwrap();
        assert_eq!(
            posted,
            serde_json::json!({"id": "p1", "ok": true, "platformPostId": "yt-1"})
        );

        let skipped = serde_json::to_value(JobResult::skipped("p2")).unwrap();
        assert_eq!(skipped, serde_json::json!({"id": "p2", "ok": true, "skipped": true}));

        let processing = serde_json::to_value(JobResult::processing("p3", "c-1")).unwrap();
        assert_eq!(
            processing,
            serde_json::json!({"id": "p3", "ok": true, "igProcessing": true, "containerId": "c-1"})
        );
    }

    #[test]
    fn test_failure_response_shape() {
        let body = serde_json::to_value(InvocationResponse::failure("unauthorized")).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"ok": false, "processed": 0, "results": [], "error": "unauthorized"})
        );
    }

    #[test]
    fn test_request_accepts_camel_case() {
        let request: InvocationRequest =
            serde_json::from_str(r#"{"jobId": "p1", "retryFailed": true}"#).unwrap();
        assert_eq!(request.job_id.as_deref(), Some("p1"));
        assert!(request.retry_failed);
        assert!(!request.debug);
        assert!(request.upload_id.is_none());
    }

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.poll_batch_size, 10);
        assert_eq!(config.processing_deadline, Duration::minutes(10));
        assert_eq!(config.max_attempts, 3);
        assert!(!config.allow_test_overrides);
    }
}
