//! Notification dispatch.
//!
//! Called right after a post reaches a terminal status. Ungrouped posts get
//! one email matching the outcome. Grouped posts (one upload scheduled to
//! several platforms) wait until every sibling is terminal, then exactly one
//! invocation sends a single summary plus reconnect notices. Retrying a
//! sibling reopens the group, so the retried outcome is reported too.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{JobStore, PostStatus, Provider, ScheduledPost, SchedulerError};

/// Messages that read like an account connection problem.
static RECONNECT_SIGNATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)not connected|reconnect|expired").expect("reconnect pattern is valid")
});

/// Substring heuristic for reconnect-type failures.
///
/// Only consulted for posts without a structured error kind; it can
/// misclassify messages that merely mention expiry.
pub fn is_reconnect_message(message: &str) -> bool {
    RECONNECT_SIGNATURE.is_match(message)
}

/// Whether a failed post should route to the reconnect path.
pub fn is_reconnect_failure(post: &ScheduledPost) -> bool {
    if post.status != PostStatus::Failed {
        return false;
    }
    match post.error_kind {
        Some(kind) => kind.is_reconnect(),
        None => post.last_error.as_deref().is_some_and(is_reconnect_message),
    }
}

/// Per-user notification flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub on_success: bool,
    pub on_failure: bool,
    pub on_reconnect: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            on_success: true,
            on_failure: true,
            on_reconnect: true,
        }
    }
}

/// Who gets notified about a user's posts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub user_id: String,
    pub email: String,
    pub preferences: NotificationPreferences,
}

/// Looks up notification recipients by user id.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn recipient(&self, user_id: &str) -> Result<Option<Recipient>, SchedulerError>;
}

/// One platform's line in a group summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformOutcome {
    pub post_id: String,
    pub provider: Provider,
    pub status: PostStatus,
    pub platform_post_id: Option<String>,
    pub error: Option<String>,
}

impl From<&ScheduledPost> for PlatformOutcome {
    fn from(post: &ScheduledPost) -> Self {
        Self {
            post_id: post.id.clone(),
            provider: post.provider,
            status: post.status,
            platform_post_id: post.platform_post_id.clone(),
            error: post.last_error.clone(),
        }
    }
}

/// A notification could not be delivered.
#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Sends notifications. Calls are awaited so delivery completes before the
/// invocation returns.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post_succeeded(&self, to: &str, post: &ScheduledPost) -> Result<(), NotifyError>;

    async fn post_failed(&self, to: &str, post: &ScheduledPost) -> Result<(), NotifyError>;

    async fn reconnect_needed(
        &self,
        to: &str,
        provider: Provider,
        message: &str,
    ) -> Result<(), NotifyError>;

    async fn group_summary(
        &self,
        to: &str,
        group_id: &str,
        outcomes: &[PlatformOutcome],
    ) -> Result<(), NotifyError>;
}

/// Notifier that only writes log lines.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn post_succeeded(&self, to: &str, post: &ScheduledPost) -> Result<(), NotifyError> {
        info!(to, post_id = %post.id, provider = %post.provider, "post published");
        Ok(())
    }

    async fn post_failed(&self, to: &str, post: &ScheduledPost) -> Result<(), NotifyError> {
        info!(to, post_id = %post.id, provider = %post.provider, error = ?post.last_error, "post failed");
        Ok(())
    }

    async fn reconnect_needed(
        &self,
        to: &str,
        provider: Provider,
        message: &str,
    ) -> Result<(), NotifyError> {
        info!(to, %provider, message, "account reconnect needed");
        Ok(())
    }

    async fn group_summary(
        &self,
        to: &str,
        group_id: &str,
        outcomes: &[PlatformOutcome],
    ) -> Result<(), NotifyError> {
        info!(to, group_id, platforms = outcomes.len(), "group summary");
        Ok(())
    }
}

/// What the dispatcher did for one terminal post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// Emails handed to the notifier (failed deliveries are logged, not counted).
    Sent(usize),
    /// The recipient's preferences turned this notification off.
    Suppressed,
    /// The owner has no recipient record.
    NoRecipient,
    /// The post is not terminal yet.
    NotTerminal,
    /// Some group siblings are still in flight.
    GroupPending { remaining: usize },
    /// Another invocation already sent this group's summary.
    GroupAlreadyNotified,
}

/// Decides when and what to notify.
pub struct NotificationDispatcher {
    store: Arc<dyn JobStore>,
    directory: Arc<dyn RecipientDirectory>,
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        directory: Arc<dyn RecipientDirectory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            directory,
            notifier,
        }
    }

    /// Notify about a post that just reached a terminal status.
    #[tracing::instrument(skip(self, post), fields(post_id = %post.id, status = %post.status))]
    pub async fn dispatch(
        &self,
        post: &ScheduledPost,
    ) -> Result<NotificationOutcome, SchedulerError> {
        if !post.status.is_terminal() {
            return Ok(NotificationOutcome::NotTerminal);
        }
        match &post.group_id {
            Some(group_id) => self.dispatch_group(post, group_id).await,
            None => self.dispatch_single(post).await,
        }
    }

    async fn dispatch_single(
        &self,
        post: &ScheduledPost,
    ) -> Result<NotificationOutcome, SchedulerError> {
        let Some(recipient) = self.directory.recipient(&post.owner_id).await? else {
            debug!(owner_id = %post.owner_id, "no recipient for post owner");
            return Ok(NotificationOutcome::NoRecipient);
        };
        let prefs = recipient.preferences;
        let to = recipient.email.as_str();

        let result = match post.status {
            PostStatus::Posted if prefs.on_success => self.notifier.post_succeeded(to, post).await,
            PostStatus::Failed if is_reconnect_failure(post) => {
                if !prefs.on_reconnect {
                    return Ok(NotificationOutcome::Suppressed);
                }
                let message = post.last_error.as_deref().unwrap_or_default();
                self.notifier
                    .reconnect_needed(to, post.provider, message)
                    .await
            }
            PostStatus::Failed if prefs.on_failure => self.notifier.post_failed(to, post).await,
            _ => return Ok(NotificationOutcome::Suppressed),
        };

        Ok(NotificationOutcome::Sent(delivered(result)))
    }

    async fn dispatch_group(
        &self,
        post: &ScheduledPost,
        group_id: &str,
    ) -> Result<NotificationOutcome, SchedulerError> {
        let siblings = self.store.group_posts(group_id).await?;
        let remaining = siblings
            .iter()
            .filter(|p| !p.status.is_terminal())
            .count();
        if remaining > 0 {
            debug!(group_id, remaining, "group not finished, deferring notification");
            return Ok(NotificationOutcome::GroupPending { remaining });
        }

        let Some(recipient) = self.directory.recipient(&post.owner_id).await? else {
            debug!(owner_id = %post.owner_id, "no recipient for group owner");
            return Ok(NotificationOutcome::NoRecipient);
        };

        // Every claim bumps `attempts`, so a retried sibling opens a new
        // generation and the group is reported again once it settles.
        let generation = group_generation(&siblings);
        if !self
            .store
            .claim_group_notification(group_id, generation)
            .await?
        {
            debug!(group_id, generation, "group already notified");
            return Ok(NotificationOutcome::GroupAlreadyNotified);
        }
        let prefs = recipient.preferences;
        let to = recipient.email.as_str();

        let any_posted = siblings.iter().any(|p| p.status == PostStatus::Posted);
        let any_failed = siblings.iter().any(|p| p.status == PostStatus::Failed);
        let summary_wanted = (any_posted && prefs.on_success) || (any_failed && prefs.on_failure);
        let mut sent = 0;

        if summary_wanted {
            let outcomes: Vec<PlatformOutcome> = siblings.iter().map(PlatformOutcome::from).collect();
            sent += delivered(self.notifier.group_summary(to, group_id, &outcomes).await);
        }

        if prefs.on_reconnect {
            let mut seen = HashSet::new();
            for sibling in siblings.iter().filter(|p| is_reconnect_failure(p)) {
                if !seen.insert(sibling.provider) {
                    continue;
                }
                let message = sibling.last_error.as_deref().unwrap_or_default();
                sent += delivered(
                    self.notifier
                        .reconnect_needed(to, sibling.provider, message)
                        .await,
                );
            }
        }

        info!(group_id, platforms = siblings.len(), sent, "group notification dispatched");
        if sent == 0 && !summary_wanted {
            return Ok(NotificationOutcome::Suppressed);
        }
        Ok(NotificationOutcome::Sent(sent))
    }
}

fn group_generation(siblings: &[ScheduledPost]) -> u64 {
    siblings.iter().map(|p| u64::from(p.attempts)).sum()
}

fn delivered(result: Result<(), NotifyError>) -> usize {
    match result {
        Ok(()) => 1,
        Err(e) => {
            warn!(error = %e, "notification delivery failed");
            0
        }
    }
}
