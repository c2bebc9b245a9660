//! Due-post selection and claim-based ownership.
//!
//! An invocation owns a post only after its conditional update moved the
//! post out of an eligible status. Every later write for that post is also
//! conditional on the status the owner left it in.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{ClaimMode, JobStore, PostChange, PostStatus, ScheduledPost, SchedulerError};

/// Result of trying to take ownership of a post.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// This invocation owns the post; it is now `posting`.
    Won(ScheduledPost),
    /// Zero rows affected: another invocation got there first, or the post
    /// is no longer eligible.
    Conflict,
}

/// Selects due posts and claims them.
pub struct Claimer {
    store: Arc<dyn JobStore>,
    batch_size: usize,
    max_attempts: u32,
}

impl Claimer {
    pub fn new(store: Arc<dyn JobStore>, batch_size: usize, max_attempts: u32) -> Self {
        Self {
            store,
            batch_size,
            max_attempts,
        }
    }

    /// Up to one batch of due posts, oldest first.
    ///
    /// A failure here is an invocation-level defect and is propagated.
    #[tracing::instrument(skip(self))]
    pub async fn due(
        &self,
        now: DateTime<Utc>,
        mode: ClaimMode,
    ) -> Result<Vec<ScheduledPost>, SchedulerError> {
        let due = self
            .store
            .due_posts(now, mode, self.max_attempts, self.batch_size)
            .await?;
        debug!(count = due.len(), "selected due posts");
        Ok(due)
    }

    /// Conditionally move `post` to `posting`.
    #[tracing::instrument(skip(self, post), fields(post_id = %post.id, from = %post.status))]
    pub async fn claim(
        &self,
        post: &ScheduledPost,
        mode: ClaimMode,
    ) -> Result<Claim, SchedulerError> {
        let change = PostChange::Claim {
            at: Utc::now(),
            max_attempts: self.max_attempts,
        };
        match transition(self.store.as_ref(), post, mode.eligible(), change).await? {
            Some(claimed) => {
                info!(attempt = claimed.attempts, "claimed post");
                Ok(Claim::Won(claimed))
            }
            None => {
                debug!("post already claimed elsewhere");
                Ok(Claim::Conflict)
            }
        }
    }
}

/// Apply `change` if the stored post is still in one of `expected`.
///
/// Returns the post as it now looks, or `None` when the conditional update
/// affected no rows.
pub(crate) async fn transition(
    store: &dyn JobStore,
    post: &ScheduledPost,
    expected: &[PostStatus],
    change: PostChange,
) -> Result<Option<ScheduledPost>, SchedulerError> {
    let rows = store.transition(&post.id, expected, &change).await?;
    if rows == 0 {
        return Ok(None);
    }
    if rows > 1 {
        warn!(post_id = %post.id, rows, "conditional update touched more than one row");
    }

    let mut updated = post.clone();
    updated.apply(&change);
    Ok(Some(updated))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::{MemoryStore, Provider};

    fn claimer(store: &Arc<MemoryStore>, batch_size: usize) -> Claimer {
        Claimer::new(store.clone(), batch_size, 3)
    }

    #[tokio::test]
    async fn test_claim_then_conflict() {
        let store = Arc::new(MemoryStore::new());
        let post = ScheduledPost::new(
            "u",
            "t",
            "up",
            Provider::Youtube,
            Utc::now() - Duration::minutes(1),
        );
        store.insert_post(&post).await.unwrap();
        let claimer = claimer(&store, 5);

        let first = claimer.claim(&post, ClaimMode::Normal).await.unwrap();
        let Claim::Won(claimed) = first else {
            panic!("expected to win the claim");
        };
        assert_eq!(claimed.status, PostStatus::Posting);
        assert_eq!(claimed.attempts, 1);

        // A second invocation holding the same stale snapshot loses.
        let second = claimer.claim(&post, ClaimMode::Normal).await.unwrap();
        assert_eq!(second, Claim::Conflict);
    }

    #[tokio::test]
    async fn test_due_respects_batch_size() {
        let store = Arc::new(MemoryStore::new());
        for minutes in 1..=8 {
            let post = ScheduledPost::new(
                "u",
                "t",
                "up",
                Provider::Tiktok,
                Utc::now() - Duration::minutes(minutes),
            );
            store.insert_post(&post).await.unwrap();
        }

        let due = claimer(&store, 5)
            .due(Utc::now(), ClaimMode::Normal)
            .await
            .unwrap();
        assert_eq!(due.len(), 5);
        assert!(due.windows(2).all(|w| w[0].scheduled_for <= w[1].scheduled_for));
    }

    #[tokio::test]
    async fn test_failed_post_claimed_only_in_retry_mode() {
        let store = Arc::new(MemoryStore::new());
        let mut post = ScheduledPost::new(
            "u",
            "t",
            "up",
            Provider::Linkedin,
            Utc::now() - Duration::minutes(1),
        )
        .with_status(PostStatus::Failed);
        post.attempts = 1;
        store.insert_post(&post).await.unwrap();
        let claimer = claimer(&store, 5);

        assert_eq!(
            claimer.claim(&post, ClaimMode::Normal).await.unwrap(),
            Claim::Conflict
        );
        assert!(matches!(
            claimer.claim(&post, ClaimMode::Retry).await.unwrap(),
            Claim::Won(p) if p.attempts == 2
        ));
    }
}
