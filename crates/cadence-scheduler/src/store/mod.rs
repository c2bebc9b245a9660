//! Persisted job store contract.
//!
//! The store is the only coordination point between overlapping worker
//! invocations. Every status change goes through [`JobStore::transition`], a
//! compare-and-swap on the status column: it succeeds only if the row is
//! still in one of the expected statuses and reports how many rows it
//! touched. Zero means another invocation got there first.

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{ClaimMode, PostChange, PostStatus, ScheduledPost, SchedulerError, Upload};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Persisted table of scheduled posts.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new post.
    async fn insert_post(&self, post: &ScheduledPost) -> Result<(), SchedulerError>;

    /// Load a post by id.
    async fn get_post(&self, id: &str) -> Result<Option<ScheduledPost>, SchedulerError>;

    /// Posts due at `now` in the given mode, oldest `scheduled_for` first.
    async fn due_posts(
        &self,
        now: DateTime<Utc>,
        mode: ClaimMode,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<ScheduledPost>, SchedulerError>;

    /// Posts waiting on provider-side processing, oldest container first.
    async fn processing_posts(&self, limit: usize) -> Result<Vec<ScheduledPost>, SchedulerError>;

    /// All posts sharing a group id.
    async fn group_posts(&self, group_id: &str) -> Result<Vec<ScheduledPost>, SchedulerError>;

    /// Conditionally apply `change` to post `id`.
    ///
    /// Succeeds only if the post's status is in `expected` at write time.
    /// A [`PostChange::Claim`] additionally requires a failed post to be
    /// under its attempt budget. Returns the number of rows affected (0 or 1).
    async fn transition(
        &self,
        id: &str,
        expected: &[PostStatus],
        change: &PostChange,
    ) -> Result<u64, SchedulerError>;

    /// Record that a group's summary notification was sent for one
    /// generation of the group (the sum of its members' claim attempts).
    ///
    /// Returns `true` only for the first caller per group and generation.
    async fn claim_group_notification(
        &self,
        group_id: &str,
        generation: u64,
    ) -> Result<bool, SchedulerError>;

    /// Look up an upload.
    async fn upload(&self, id: &str) -> Result<Option<Upload>, SchedulerError>;

    /// Point a post at a different upload. Returns rows affected.
    async fn rebind_upload(&self, post_id: &str, upload_id: &str) -> Result<u64, SchedulerError>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Shared assertions run against every store implementation.

    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use super::JobStore;
    use crate::{ClaimMode, ErrorKind, PostChange, PostStatus, Provider, ScheduledPost, Upload};

    pub fn post(id: &str, offset_secs: i64) -> ScheduledPost {
        ScheduledPost::new(
            "user-1",
            "team-1",
            "upload-1",
            Provider::Youtube,
            Utc::now() + Duration::seconds(offset_secs),
        )
        .with_id(id)
    }

    fn claim() -> PostChange {
        PostChange::Claim {
            at: Utc::now(),
            max_attempts: 3,
        }
    }

    pub async fn due_posts_are_ordered_and_bounded(store: &dyn JobStore) {
        for (id, offset) in [("c", -10), ("a", -300), ("d", -5), ("b", -60), ("f", 600)] {
            store.insert_post(&post(id, offset)).await.unwrap();
        }
        store
            .insert_post(&post("draft", -900).with_status(PostStatus::Draft))
            .await
            .unwrap();

        let due = store
            .due_posts(Utc::now(), ClaimMode::Normal, 3, 3)
            .await
            .unwrap();
        let ids: Vec<_> = due.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    pub async fn claim_is_exclusive(store: &dyn JobStore) {
        store.insert_post(&post("p1", -60)).await.unwrap();

        let first = store
            .transition("p1", ClaimMode::Normal.eligible(), &claim())
            .await
            .unwrap();
        let second = store
            .transition("p1", ClaimMode::Normal.eligible(), &claim())
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        let stored = store.get_post("p1").await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Posting);
        assert_eq!(stored.attempts, 1);
    }

    pub async fn concurrent_claims_have_one_winner(store: Arc<dyn JobStore>) {
        store.insert_post(&post("race", -60)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .transition("race", ClaimMode::Normal.eligible(), &claim())
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            winners += handle.await.unwrap();
        }
        assert_eq!(winners, 1);
    }

    pub async fn terminal_posts_are_not_reselected(store: &dyn JobStore) {
        store.insert_post(&post("done", -60)).await.unwrap();
        store
            .transition("done", &[PostStatus::Scheduled], &claim())
            .await
            .unwrap();
        store
            .transition(
                "done",
                &[PostStatus::Posting],
                &PostChange::Failed {
                    kind: ErrorKind::AdapterFailure,
                    message: "boom".to_string(),
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let normal = store
            .due_posts(Utc::now(), ClaimMode::Normal, 3, 5)
            .await
            .unwrap();
        assert!(normal.is_empty());

        let retry = store
            .due_posts(Utc::now(), ClaimMode::Retry, 3, 5)
            .await
            .unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].last_error.as_deref(), Some("boom"));
        assert_eq!(retry[0].error_kind, Some(ErrorKind::AdapterFailure));
    }

    pub async fn retry_claim_respects_attempt_budget(store: &dyn JobStore) {
        let mut exhausted = post("tired", -60).with_status(PostStatus::Failed);
        exhausted.attempts = 3;
        store.insert_post(&exhausted).await.unwrap();

        let due = store
            .due_posts(Utc::now(), ClaimMode::Retry, 3, 5)
            .await
            .unwrap();
        assert!(due.is_empty());

        let rows = store
            .transition("tired", ClaimMode::Retry.eligible(), &claim())
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    pub async fn processing_round_trip(store: &dyn JobStore) {
        let created = Utc::now() - Duration::minutes(2);
        store.insert_post(&post("ig", -60)).await.unwrap();
        store
            .transition("ig", &[PostStatus::Scheduled], &claim())
            .await
            .unwrap();
        let rows = store
            .transition(
                "ig",
                &[PostStatus::Posting],
                &PostChange::Processing {
                    container_id: "container-9".to_string(),
                    created_at: created,
                },
            )
            .await
            .unwrap();
        assert_eq!(rows, 1);

        let processing = store.processing_posts(10).await.unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].container_id.as_deref(), Some("container-9"));
        assert_eq!(
            processing[0].container_created_at.map(|t| t.timestamp()),
            Some(created.timestamp())
        );

        // The claimer never sees ig_processing posts.
        let due = store
            .due_posts(Utc::now(), ClaimMode::Retry, 3, 5)
            .await
            .unwrap();
        assert!(due.is_empty());
    }

    pub async fn wrong_source_status_is_rejected(store: &dyn JobStore) {
        store.insert_post(&post("p", -60)).await.unwrap();
        let rows = store
            .transition(
                "p",
                &[PostStatus::Posting],
                &PostChange::Posted {
                    post_id: "x".to_string(),
                    media_id: None,
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!(rows, 0);
        let stored = store.get_post("p").await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Scheduled);
        assert!(stored.platform_post_id.is_none());
    }

    pub async fn group_notification_claimed_once(store: &dyn JobStore) {
        store
            .insert_post(&post("g1", -60).with_group("grp"))
            .await
            .unwrap();
        store
            .insert_post(&post("g2", -60).with_group("grp"))
            .await
            .unwrap();
        store.insert_post(&post("solo", -60)).await.unwrap();

        let members = store.group_posts("grp").await.unwrap();
        assert_eq!(members.len(), 2);

        assert!(store.claim_group_notification("grp", 2).await.unwrap());
        assert!(!store.claim_group_notification("grp", 2).await.unwrap());
        assert!(store.claim_group_notification("grp", 3).await.unwrap());
        assert!(!store.claim_group_notification("grp", 3).await.unwrap());
        assert!(store.claim_group_notification("other", 2).await.unwrap());
    }

    pub async fn upload_lookup_and_rebind(store: &dyn JobStore, seed: Upload) {
        store.insert_post(&post("p", -60)).await.unwrap();
        assert!(store.upload("missing").await.unwrap().is_none());
        assert_eq!(store.upload(&seed.id).await.unwrap(), Some(seed.clone()));

        assert_eq!(store.rebind_upload("p", &seed.id).await.unwrap(), 1);
        assert_eq!(store.rebind_upload("nope", &seed.id).await.unwrap(), 0);
        let stored = store.get_post("p").await.unwrap().unwrap();
        assert_eq!(stored.upload_id, seed.id);
    }
}
