//! In-memory store.
//!
//! Used by tests and local runs. A single write lock covers each
//! conditional transition, which gives the same at-most-one-winner
//! guarantee as the SQL `UPDATE ... WHERE status IN (...)`.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::JobStore;
use crate::credentials::{AccountStore, ConnectedAccount};
use crate::notify::{Recipient, RecipientDirectory};
use crate::{ClaimMode, PostChange, PostStatus, Provider, ScheduledPost, SchedulerError, Upload};

#[derive(Default)]
struct State {
    posts: BTreeMap<String, ScheduledPost>,
    uploads: HashMap<String, Upload>,
    notified_groups: HashSet<(String, u64)>,
    accounts: HashMap<(String, Provider), ConnectedAccount>,
    recipients: HashMap<String, Recipient>,
}

/// Job store kept entirely in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_upload(&self, upload: Upload) {
        self.state
            .write()
            .await
            .uploads
            .insert(upload.id.clone(), upload);
    }

    pub async fn upsert_account(&self, account: ConnectedAccount) {
        self.state
            .write()
            .await
            .accounts
            .insert((account.team_id.clone(), account.provider), account);
    }

    pub async fn upsert_recipient(&self, recipient: Recipient) {
        self.state
            .write()
            .await
            .recipients
            .insert(recipient.user_id.clone(), recipient);
    }

    /// Snapshot of every post, for assertions.
    pub async fn all_posts(&self) -> Vec<ScheduledPost> {
        self.state.read().await.posts.values().cloned().collect()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_post(&self, post: &ScheduledPost) -> Result<(), SchedulerError> {
        let mut state = self.state.write().await;
        if state.posts.contains_key(&post.id) {
            return Err(SchedulerError::PostExists(post.id.clone()));
        }
        state.posts.insert(post.id.clone(), post.clone());
        Ok(())
    }

    async fn get_post(&self, id: &str) -> Result<Option<ScheduledPost>, SchedulerError> {
        Ok(self.state.read().await.posts.get(id).cloned())
    }

    async fn due_posts(
        &self,
        now: DateTime<Utc>,
        mode: ClaimMode,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<ScheduledPost>, SchedulerError> {
        let state = self.state.read().await;
        let mut due: Vec<_> = state
            .posts
            .values()
            .filter(|p| p.is_due(now, mode, max_attempts))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for));
        due.truncate(limit);
        Ok(due)
    }

    async fn processing_posts(&self, limit: usize) -> Result<Vec<ScheduledPost>, SchedulerError> {
        let state = self.state.read().await;
        let mut processing: Vec<_> = state
            .posts
            .values()
            .filter(|p| p.status == PostStatus::IgProcessing)
            .cloned()
            .collect();
        processing.sort_by(|a, b| a.container_created_at.cmp(&b.container_created_at));
        processing.truncate(limit);
        Ok(processing)
    }

    async fn group_posts(&self, group_id: &str) -> Result<Vec<ScheduledPost>, SchedulerError> {
        let state = self.state.read().await;
        Ok(state
            .posts
            .values()
            .filter(|p| p.group_id.as_deref() == Some(group_id))
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        id: &str,
        expected: &[PostStatus],
        change: &PostChange,
    ) -> Result<u64, SchedulerError> {
        let mut state = self.state.write().await;
        match state.posts.get_mut(id) {
            Some(post) if post.accepts(expected, change) => {
                post.apply(change);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn claim_group_notification(
        &self,
        group_id: &str,
        generation: u64,
    ) -> Result<bool, SchedulerError> {
        Ok(self
            .state
            .write()
            .await
            .notified_groups
            .insert((group_id.to_string(), generation)))
    }

    async fn upload(&self, id: &str) -> Result<Option<Upload>, SchedulerError> {
        Ok(self.state.read().await.uploads.get(id).cloned())
    }

    async fn rebind_upload(&self, post_id: &str, upload_id: &str) -> Result<u64, SchedulerError> {
        let mut state = self.state.write().await;
        match state.posts.get_mut(post_id) {
            Some(post) => {
                post.upload_id = upload_id.to_string();
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn connected_account(
        &self,
        team_id: &str,
        provider: Provider,
    ) -> Result<Option<ConnectedAccount>, SchedulerError> {
        Ok(self
            .state
            .read()
            .await
            .accounts
            .get(&(team_id.to_string(), provider))
            .cloned())
    }

    async fn save_tokens(
        &self,
        team_id: &str,
        provider: Provider,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.write().await;
        if let Some(account) = state.accounts.get_mut(&(team_id.to_string(), provider)) {
            account.access_token = access_token.to_string();
            if let Some(refresh) = refresh_token {
                account.refresh_token = Some(refresh.to_string());
            }
            account.expires_at = expires_at;
        }
        Ok(())
    }
}

#[async_trait]
impl RecipientDirectory for MemoryStore {
    async fn recipient(&self, user_id: &str) -> Result<Option<Recipient>, SchedulerError> {
        Ok(self.state.read().await.recipients.get(user_id).cloned())
    }
}
