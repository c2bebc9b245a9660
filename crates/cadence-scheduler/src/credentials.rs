//! Platform credentials.
//!
//! Token refresh lives outside the worker; the worker only asks a
//! [`CredentialSource`] for ready-to-use credentials before each adapter call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Provider, PublishError, ScheduledPost, SchedulerError};

/// A team's connection to one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedAccount {
    pub team_id: String,
    pub provider: Provider,
    /// Channel, page, business account or member id on the platform.
    pub external_account_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Credentials handed to a publish adapter.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub account_id: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("account_id", &self.account_id)
            .finish()
    }
}

impl From<&ConnectedAccount> for Credentials {
    fn from(account: &ConnectedAccount) -> Self {
        Self {
            access_token: account.access_token.clone(),
            account_id: account.external_account_id.clone(),
        }
    }
}

/// Persisted connected accounts.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn connected_account(
        &self,
        team_id: &str,
        provider: Provider,
    ) -> Result<Option<ConnectedAccount>, SchedulerError>;

    /// Store refreshed tokens. A `None` refresh token keeps the existing one.
    async fn save_tokens(
        &self,
        team_id: &str,
        provider: Provider,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), SchedulerError>;
}

/// Produces refreshed credentials for a post's target account.
///
/// Failures are per-post: a missing or unusable account is reported as
/// [`crate::ErrorKind::AccountNotConnected`].
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(&self, post: &ScheduledPost) -> Result<Credentials, PublishError>;
}

/// Message used when a team has no usable connection to a platform.
pub fn not_connected_message(provider: Provider) -> String {
    format!(
        "{} account not connected. Please reconnect your account.",
        provider.display_name()
    )
}

/// Credential source that returns stored tokens without refreshing them.
pub struct StoredCredentials {
    accounts: Arc<dyn AccountStore>,
}

impl StoredCredentials {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl CredentialSource for StoredCredentials {
    async fn credentials(&self, post: &ScheduledPost) -> Result<Credentials, PublishError> {
        let account = self
            .accounts
            .connected_account(&post.team_id, post.provider)
            .await
            .map_err(|e| PublishError::adapter(format!("failed to load account: {}", e)))?
            .ok_or_else(|| PublishError::not_connected(not_connected_message(post.provider)))?;
        Ok(Credentials::from(&account))
    }
}
