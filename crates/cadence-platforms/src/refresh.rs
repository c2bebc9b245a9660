//! OAuth token refresh before each publish.
//!
//! [`TokenRefresher`] is the worker's [`CredentialSource`]: it loads the
//! team's connected account, refreshes the access token when it expires
//! within [`REFRESH_WINDOW`], persists the new tokens and hands the adapter
//! usable credentials. Anything that needs the user to connect again is
//! reported as `AccountNotConnected`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cadence_scheduler::{
    AccountStore, ConnectedAccount, CredentialSource, Credentials, Provider, PublishError,
    ScheduledPost, not_connected_message,
};
use chrono::{Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::client::http_client;

/// Tokens expiring within this window are refreshed first.
pub const REFRESH_WINDOW: Duration = Duration::minutes(5);

/// OAuth application credentials for one provider.
#[derive(Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

impl OAuthClient {
    /// Client for `provider`'s production token endpoint, if it has one.
    pub fn new(
        provider: Provider,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Option<Self> {
        Some(Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: default_token_url(provider)?.to_string(),
        })
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_url", &self.token_url)
            .finish()
    }
}

/// Token endpoints of providers that issue refresh tokens.
///
/// Facebook and Instagram use long-lived tokens without a refresh grant.
pub fn default_token_url(provider: Provider) -> Option<&'static str> {
    match provider {
        Provider::Youtube => Some("https://oauth2.googleapis.com/token"),
        Provider::Tiktok => Some("https://open.tiktokapis.com/v2/oauth/token/"),
        Provider::Linkedin => Some("https://www.linkedin.com/oauth/v2/accessToken"),
        Provider::Facebook | Provider::Instagram => None,
    }
}

/// Providers whose access tokens are short-lived and unusable without a
/// refresh token.
pub fn requires_refresh_token(provider: Provider) -> bool {
    matches!(
        provider,
        Provider::Youtube | Provider::Tiktok | Provider::Linkedin
    )
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Credential source backed by stored accounts and OAuth refresh.
pub struct TokenRefresher {
    accounts: Arc<dyn AccountStore>,
    http: Client,
    clients: HashMap<Provider, OAuthClient>,
}

impl TokenRefresher {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self {
            accounts,
            http: http_client(),
            clients: HashMap::new(),
        }
    }

    pub fn with_client(mut self, provider: Provider, client: OAuthClient) -> Self {
        self.clients.insert(provider, client);
        self
    }

    async fn refresh(
        &self,
        account: &ConnectedAccount,
        refresh_token: &str,
        client: &OAuthClient,
    ) -> Result<Credentials, PublishError> {
        let provider = account.provider;
        let name = provider.display_name();
        // TikTok calls the client id a client key.
        let id_param = if provider == Provider::Tiktok {
            "client_key"
        } else {
            "client_id"
        };

        let response = self
            .http
            .post(&client.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                (id_param, client.client_id.as_str()),
                ("client_secret", client.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PublishError::adapter(format!("{} token refresh failed: {}", name, e)))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            PublishError::adapter(format!(
                "{} token refresh failed ({}): failed to read response: {}",
                name, status, e
            ))
        })?;
        let parsed: Option<TokenResponse> = serde_json::from_str(&body).ok();

        if let Some(TokenResponse {
            error: Some(error),
            error_description,
            ..
        }) = &parsed
        {
            if error == "invalid_grant" {
                warn!(provider = %provider, "refresh token rejected");
                return Err(PublishError::not_connected(format!(
                    "{} refresh token was rejected ({}). Please reconnect your account.",
                    name,
                    error_description.as_deref().unwrap_or(error)
                )));
            }
        }

        let tokens = match parsed {
            Some(TokenResponse {
                access_token: Some(access_token),
                refresh_token,
                expires_in,
                ..
            }) if status.is_success() => (access_token, refresh_token, expires_in),
            _ => {
                return Err(PublishError::adapter(format!(
                    "{} token refresh failed ({}): {}",
                    name, status, body
                )));
            }
        };
        let (access_token, new_refresh_token, expires_in) = tokens;
        let expires_at = expires_in.map(|secs| Utc::now() + Duration::seconds(secs));

        if let Err(e) = self
            .accounts
            .save_tokens(
                &account.team_id,
                provider,
                &access_token,
                new_refresh_token.as_deref(),
                expires_at,
            )
            .await
        {
            // The fresh token is still good for this publish.
            warn!(provider = %provider, error = %e, "failed to persist refreshed tokens");
        }
        info!(provider = %provider, team_id = %account.team_id, "refreshed access token");

        Ok(Credentials {
            access_token,
            account_id: account.external_account_id.clone(),
        })
    }
}

#[async_trait]
impl CredentialSource for TokenRefresher {
    #[tracing::instrument(skip_all, fields(post_id = %post.id, provider = %post.provider))]
    async fn credentials(&self, post: &ScheduledPost) -> Result<Credentials, PublishError> {
        let provider = post.provider;
        let account = self
            .accounts
            .connected_account(&post.team_id, provider)
            .await
            .map_err(|e| PublishError::adapter(format!("failed to load account: {}", e)))?
            .ok_or_else(|| PublishError::not_connected(not_connected_message(provider)))?;

        if requires_refresh_token(provider) && account.refresh_token.is_none() {
            return Err(PublishError::not_connected(not_connected_message(provider)));
        }

        let now = Utc::now();
        let Some(expires_at) = account.expires_at else {
            return Ok(Credentials::from(&account));
        };
        if expires_at > now + REFRESH_WINDOW {
            return Ok(Credentials::from(&account));
        }

        match (account.refresh_token.as_deref(), self.clients.get(&provider)) {
            (Some(refresh_token), Some(client)) => {
                self.refresh(&account, refresh_token, client).await
            }
            _ if expires_at <= now => Err(PublishError::not_connected(format!(
                "{} access token expired. Please reconnect your account.",
                provider.display_name()
            ))),
            _ => {
                debug!("token expires soon but cannot be refreshed here");
                Ok(Credentials::from(&account))
            }
        }
    }
}
