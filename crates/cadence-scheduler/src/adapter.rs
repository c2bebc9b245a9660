//! Platform publish adapter contract and registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Credentials, Provider, PublishError, Upload};

/// Final reference to a published post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRef {
    pub post_id: String,
    pub media_id: Option<String>,
}

impl PostRef {
    pub fn new(post_id: impl Into<String>) -> Self {
        Self {
            post_id: post_id.into(),
            media_id: None,
        }
    }

    pub fn with_media(mut self, media_id: impl Into<String>) -> Self {
        self.media_id = Some(media_id.into());
        self
    }
}

/// Provider-side processing handle returned by the first phase of a
/// two-phase publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub container_id: String,
}

/// Result of a publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Published synchronously.
    Published(PostRef),
    /// Container created; completion is deferred to the poller.
    Container(ContainerRef),
}

/// Result of resuming a two-phase publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Processing finished and the post was published.
    Published(PostRef),
    /// The provider reported that processing failed.
    Failed(String),
    /// Still processing.
    Pending,
}

/// A per-provider implementation of the uniform publish contract.
///
/// Adapters receive already-refreshed credentials and must return a
/// descriptive error rather than swallow failures. They are not idempotent:
/// the claim step is the only guard against publishing twice.
#[async_trait]
pub trait PublishAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    async fn publish(
        &self,
        credentials: &Credentials,
        asset: &Upload,
        settings: &serde_json::Value,
    ) -> Result<PublishOutcome, PublishError>;

    /// Advance a container created by [`PublishAdapter::publish`].
    async fn resume(
        &self,
        _credentials: &Credentials,
        _container: &ContainerRef,
        _settings: &serde_json::Value,
    ) -> Result<ResumeOutcome, PublishError> {
        Err(PublishError::adapter(format!(
            "{} does not support two-phase publishing",
            self.provider().display_name()
        )))
    }
}

/// Adapters keyed by provider.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn PublishAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own provider, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn PublishAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn PublishAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn PublishAdapter>> {
        self.adapters.get(&provider).cloned()
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<_> = self.adapters.keys().copied().collect();
        providers.sort_by_key(|p| p.as_str());
        providers
    }
}
