//! Platform integrations for the Cadence publishing worker.
//!
//! This crate implements the worker's external collaborators over HTTP:
//!
//! - **Adapters**: YouTube, TikTok, Facebook, Instagram (two-phase) and
//!   LinkedIn publish adapters
//! - **Token refresh**: an OAuth [`TokenRefresher`] used as the worker's
//!   credential source
//! - **Email**: an [`EmailNotifier`] for outcome and reconnect emails

pub mod adapters;
mod client;
mod email;
mod error;
mod media;
mod refresh;

pub use adapters::{
    DEFAULT_GRAPH_API_URL, FacebookAdapter, InstagramAdapter, LinkedinAdapter, TiktokAdapter,
    YoutubeAdapter, default_registry,
};
pub use email::EmailNotifier;
pub use error::PlatformError;
pub use media::MediaUrls;
pub use refresh::{
    OAuthClient, REFRESH_WINDOW, TokenRefresher, default_token_url, requires_refresh_token,
};
