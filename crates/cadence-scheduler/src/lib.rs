//! Scheduled post publishing worker for Cadence.
//!
//! This crate provides the core of the publishing worker:
//! - A job store contract whose conditional status update is the only
//!   coordination between overlapping invocations
//! - Claim-based ownership so a post is published at most once locally
//! - A completion poller for providers that publish in two phases
//! - A notification dispatcher that waits for multi-platform groups
//!
//! Platform adapters, token refresh and email delivery are supplied by the
//! caller through the [`PublishAdapter`], [`CredentialSource`] and
//! [`Notifier`] traits.

mod adapter;
mod claim;
mod credentials;
mod error;
mod notify;
mod poller;
mod store;
mod types;
mod worker;

pub use adapter::{
    AdapterRegistry, ContainerRef, PostRef, PublishAdapter, PublishOutcome, ResumeOutcome,
};
pub use claim::{Claim, Claimer};
pub use credentials::{
    AccountStore, ConnectedAccount, CredentialSource, Credentials, StoredCredentials,
    not_connected_message,
};
pub use error::{ErrorKind, PublishError, SchedulerError};
pub use notify::{
    LogNotifier, NotificationDispatcher, NotificationOutcome, NotificationPreferences, Notifier,
    NotifyError, PlatformOutcome, Recipient, RecipientDirectory, is_reconnect_failure,
    is_reconnect_message,
};
pub use poller::{CompletionPoller, PollOutcome, PollReport};
pub use store::{JobStore, MemoryStore, SqliteStore};
pub use types::{ClaimMode, PostChange, PostStatus, Provider, ScheduledPost, Upload};
pub use worker::{InvocationRequest, InvocationResponse, JobResult, Worker, WorkerConfig};
