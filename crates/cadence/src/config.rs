//! Worker configuration and wiring.

use std::sync::Arc;

use cadence_platforms::{EmailNotifier, MediaUrls, OAuthClient, TokenRefresher, default_registry};
use cadence_scheduler::{LogNotifier, Notifier, Provider, SqliteStore, Worker, WorkerConfig};
use clap::Args;
use clap::builder::RangedU64ValueParser;
use miette::Result;
use tracing::{info, warn};

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
pub fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

fn positive_usize() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::<usize>::new().range(1..)
}

/// Options shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    /// SQLite database path
    #[arg(long, global = true, env = "CADENCE_DATABASE", default_value = "cadence.db")]
    pub database: String,

    /// Posts claimed per invocation
    #[arg(
        long,
        global = true,
        env = "CADENCE_BATCH_SIZE",
        default_value = "5",
        value_parser = positive_usize()
    )]
    pub batch_size: usize,

    /// Processing posts polled per invocation
    #[arg(
        long,
        global = true,
        env = "CADENCE_POLL_BATCH_SIZE",
        default_value = "10",
        value_parser = positive_usize()
    )]
    pub poll_batch_size: usize,

    /// Seconds a two-phase publish may spend in provider-side processing
    #[arg(
        long,
        global = true,
        env = "CADENCE_PROCESSING_DEADLINE_SECS",
        default_value = "600",
        value_parser = clap::value_parser!(i64).range(1..)
    )]
    pub processing_deadline_secs: i64,

    /// Claims allowed per post before retries stop
    #[arg(
        long,
        global = true,
        env = "CADENCE_MAX_ATTEMPTS",
        default_value = "3",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_attempts: u32,

    /// Honour the `uploadId` rebind parameter (test environments only)
    #[arg(
        long,
        global = true,
        env = "CADENCE_ALLOW_TEST_OVERRIDES",
        value_parser = parse_bool_env,
        default_value = "false"
    )]
    pub allow_test_overrides: bool,

    /// Public base URL uploads are served from
    #[arg(
        long,
        global = true,
        env = "CADENCE_PUBLIC_MEDIA_URL",
        default_value = "http://localhost:9000/storage/v1/object/public"
    )]
    pub public_media_url: String,

    /// Email API base URL; without it notifications are only logged
    #[arg(long, global = true, env = "CADENCE_EMAIL_API_URL")]
    pub email_api_url: Option<String>,

    /// Email API key
    #[arg(long, global = true, env = "CADENCE_EMAIL_API_KEY", hide_env_values = true)]
    pub email_api_key: Option<String>,

    /// Sender address for notification emails
    #[arg(
        long,
        global = true,
        env = "CADENCE_EMAIL_FROM",
        default_value = "Cadence <notifications@cadence.local>"
    )]
    pub email_from: String,

    #[command(flatten)]
    pub oauth: OAuthArgs,
}

/// OAuth client credentials used to refresh platform tokens.
#[derive(Debug, Clone, Default, Args)]
pub struct OAuthArgs {
    #[arg(long, global = true, env = "CADENCE_GOOGLE_CLIENT_ID")]
    pub google_client_id: Option<String>,

    #[arg(long, global = true, env = "CADENCE_GOOGLE_CLIENT_SECRET", hide_env_values = true)]
    pub google_client_secret: Option<String>,

    #[arg(long, global = true, env = "CADENCE_TIKTOK_CLIENT_KEY")]
    pub tiktok_client_key: Option<String>,

    #[arg(long, global = true, env = "CADENCE_TIKTOK_CLIENT_SECRET", hide_env_values = true)]
    pub tiktok_client_secret: Option<String>,

    #[arg(long, global = true, env = "CADENCE_LINKEDIN_CLIENT_ID")]
    pub linkedin_client_id: Option<String>,

    #[arg(
        long,
        global = true,
        env = "CADENCE_LINKEDIN_CLIENT_SECRET",
        hide_env_values = true
    )]
    pub linkedin_client_secret: Option<String>,
}

impl OAuthArgs {
    /// Configured clients, keyed by provider.
    pub fn clients(&self) -> Vec<(Provider, OAuthClient)> {
        let pairs = [
            (
                Provider::Youtube,
                &self.google_client_id,
                &self.google_client_secret,
            ),
            (
                Provider::Tiktok,
                &self.tiktok_client_key,
                &self.tiktok_client_secret,
            ),
            (
                Provider::Linkedin,
                &self.linkedin_client_id,
                &self.linkedin_client_secret,
            ),
        ];

        pairs
            .into_iter()
            .filter_map(|(provider, id, secret)| match (id, secret) {
                (Some(id), Some(secret)) => {
                    OAuthClient::new(provider, id, secret).map(|client| (provider, client))
                }
                (None, None) => None,
                _ => {
                    warn!(%provider, "OAuth client id and secret must both be set, ignoring");
                    None
                }
            })
            .collect()
    }
}

impl WorkerArgs {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.batch_size,
            poll_batch_size: self.poll_batch_size,
            processing_deadline: chrono::Duration::seconds(self.processing_deadline_secs),
            max_attempts: self.max_attempts,
            allow_test_overrides: self.allow_test_overrides,
        }
    }

    fn notifier(&self) -> Arc<dyn Notifier> {
        match (&self.email_api_url, &self.email_api_key) {
            (Some(url), Some(key)) => {
                info!(api_url = %url, "email notifications enabled");
                Arc::new(EmailNotifier::new(url, key, &self.email_from))
            }
            _ => {
                info!("email API not configured, notifications will only be logged");
                Arc::new(LogNotifier)
            }
        }
    }

    /// Open the database and assemble a worker.
    pub fn build_worker(&self) -> Result<Worker> {
        let store = Arc::new(
            SqliteStore::open(&self.database)
                .map_err(|e| miette::miette!("failed to open database {}: {}", self.database, e))?,
        );

        let mut refresher = TokenRefresher::new(store.clone());
        for (provider, client) in self.oauth.clients() {
            info!(%provider, "token refresh enabled");
            refresher = refresher.with_client(provider, client);
        }

        let adapters = default_registry(MediaUrls::new(&self.public_media_url));
        let config = self.worker_config();
        info!(
            database = %self.database,
            batch_size = config.batch_size,
            max_attempts = config.max_attempts,
            providers = ?adapters.providers(),
            "worker configured"
        );

        Ok(Worker::new(
            store.clone(),
            adapters,
            Arc::new(refresher),
            store,
            self.notifier(),
            config,
        ))
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        worker: WorkerArgs,
    }

    #[test]
    fn test_parse_bool_env() {
        assert_eq!(parse_bool_env("TRUE"), Ok(true));
        assert_eq!(parse_bool_env("on"), Ok(true));
        assert_eq!(parse_bool_env(""), Ok(false));
        assert!(parse_bool_env("maybe").is_err());
    }

    #[test]
    fn test_defaults_match_worker_config() {
        let cli = TestCli::parse_from(["cadence"]);
        let config = cli.worker.worker_config();
        let defaults = WorkerConfig::default();
        assert_eq!(config.batch_size, defaults.batch_size);
        assert_eq!(config.poll_batch_size, defaults.poll_batch_size);
        assert_eq!(config.processing_deadline, defaults.processing_deadline);
        assert_eq!(config.max_attempts, defaults.max_attempts);
        assert!(!config.allow_test_overrides);
    }

    #[test]
    fn test_zero_or_negative_limits_are_rejected() {
        for args in [
            ["cadence", "--batch-size", "0"],
            ["cadence", "--poll-batch-size", "0"],
            ["cadence", "--processing-deadline-secs", "-5"],
            ["cadence", "--processing-deadline-secs", "0"],
            ["cadence", "--max-attempts", "0"],
        ] {
            assert!(TestCli::try_parse_from(args).is_err(), "{:?} accepted", args);
        }

        let cli = TestCli::parse_from(["cadence", "--batch-size", "1", "--max-attempts", "1"]);
        assert_eq!(cli.worker.batch_size, 1);
        assert_eq!(cli.worker.max_attempts, 1);
    }

    #[test]
    fn test_incomplete_oauth_pair_is_ignored() {
        let cli = TestCli::parse_from([
            "cadence",
            "--google-client-id",
            "gid",
            "--google-client-secret",
            "gsecret",
            "--linkedin-client-id",
            "lid",
        ]);
        let providers: Vec<Provider> = cli
            .worker
            .oauth
            .clients()
            .into_iter()
            .map(|(provider, _)| provider)
            .collect();
        assert_eq!(providers, vec![Provider::Youtube]);
    }

    #[test]
    fn test_build_worker_opens_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cadence.db");
        let cli = TestCli::parse_from(["cadence", "--database", db.to_str().unwrap()]);
        let worker = cli.worker.build_worker().unwrap();
        assert_eq!(worker.config().batch_size, 5);
        assert!(db.exists());
    }
}
