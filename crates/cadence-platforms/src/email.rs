//! Email notifications through an HTTP email API.
//!
//! Sends `POST {api_url}/emails` with a bearer key and a JSON body of
//! `from`, `to`, `subject` and `text`.

use async_trait::async_trait;
use cadence_scheduler::{
    Notifier, NotifyError, PlatformOutcome, PostStatus, Provider, ScheduledPost,
};
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::client::http_client;

#[derive(Debug, Serialize)]
struct Email<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    text: String,
}

/// Notifier that delivers plain-text emails.
pub struct EmailNotifier {
    http: Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl EmailNotifier {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            http: http_client(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            from: from.into(),
        }
    }

    async fn send(&self, to: &str, subject: String, text: String) -> Result<(), NotifyError> {
        let email = Email {
            from: &self.from,
            to: [to],
            subject,
            text,
        };
        let response = self
            .http
            .post(format!("{}/emails", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&email)
            .send()
            .await
            .map_err(|e| NotifyError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError(format!("email API returned {}: {}", status, body)));
        }
        debug!(subject = %email.subject, "sent email");
        Ok(())
    }
}

fn scheduled_line(post: &ScheduledPost) -> String {
    format!(
        "Scheduled for {}.",
        post.scheduled_for.format("%Y-%m-%d %H:%M UTC")
    )
}

fn outcome_line(outcome: &PlatformOutcome) -> String {
    let name = outcome.provider.display_name();
    match (outcome.status, &outcome.error) {
        (PostStatus::Posted, _) => format!("- {}: published", name),
        (_, Some(error)) => format!("- {}: failed ({})", name, error),
        (status, None) => format!("- {}: {}", name, status),
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn post_succeeded(&self, to: &str, post: &ScheduledPost) -> Result<(), NotifyError> {
        let name = post.provider.display_name();
        let mut text = format!("Your post is live on {}.\n{}\n", name, scheduled_line(post));
        if let Some(id) = &post.platform_post_id {
            text.push_str(&format!("{} post id: {}\n", name, id));
        }
        self.send(to, format!("Your {} post is live", name), text)
            .await
    }

    async fn post_failed(&self, to: &str, post: &ScheduledPost) -> Result<(), NotifyError> {
        let name = post.provider.display_name();
        let reason = post.last_error.as_deref().unwrap_or("unknown error");
        let text = format!(
            "We could not publish your post to {}.\n{}\nReason: {}\n",
            name,
            scheduled_line(post),
            reason
        );
        self.send(to, format!("Your {} post failed", name), text)
            .await
    }

    async fn reconnect_needed(
        &self,
        to: &str,
        provider: Provider,
        message: &str,
    ) -> Result<(), NotifyError> {
        let name = provider.display_name();
        let text = format!(
            "{}\n\nReconnect your {} account to keep publishing. Posts scheduled to {} will fail until you do.\n",
            message, name, name
        );
        self.send(to, format!("Reconnect your {} account", name), text)
            .await
    }

    async fn group_summary(
        &self,
        to: &str,
        _group_id: &str,
        outcomes: &[PlatformOutcome],
    ) -> Result<(), NotifyError> {
        let posted = outcomes
            .iter()
            .filter(|o| o.status == PostStatus::Posted)
            .count();
        let subject = format!(
            "Your post was published to {} of {} platforms",
            posted,
            outcomes.len()
        );
        let lines: Vec<String> = outcomes.iter().map(outcome_line).collect();
        let text = format!("{}\n\n{}\n", subject, lines.join("\n"));
        self.send(to, subject, text).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn notifier(mock_server: &MockServer) -> EmailNotifier {
        EmailNotifier::new(mock_server.uri(), "re_test", "Cadence <noreply@example.com>")
    }

    fn posted() -> ScheduledPost {
        let mut post = ScheduledPost::new("u", "t", "up", Provider::Youtube, Utc::now())
            .with_status(PostStatus::Posted);
        post.platform_post_id = Some("yt-123".to_string());
        post
    }

    #[tokio::test]
    async fn test_success_email() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .and(header("authorization", "Bearer re_test"))
            .and(body_partial_json(serde_json::json!({
                "from": "Cadence <noreply@example.com>",
                "to": ["owner@example.com"],
                "subject": "Your YouTube post is live"
            })))
            .and(body_string_contains("yt-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "email-1"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        notifier(&mock_server)
            .post_succeeded("owner@example.com", &posted())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_group_summary_lists_every_platform() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .and(body_partial_json(serde_json::json!({
                "subject": "Your post was published to 1 of 2 platforms"
            })))
            .and(body_string_contains("TikTok: failed (TikTok account not connected"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let outcomes = vec![
            PlatformOutcome {
                post_id: "a".to_string(),
                provider: Provider::Youtube,
                status: PostStatus::Posted,
                platform_post_id: Some("yt-1".to_string()),
                error: None,
            },
            PlatformOutcome {
                post_id: "b".to_string(),
                provider: Provider::Tiktok,
                status: PostStatus::Failed,
                platform_post_id: None,
                error: Some("TikTok account not connected. Please reconnect your account.".to_string()),
            },
        ];
        notifier(&mock_server)
            .group_summary("owner@example.com", "group-1", &outcomes)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_api_error_is_reported() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid from address"))
            .mount(&mock_server)
            .await;

        let err = notifier(&mock_server)
            .reconnect_needed("owner@example.com", Provider::Linkedin, "expired")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("422"));
    }
}
