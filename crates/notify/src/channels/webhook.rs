//! Generic JSON webhook channel.
//!
//! Posts the serialized [`NotifyEvent`] as-is. Used to hand status changes to
//! the pull-request comment renderer and dashboard, which own presentation.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// Environment variable for the status webhook URL.
const ENV_STATUS_WEBHOOK_URL: &str = "STATUS_WEBHOOK_URL";

/// Header carrying the build identifier so receivers can route without parsing.
const BUILD_HEADER: &str = "X-Lifecycle-Build";

pub struct WebhookChannel {
    url: Option<String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Create a webhook channel from `STATUS_WEBHOOK_URL`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            url: std::env::var(ENV_STATUS_WEBHOOK_URL).ok(),
            client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            url: Some(url),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_STATUS_WEBHOOK_URL.to_string()))?;

        debug!(channel = "webhook", build_uuid = %event.build_uuid(), "Posting event");

        let response = self
            .client
            .post(url)
            .header(BUILD_HEADER, event.build_uuid())
            .json(event)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(channel = "webhook", status = %status, "Status webhook rejected event");
        Err(ChannelError::Rejected {
            channel: "webhook",
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn torn_down() -> NotifyEvent {
        NotifyEvent::BuildTornDown {
            build_uuid: "calm-river-42".to_string(),
            namespace: "env-calm-river-42".to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn posts_event_with_build_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/status"))
            .and(header(BUILD_HEADER, "calm-river-42"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let channel = WebhookChannel::new(format!("{}/status", server.uri()));
        channel.send(&torn_down()).await.unwrap();
    }

    #[tokio::test]
    async fn surfaces_rejection_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let channel = WebhookChannel::new(server.uri());
        let err = channel.send(&torn_down()).await.unwrap_err();
        match err {
            ChannelError::Rejected { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
