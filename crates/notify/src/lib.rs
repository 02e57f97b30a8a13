//! Notification sink for environment build lifecycle events.
//!
//! The worker hands every committed build status to [`Notifier::notify`],
//! which delivers it to the configured channels in the background. Delivery
//! failures are logged and never reach the caller.
//!
//! # Configuration
//!
//! - `SLACK_WEBHOOK_URL`: Slack incoming webhook (enables Slack channel)
//! - `STATUS_WEBHOOK_URL`: generic JSON webhook (enables webhook channel)
//! - `NOTIFY_DISABLED`: Set to "true" to disable all notifications

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::slack::SlackChannel;
pub use channels::webhook::WebhookChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{NotifyEvent, Severity};

use std::sync::Arc;
use tracing::{debug, error, info, warn};

const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Fans build events out to every configured channel.
pub struct Notifier {
    channels: Arc<[Arc<dyn NotifyChannel>]>,
}

impl Notifier {
    #[must_use]
    pub fn new(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels: channels.into(),
        }
    }

    /// Channels enabled by `SLACK_WEBHOOK_URL` and `STATUS_WEBHOOK_URL`,
    /// none when `NOTIFY_DISABLED` is set.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .is_ok_and(|v| v.eq_ignore_ascii_case("true") || v == "1");
        if disabled {
            info!("Notifications disabled via NOTIFY_DISABLED");
            return Self::new(vec![]);
        }

        let candidates: [Arc<dyn NotifyChannel>; 2] = [
            Arc::new(SlackChannel::from_env()),
            Arc::new(WebhookChannel::from_env()),
        ];
        let channels: Vec<_> = candidates.into_iter().filter(|c| c.enabled()).collect();

        if channels.is_empty() {
            warn!("No notification channels configured");
        } else {
            let names: Vec<_> = channels.iter().map(|c| c.name()).collect();
            info!(channels = ?names, "Build notifications enabled");
        }
        Self::new(channels)
    }

    /// Deliver in the background and return immediately.
    pub fn notify(&self, event: NotifyEvent) {
        if self.channels.is_empty() {
            debug!(build_uuid = %event.build_uuid(), "No notification channels, dropping event");
            return;
        }

        let channels = Arc::clone(&self.channels);
        tokio::spawn(async move {
            deliver(&channels, &event).await;
        });
    }
}

/// Send `event` to each channel in turn; returns how many deliveries failed.
pub async fn deliver(channels: &[Arc<dyn NotifyChannel>], event: &NotifyEvent) -> usize {
    let mut failed = 0;
    for channel in channels {
        match channel.send(event).await {
            Ok(()) => debug!(channel = channel.name(), "Notification sent"),
            Err(e) => {
                failed += 1;
                error!(
                    channel = channel.name(),
                    build_uuid = %event.build_uuid(),
                    error = %e,
                    "Failed to send notification"
                );
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn torn_down() -> NotifyEvent {
        NotifyEvent::BuildTornDown {
            build_uuid: "quiet-lake-123".to_string(),
            namespace: "env-quiet-lake-123".to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_event_titles() {
        let event = NotifyEvent::BuildStatusChanged {
            build_uuid: "quiet-lake-123".to_string(),
            namespace: "env-quiet-lake-123".to_string(),
            status: "deployed".to_string(),
            failed: false,
            message: None,
            pull_request: Some("org/repo#42".to_string()),
            links: std::collections::BTreeMap::new(),
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(event.title(), "Build quiet-lake-123: deployed");
        assert_eq!(event.severity(), Severity::Info);
        assert_eq!(torn_down().title(), "Build quiet-lake-123 torn down");
    }

    #[tokio::test]
    async fn one_broken_channel_does_not_stop_the_others() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let channels: Vec<Arc<dyn NotifyChannel>> = vec![
            Arc::new(WebhookChannel::new("http://127.0.0.1:9/unreachable".to_string())),
            Arc::new(WebhookChannel::new(format!("{}/status", server.uri()))),
        ];

        assert_eq!(deliver(&channels, &torn_down()).await, 1);
    }

    #[tokio::test]
    async fn notifier_without_channels_drops_events() {
        Notifier::new(vec![]).notify(torn_down());
    }
}
