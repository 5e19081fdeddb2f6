//! # Failure Alerts
//!
//! Tenants are told when an endpoint keeps failing. The worker raises a
//! [`FailureAlert`] once the consecutive failure count reaches the
//! subscription's alert threshold.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

const MAX_URL_LEN: usize = 2048;
const MAX_SEND_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureAlert {
    pub project_id: Uuid,
    pub endpoint_id: Uuid,
    pub subscription_id: Uuid,
    pub delivery_id: Uuid,
    pub endpoint_url: String,
    pub failure_count: u32,
    pub threshold: u32,
    /// Endpoint health after the failing attempt
    pub endpoint_status: String,
    pub last_error: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid alert url: {0}")]
    InvalidUrl(String),
    #[error("alert delivery failed after {attempts} attempts: {reason}")]
    Failed { attempts: u32, reason: String },
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &FailureAlert) -> Result<(), NotifyError>;
}

/// Writes alerts to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &FailureAlert) -> Result<(), NotifyError> {
        warn!(
            project_id = %alert.project_id,
            endpoint_id = %alert.endpoint_id,
            subscription_id = %alert.subscription_id,
            failure_count = alert.failure_count,
            threshold = alert.threshold,
            endpoint_status = %alert.endpoint_status,
            last_error = %alert.last_error,
            "Endpoint failure threshold reached"
        );
        Ok(())
    }
}

/// Posts alerts as JSON to a fixed URL, retrying with exponential backoff.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: Url,
    initial_backoff: Duration,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        if url.len() > MAX_URL_LEN {
            return Err(NotifyError::InvalidUrl(format!(
                "exceeds {MAX_URL_LEN} characters"
            )));
        }
        let parsed = Url::parse(url).map_err(|e| NotifyError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(NotifyError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            url: parsed,
            initial_backoff: Duration::from_secs(1),
        })
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    fn redacted_target(&self) -> String {
        let host = self.url.host_str().unwrap_or("unknown");
        format!("{}://{}", self.url.scheme(), host)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &FailureAlert) -> Result<(), NotifyError> {
        let target = self.redacted_target();
        let mut delay = self.initial_backoff;
        let mut last_reason = String::new();

        for attempt in 1..=MAX_SEND_ATTEMPTS {
            match self.client.post(self.url.clone()).json(alert).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(
                        endpoint_id = %alert.endpoint_id,
                        target = %target,
                        attempt,
                        "Failure alert sent"
                    );
                    return Ok(());
                }
                Ok(response) => {
                    last_reason = format!("status {}", response.status());
                    warn!(target = %target, attempt, status = %response.status(), "Alert webhook rejected notification");
                }
                Err(err) => {
                    last_reason = err.to_string();
                    error!(target = %target, attempt, error = %err, "Failed to send alert webhook");
                }
            }

            if attempt < MAX_SEND_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(NotifyError::Failed {
            attempts: MAX_SEND_ATTEMPTS,
            reason: last_reason,
        })
    }
}
