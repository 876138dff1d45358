//! Operator alert channels for halted cycles.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub subject: String,
    pub cycle_id: Uuid,
    pub stage: String,
    pub cause: String,
    pub raised_at: DateTime<Utc>,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        error!(
            cycle_id = %alert.cycle_id,
            stage = %alert.stage,
            cause = %alert.cause,
            "{}",
            alert.subject
        );
        Ok(())
    }
}

/// Posts the alert as JSON. The log line is always written as well.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        LogAlertSink.notify(alert).await?;
        self.client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .with_context(|| format!("posting alert to {}", self.url))?
            .error_for_status()
            .with_context(|| format!("alert webhook {} rejected the alert", self.url))?;
        Ok(())
    }
}

/// Picks the webhook sink when a URL is configured.
pub fn sink_for(webhook_url: Option<&str>) -> Result<Box<dyn AlertSink>> {
    match webhook_url {
        Some(url) => Ok(Box::new(WebhookAlertSink::new(url)?)),
        None => Ok(Box::new(LogAlertSink)),
    }
}
