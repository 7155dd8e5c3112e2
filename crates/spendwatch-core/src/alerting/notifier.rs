//! Notification delivery for spending alerts

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ChannelsConfig;
use crate::error::{Error, Result};
use crate::models::{AlertNotification, Severity};

/// An outbound notification target
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name used in logs, metrics and delivery records
    fn name(&self) -> &str;

    /// Deliver one alert. Called at most once per emitted alert.
    async fn send(&self, alert: &AlertNotification) -> std::result::Result<(), NotificationError>;
}

/// Notification errors
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// Request failed or the endpoint answered with an error status
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// No answer within the send timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for NotificationError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpError(err.to_string())
    }
}

/// Build the shared HTTP client for all channels
pub fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(concat!("spendwatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::config(format!("Failed to create HTTP client: {e}")))
}

/// Channels configured in `config`
pub fn channels_from_config(config: &ChannelsConfig) -> Result<Vec<Arc<dyn NotificationChannel>>> {
    let client = http_client()?;
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();

    if let Some(url) = non_empty(&config.slack_webhook_url) {
        channels.push(Arc::new(SlackChannel::new(client.clone(), url)));
    }
    if let Some(url) = non_empty(&config.discord_webhook_url) {
        channels.push(Arc::new(DiscordChannel::new(client.clone(), url)));
    }
    for url in config.webhook_urls.iter().filter(|u| !u.trim().is_empty()) {
        channels.push(Arc::new(WebhookChannel::new(client.clone(), url)));
    }

    if channels.is_empty() {
        warn!("No notification channels configured, alerts will only be logged");
    }

    Ok(channels)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

async fn post_json<T: Serialize + ?Sized>(
    client: &Client,
    url: &str,
    payload: &T,
    channel: &str,
) -> std::result::Result<(), NotificationError> {
    let response = client.post(url).json(payload).send().await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(NotificationError::HttpError(format!(
            "{channel} returned {status}: {body}"
        )));
    }

    Ok(())
}

fn money(amount: Decimal, dp: u32) -> String {
    format!("${}", amount.round_dp(dp))
}

fn headline(alert: &AlertNotification) -> String {
    match alert.severity {
        Severity::Exceeded => format!("🚨 {} spending limit exceeded", capitalize(alert.kind.name())),
        _ => format!("⚠️ {} spending approaching limit", capitalize(alert.kind.name())),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Slack incoming webhook
pub struct SlackChannel {
    client: Client,
    webhook_url: String,
}

impl SlackChannel {
    /// Post to a Slack incoming webhook URL
    pub fn new(client: Client, webhook_url: impl Into<String>) -> Self {
        Self {
            client,
            webhook_url: webhook_url.into(),
        }
    }

    fn payload(alert: &AlertNotification) -> SlackPayload {
        let color = match alert.severity {
            Severity::Exceeded => "danger",
            _ => "warning",
        };

        SlackPayload {
            text: headline(alert),
            attachments: vec![SlackAttachment {
                color: color.to_string(),
                text: alert.message(),
                fields: vec![
                    SlackField::short("Window", format!(
                        "{} - {}",
                        alert.window_start.format("%Y-%m-%d %H:%M"),
                        alert.window_end.format("%Y-%m-%d %H:%M")
                    )),
                    SlackField::short("Total Spend", money(alert.sum_cost, 4)),
                    SlackField::short("Limit", money(alert.limit, 2)),
                    SlackField::short("Overage", money(alert.overage(), 4)),
                    SlackField::short("Request Count", alert.event_count.to_string()),
                ],
                footer: "Spendwatch".to_string(),
                ts: alert.triggered_at.timestamp(),
            }],
        }
    }
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, alert: &AlertNotification) -> std::result::Result<(), NotificationError> {
        post_json(&self.client, &self.webhook_url, &Self::payload(alert), "Slack").await?;
        info!(kind = %alert.kind, severity = %alert.severity, "Slack notification sent");
        Ok(())
    }
}

/// Discord webhook
pub struct DiscordChannel {
    client: Client,
    webhook_url: String,
}

impl DiscordChannel {
    /// Post to a Discord webhook URL
    pub fn new(client: Client, webhook_url: impl Into<String>) -> Self {
        Self {
            client,
            webhook_url: webhook_url.into(),
        }
    }

    fn payload(alert: &AlertNotification) -> DiscordPayload {
        let color = match alert.severity {
            Severity::Exceeded => 0xd3_2f2f,
            _ => 0xff_c107,
        };

        DiscordPayload {
            content: headline(alert),
            embeds: vec![DiscordEmbed {
                title: format!("{} window", alert.kind),
                description: alert.message(),
                color,
                timestamp: alert.triggered_at,
                fields: vec![
                    DiscordField::inline("Total Spend", money(alert.sum_cost, 4)),
                    DiscordField::inline("Limit", money(alert.limit, 2)),
                    DiscordField::inline("Requests", alert.event_count.to_string()),
                ],
            }],
        }
    }
}

#[async_trait]
impl NotificationChannel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, alert: &AlertNotification) -> std::result::Result<(), NotificationError> {
        post_json(&self.client, &self.webhook_url, &Self::payload(alert), "Discord").await?;
        info!(kind = %alert.kind, severity = %alert.severity, "Discord notification sent");
        Ok(())
    }
}

/// Generic JSON webhook; posts the structured alert
pub struct WebhookChannel {
    client: Client,
    url: String,
}

impl WebhookChannel {
    /// Post the alert as JSON to `url`
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &AlertNotification) -> std::result::Result<(), NotificationError> {
        let payload = WebhookAlertPayload {
            message: alert.message(),
            overage: alert.overage(),
            alert,
        };
        post_json(&self.client, &self.url, &payload, "Webhook").await?;
        info!(kind = %alert.kind, url = %self.url, "Webhook notification sent");
        Ok(())
    }
}

// Slack payload types
#[derive(Debug, Serialize)]
struct SlackPayload {
    text: String,
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    color: String,
    text: String,
    fields: Vec<SlackField>,
    footer: String,
    ts: i64,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}

impl SlackField {
    fn short(title: &str, value: String) -> Self {
        Self {
            title: title.to_string(),
            value,
            short: true,
        }
    }
}

// Discord payload types
#[derive(Debug, Serialize)]
struct DiscordPayload {
    content: String,
    embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
    timestamp: DateTime<Utc>,
    fields: Vec<DiscordField>,
}

#[derive(Debug, Serialize)]
struct DiscordField {
    name: String,
    value: String,
    inline: bool,
}

impl DiscordField {
    fn inline(name: &str, value: String) -> Self {
        Self {
            name: name.to_string(),
            value,
            inline: true,
        }
    }
}

// Generic webhook payload
#[derive(Debug, Serialize)]
struct WebhookAlertPayload<'a> {
    #[serde(flatten)]
    alert: &'a AlertNotification,
    message: String,
    overage: Decimal,
}
