//! Configuration management for Spendwatch
//!
//! Sources, lowest priority first: built-in defaults, an optional config file,
//! `SPENDWATCH_*` environment variables (`__` separates nested keys), then the
//! legacy unprefixed variables (`HOURLY_SPEND_LIMIT`, `HELICONE_WEBHOOK_SECRET`,
//! `SLACK_WEBHOOK_URL`, ...).

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{WindowDefinition, WindowKind, MAX_CUSTOM_WIDTH_SECS};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Spending limits
    pub limits: LimitsConfig,

    /// Alerting configuration
    pub alerting: AlertingConfig,

    /// Notification channels
    pub channels: ChannelsConfig,

    /// Webhook ingestion
    pub webhook: WebhookConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder
            .add_source(
                config::Environment::with_prefix("SPENDWATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("channels.webhook_urls"),
            )
            .set_override_option("limits.hourly", env_var("HOURLY_SPEND_LIMIT"))?
            .set_override_option("webhook.secret", env_var("HELICONE_WEBHOOK_SECRET"))?
            .set_override_option("channels.slack_webhook_url", env_var("SLACK_WEBHOOK_URL"))?
            .set_override_option("channels.discord_webhook_url", env_var("DISCORD_WEBHOOK_URL"))?
            .set_override_option("database.url", env_var("DATABASE_URL"))?
            .set_override_option("server.host", env_var("HOST"))?
            .set_override_option("server.port", env_var("PORT"))?;

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check limits, ratios and custom windows
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;

        for (name, limit) in [
            ("hourly", limits.hourly),
            ("daily", limits.daily),
            ("monthly", limits.monthly),
        ] {
            check_limit(name, limit)?;
        }

        if limits.approaching_ratio <= Decimal::ZERO || limits.approaching_ratio > Decimal::ONE {
            return Err(Error::config(format!(
                "limits.approaching_ratio must be in (0, 1], got {}",
                limits.approaching_ratio
            )));
        }

        let mut names = HashSet::new();
        for custom in &limits.custom {
            let name = custom.name.trim();
            if name.is_empty() {
                return Err(Error::config("custom window name must not be empty"));
            }
            if matches!(name, "hourly" | "daily" | "monthly") || !names.insert(name) {
                return Err(Error::config(format!("duplicate window name '{name}'")));
            }
            let secs = custom.width.as_secs();
            if secs == 0 || secs > MAX_CUSTOM_WIDTH_SECS {
                return Err(Error::config(format!(
                    "custom window '{name}' width must be between 1s and 10 years"
                )));
            }
            check_limit(name, custom.limit)?;
        }

        if self.alerting.send_timeout.is_zero() {
            return Err(Error::config("alerting.send_timeout must be positive"));
        }

        Ok(())
    }

    /// Every tracked window kind with its limit
    pub fn window_definitions(&self) -> Vec<WindowDefinition> {
        let limits = &self.limits;
        let mut windows = vec![
            WindowDefinition::new(WindowKind::Hourly, limits.hourly),
            WindowDefinition::new(WindowKind::Daily, limits.daily),
            WindowDefinition::new(WindowKind::Monthly, limits.monthly),
        ];
        windows.extend(limits.custom.iter().map(|c| {
            WindowDefinition::new(WindowKind::custom(c.name.trim(), c.width), c.limit)
        }));
        windows
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn check_limit(name: &str, limit: Option<Decimal>) -> Result<()> {
    match limit {
        Some(limit) if limit <= Decimal::ZERO => Err(Error::config(format!(
            "{name} limit must be positive, got {limit}"
        ))),
        _ => Ok(()),
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// HTTP port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL; the in-memory ledger is used when unset
    pub url: Option<String>,
    /// Maximum connections
    pub max_connections: u32,
    /// Minimum connections
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            min_connections: 1,
        }
    }
}

/// Spending limits per window kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Hourly ceiling
    pub hourly: Option<Decimal>,
    /// Daily ceiling
    pub daily: Option<Decimal>,
    /// Monthly ceiling
    pub monthly: Option<Decimal>,
    /// Fraction of a limit that counts as approaching
    pub approaching_ratio: Decimal,
    /// Additional fixed-width windows
    pub custom: Vec<CustomWindowConfig>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            hourly: Some(Decimal::new(1000, 2)),
            daily: None,
            monthly: None,
            approaching_ratio: Decimal::new(8, 1),
            custom: Vec::new(),
        }
    }
}

/// A fixed-width window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomWindowConfig {
    /// Window name
    pub name: String,
    /// Window width, e.g. "15m"
    #[serde(with = "humantime_serde")]
    pub width: Duration,
    /// Spending ceiling
    #[serde(default)]
    pub limit: Option<Decimal>,
}

/// Alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Per-channel send timeout
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,
    /// Minimum gap between approaching notifications of one kind; zero disables
    #[serde(with = "humantime_serde")]
    pub approaching_cooldown: Duration,
    /// How often running totals are checked against the ledger
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(10),
            approaching_cooldown: Duration::ZERO,
            reconcile_interval: Duration::from_secs(300),
        }
    }
}

/// Notification channel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Slack incoming webhook
    pub slack_webhook_url: Option<String>,
    /// Discord webhook
    pub discord_webhook_url: Option<String>,
    /// Generic JSON webhooks
    pub webhook_urls: Vec<String>,
}

/// Webhook ingestion configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// HMAC-SHA256 secret; signature checks are skipped when unset
    pub secret: Option<String>,
    /// Estimate cost from token counts when the payload carries none
    pub estimate_missing_cost: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
