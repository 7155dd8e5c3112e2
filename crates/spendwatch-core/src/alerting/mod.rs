//! Alerting for Spendwatch
//!
//! Threshold classification, notification suppression and delivery.

mod dispatcher;
mod evaluator;
mod notifier;

pub use dispatcher::AlertDispatcher;
pub use evaluator::{ThresholdEvaluator, DEFAULT_APPROACHING_RATIO};
pub use notifier::{
    channels_from_config, http_client, DiscordChannel, NotificationChannel, NotificationError,
    SlackChannel, WebhookChannel,
};
