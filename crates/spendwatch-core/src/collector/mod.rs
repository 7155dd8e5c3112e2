//! Event collection
//!
//! Turns webhook payloads into cost events and aggregates accepted events into
//! window totals.

mod aggregator;
mod ingest;
mod pricing;

pub use aggregator::{RunningTotal, WindowAggregator};
pub use ingest::WebhookPayload;
pub use pricing::{ModelPricing, PriceTable};
