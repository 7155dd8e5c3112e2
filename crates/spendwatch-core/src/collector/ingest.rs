//! Webhook payload parsing
//!
//! Helicone-style request webhooks carry the cost inside `metadata`. Payloads
//! without a cost (absent, null or zero) are acknowledged and skipped unless the
//! cost can be estimated from token counts. A cost that is present but not a
//! number is rejected.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::pricing::PriceTable;
use crate::error::{Error, Result};
use crate::models::{IncomingEvent, Metadata};

/// Body of a request webhook
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Unique request id; the de-duplication key
    pub request_id: Option<String>,
    /// When the request happened
    #[serde(default)]
    pub timestamp: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub user_id: Option<String>,
    /// Cost and token counts
    #[serde(default)]
    pub metadata: Metadata,
}

impl WebhookPayload {
    /// Reported cost; `None` when absent, null or zero.
    ///
    /// Fails with [`Error::InvalidEvent`] when the field holds something other
    /// than a representable number.
    pub fn reported_cost(&self) -> Result<Option<Decimal>> {
        let value = match self.metadata.get("cost") {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
            Some(value) => value,
        };

        let cost = decimal_from_json(value)
            .ok_or_else(|| Error::invalid(format!("malformed cost {value}")))?;

        Ok((!cost.is_zero()).then_some(cost))
    }

    fn tokens(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }

    /// Convert into an event for the monitor.
    ///
    /// Returns `Ok(None)` when the payload has no id, or no cost and none can
    /// be estimated. Negative costs are passed through so validation rejects
    /// them; malformed costs are an error.
    pub fn into_event(self, prices: Option<&PriceTable>) -> Result<Option<IncomingEvent>> {
        let Some(id) = self.request_id.clone().filter(|id| !id.trim().is_empty()) else {
            return Ok(None);
        };

        let cost = match self.reported_cost()? {
            Some(cost) => cost,
            None => {
                let Some(estimate) = prices.and_then(|prices| self.estimate(prices)) else {
                    return Ok(None);
                };
                debug!(request_id = %id, cost = %estimate, "Estimated missing cost");
                estimate
            }
        };

        let mut metadata = self.metadata;
        for (key, value) in [
            ("model", self.model),
            ("provider", self.provider),
            ("user_id", self.user_id),
        ] {
            if let Some(value) = value {
                metadata.entry(key).or_insert(Value::String(value));
            }
        }

        Ok(Some(IncomingEvent {
            id,
            timestamp: self.timestamp,
            cost,
            metadata,
        }))
    }

    fn estimate(&self, prices: &PriceTable) -> Option<Decimal> {
        let model = self.model.as_deref()?;
        let prompt = self.tokens("promptTokens");
        let completion = self.tokens("completionTokens");

        match (prompt, completion) {
            (None, None) => {
                // Only a total is known; price it all as input
                let total = self.tokens("totalTokens")?;
                prices.estimate(model, total, 0)
            }
            (prompt, completion) => {
                prices.estimate(model, prompt.unwrap_or(0), completion.unwrap_or(0))
            }
        }
    }
}

/// Read a JSON number or numeric string as an exact decimal
fn decimal_from_json(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}
