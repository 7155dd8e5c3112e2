//! Model price table
//!
//! Estimates the cost of an LLM call from token usage when the webhook source
//! did not report one.

use std::collections::HashMap;

use rust_decimal::Decimal;

/// Pricing for a model (per million tokens)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    /// Cost per million input tokens
    pub input_per_million: Decimal,
    /// Cost per million output tokens
    pub output_per_million: Decimal,
}

impl ModelPricing {
    /// Prices given in hundredths of a cent per million tokens
    fn from_cents(input: i64, output: i64) -> Self {
        Self {
            input_per_million: Decimal::new(input, 4),
            output_per_million: Decimal::new(output, 4),
        }
    }
}

/// Model name to price lookup
pub struct PriceTable {
    pricing: HashMap<String, ModelPricing>,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceTable {
    /// Table with list prices of common models
    pub fn new() -> Self {
        let pricing = [
            // Anthropic
            ("claude-3-opus", ModelPricing::from_cents(150_000, 750_000)),
            ("claude-3-5-sonnet", ModelPricing::from_cents(30_000, 150_000)),
            ("claude-3-5-haiku", ModelPricing::from_cents(8_000, 40_000)),
            ("claude-sonnet-4", ModelPricing::from_cents(30_000, 150_000)),
            ("claude-opus-4", ModelPricing::from_cents(150_000, 750_000)),
            // OpenAI
            ("gpt-4", ModelPricing::from_cents(300_000, 600_000)),
            ("gpt-4-turbo", ModelPricing::from_cents(100_000, 300_000)),
            ("gpt-4o", ModelPricing::from_cents(25_000, 100_000)),
            ("gpt-4o-mini", ModelPricing::from_cents(1_500, 6_000)),
            ("gpt-3.5-turbo", ModelPricing::from_cents(5_000, 15_000)),
            ("o1", ModelPricing::from_cents(150_000, 600_000)),
            ("o1-mini", ModelPricing::from_cents(30_000, 120_000)),
            // Google
            ("gemini-1.5-pro", ModelPricing::from_cents(12_500, 50_000)),
            ("gemini-1.5-flash", ModelPricing::from_cents(750, 3_000)),
            ("gemini-2.0-flash", ModelPricing::from_cents(1_000, 4_000)),
            // Mistral
            ("mistral-large", ModelPricing::from_cents(20_000, 60_000)),
            ("mistral-small", ModelPricing::from_cents(2_000, 6_000)),
        ]
        .into_iter()
        .map(|(model, price)| (model.to_string(), price))
        .collect();

        Self { pricing }
    }

    /// Estimated cost of a call, `None` for unknown models
    pub fn estimate(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> Option<Decimal> {
        let pricing = self.find(model)?;
        let million = Decimal::from(1_000_000);

        let input = Decimal::from(prompt_tokens) * pricing.input_per_million / million;
        let output = Decimal::from(completion_tokens) * pricing.output_per_million / million;

        Some(input + output)
    }

    /// Add or replace a model's price
    pub fn set_pricing(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.pricing.insert(model.into(), pricing);
    }

    /// Pricing for a model
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.find(model)
    }

    /// Exact match, then the longest prefix, then the longest substring.
    ///
    /// "gpt-4o-mini-2024-07-18" must resolve to "gpt-4o-mini", not "gpt-4".
    fn find(&self, model: &str) -> Option<&ModelPricing> {
        let model = model.trim().to_ascii_lowercase();

        if let Some(pricing) = self.pricing.get(&model) {
            return Some(pricing);
        }

        let longest = |matches: &dyn Fn(&str) -> bool| {
            self.pricing
                .iter()
                .filter(|(key, _)| matches(key))
                .max_by_key(|(key, _)| key.len())
                .map(|(_, pricing)| pricing)
        };

        longest(&|key| model.starts_with(key)).or_else(|| longest(&|key| model.contains(key)))
    }
}
