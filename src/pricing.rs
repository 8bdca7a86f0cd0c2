//! Per-model pricing table.
//!
//! Cost of one LM call is `input_tokens * price_in + output_tokens *
//! price_out` for the node's model. A model missing from the table prices at
//! zero; the caller records a non-fatal warning on the node.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Pricing for a single model, in USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Model identifier (e.g. "claude-3-5-sonnet-20241022").
    pub model: String,
    /// Input cost per million tokens (USD).
    pub input_cost_per_m: f64,
    /// Output cost per million tokens (USD).
    pub output_cost_per_m: f64,
}

impl ModelPricing {
    pub fn new(model: impl Into<String>, input_cost_per_m: f64, output_cost_per_m: f64) -> Self {
        Self {
            model: model.into(),
            input_cost_per_m,
            output_cost_per_m,
        }
    }

    /// Cost for a token count pair.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input = (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_m;
        let output = (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_m;
        input + output
    }
}

/// Lookup table from model id to pricing. Immutable after initialization.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    /// Empty table; every model prices at zero.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Table pre-populated with well-known models.
    pub fn builtin() -> Self {
        let mut table = Self::default();
        for pricing in [
            ModelPricing::new("claude-3-opus-20240229", 15.0, 75.0),
            ModelPricing::new("claude-3-5-sonnet-20241022", 3.0, 15.0),
            ModelPricing::new("claude-3-5-haiku-20241022", 0.8, 4.0),
            ModelPricing::new("gpt-4o", 2.5, 10.0),
            ModelPricing::new("gpt-4o-mini", 0.15, 0.60),
        ] {
            table.models.insert(pricing.model.clone(), pricing);
        }
        table
    }

    /// Add or replace a model entry.
    pub fn with_model(mut self, pricing: ModelPricing) -> Self {
        self.models.insert(pricing.model.clone(), pricing);
        self
    }

    /// Pricing for a model, if known.
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    /// Cost of one call, `None` when the model is unknown.
    pub fn cost_for(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
        self.models
            .get(model)
            .map(|p| p.cost(input_tokens, output_tokens))
    }
}
