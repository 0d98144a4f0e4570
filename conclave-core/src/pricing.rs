// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Minimal per-model pricing lookup.
//!
//! The real pricing table is an external collaborator (see the core's
//! scope notes); this module only provides the lookup-and-multiply shape
//! the adapter layer needs, with a small built-in default table for tests
//! and standalone use.

use std::collections::HashMap;

/// Cost-per-token rates for a single `provider/model` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
}

impl ModelPricing {
    pub fn cost_usd(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        input_tokens as f64 * self.input_cost_per_token
            + output_tokens as f64 * self.output_cost_per_token
    }
}

/// Keyed by `"provider:model"`. Unknown keys price at `$0`; callers decide
/// whether a zero-cost result is suspicious.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    rates: HashMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self {
            rates: HashMap::new(),
        }
    }

    /// A handful of illustrative defaults; real deployments supply their own
    /// table via [`PricingTable::insert`] or [`PricingTable::from_rates`].
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.insert(
            "openai:gpt-4o",
            ModelPricing {
                input_cost_per_token: 0.0000025,
                output_cost_per_token: 0.00001,
            },
        );
        table.insert(
            "anthropic:claude-3-5-sonnet",
            ModelPricing {
                input_cost_per_token: 0.000003,
                output_cost_per_token: 0.000015,
            },
        );
        table
    }

    pub fn from_rates(rates: HashMap<String, ModelPricing>) -> Self {
        Self { rates }
    }

    pub fn insert(&mut self, provider_model: impl Into<String>, pricing: ModelPricing) {
        self.rates.insert(provider_model.into(), pricing);
    }

    pub fn cost_usd(&self, provider: &str, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        let key = format!("{provider}:{model}");
        match self.rates.get(&key) {
            Some(pricing) => pricing.cost_usd(input_tokens, output_tokens),
            None => {
                tracing::debug!(provider, model, "no pricing entry, defaulting to $0");
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_computes_nonzero_cost() {
        let table = PricingTable::with_defaults();
        let cost = table.cost_usd("openai", "gpt-4o", 1000, 500);
        assert!(cost > 0.0);
    }

    #[test]
    fn unknown_model_is_free() {
        let table = PricingTable::with_defaults();
        assert_eq!(table.cost_usd("unknown", "model-x", 1000, 500), 0.0);
    }
}
