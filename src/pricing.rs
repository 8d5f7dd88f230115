//! Tier cost estimation.
//!
//! Rates come from the tier table in the config (`tier.*.rate_per_1k_in` /
//! `rate_per_1k_out`, USD per 1,000 tokens) so operators can reprice a
//! deployment without touching code.

use crate::config::TierConfig;
use serde::{Deserialize, Serialize};

/// Cost breakdown for a single LLM call, USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total: f64,
}

/// Estimate the cost of a call against a tier.
pub fn estimate_cost(tokens_in: u32, tokens_out: u32, tier: &TierConfig) -> f64 {
    breakdown(tokens_in, tokens_out, tier).total
}

/// Estimate with the input/output split preserved.
pub fn breakdown(tokens_in: u32, tokens_out: u32, tier: &TierConfig) -> CostBreakdown {
    let input_cost = (tokens_in as f64 / 1_000.0) * tier.rate_per_1k_in;
    let output_cost = (tokens_out as f64 / 1_000.0) * tier.rate_per_1k_out;
    CostBreakdown { input_cost, output_cost, total: input_cost + output_cost }
}
