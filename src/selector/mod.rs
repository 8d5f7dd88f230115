//! Model selector.
//!
//! Scores query complexity, maps the score to a tier, applies the cost
//! policy, and builds the fallback chain. The ledger's per-tier failure
//! rates can knock the chosen tier off the front of the chain.

use crate::agents::AgentKind;
use crate::config::{BudgetConfig, SelectorConfig, TierTable};
use crate::ledger::Ledger;
use crate::pricing;
use crate::tier::Tier;
use serde::{Deserialize, Serialize};

/// Complexity score above which the cost policy never downshifts.
const DOWNSHIFT_SAFETY_FLOOR: f64 = 0.85;

/// Query-token count above which the length feature fires.
const LONG_QUERY_TOKENS: usize = 512;

/// Assistant-turn count above which the long-conversation feature fires.
const LONG_CONVERSATION_TURNS: i64 = 10;

/// Markers for multi-step reasoning requests.
const REASONING_MARKERS: &[&str] = &[
    "explain",
    "compare",
    "step by step",
    "walk me through",
    "why does",
    "trade-off",
    "tradeoff",
    "diagnose",
    "root cause",
    "in detail",
    "how do i",
    "how to",
    "procedure for",
];

/// Tier choice plus the fallback chain for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDecision {
    pub primary: Tier,
    /// Tiers to try in order on retriable upstream failure. Never empty;
    /// starts with `primary`.
    pub chain: Vec<Tier>,
    pub reason: String,
    pub estimated_cost: f64,
    pub complexity: f64,
}

/// Per-owner cost posture, derived from the ledger and config.
#[derive(Debug, Clone, Copy)]
pub struct CostPolicy {
    pub prefer_cheap: bool,
    /// Remaining budget in USD; `f64::INFINITY` when unmetered.
    pub budget_remaining: f64,
}

impl Default for CostPolicy {
    fn default() -> Self {
        Self { prefer_cheap: false, budget_remaining: f64::INFINITY }
    }
}

pub struct ModelSelector {
    budget: BudgetConfig,
    selector: SelectorConfig,
    tiers: TierTable,
    reserve_tokens: u32,
}

impl ModelSelector {
    pub fn new(config: &crate::config::Config) -> Self {
        Self {
            budget: config.budget.clone(),
            selector: config.selector.clone(),
            tiers: config.tier.clone(),
            reserve_tokens: config.context.reserve_tokens,
        }
    }

    /// Score query complexity in [0, 1].
    pub fn complexity_score(
        query: &str,
        query_tokens: usize,
        agent: AgentKind,
        assistant_turns: i64,
    ) -> f64 {
        let mut score: f64 = 0.0;
        if query_tokens > LONG_QUERY_TOKENS {
            score += 0.3;
        }
        let lowered = query.to_lowercase();
        if REASONING_MARKERS.iter().any(|m| lowered.contains(m)) {
            score += 0.3;
        }
        if matches!(agent, AgentKind::Troubleshooting | AgentKind::Maintenance) {
            score += 0.2;
        }
        if assistant_turns > LONG_CONVERSATION_TURNS {
            score += 0.2;
        }
        score.min(1.0)
    }

    fn tier_for_score(score: f64) -> Tier {
        if score < 0.3 {
            Tier::Small
        } else if score < 0.7 {
            Tier::Medium
        } else {
            Tier::Large
        }
    }

    /// Choose the tier and fallback chain for one request.
    pub fn select(
        &self,
        query: &str,
        query_tokens: usize,
        agent: AgentKind,
        assistant_turns: i64,
        policy: CostPolicy,
        ledger: &Ledger,
    ) -> ModelDecision {
        let score = Self::complexity_score(query, query_tokens, agent, assistant_turns);
        let scored_tier = Self::tier_for_score(score);
        let mut chosen = scored_tier;
        let mut reason = format!("complexity {score:.2} maps to {scored_tier}");

        // Cost policy: downshift one tier when the budget is nearly gone,
        // unless the query is explicitly complex.
        let strained =
            policy.prefer_cheap || policy.budget_remaining < self.budget.downshift_threshold;
        if strained && score < DOWNSHIFT_SAFETY_FLOOR
            && let Some(smaller) = chosen.next_smaller()
        {
            reason.push_str(&format!(
                "; budget {:.2} below threshold, downshifted to {smaller}",
                policy.budget_remaining
            ));
            chosen = smaller;
        }

        let mut chain = build_chain(chosen);

        // Skip the head of the chain while its recent failure rate is over
        // the threshold; always keep at least one tier.
        while chain.len() > 1 {
            let head = chain[0];
            match ledger.failure_rate(head) {
                Some(rate) if rate > self.selector.failure_threshold => {
                    tracing::warn!(
                        tier = %head,
                        failure_rate = rate,
                        "tier unhealthy, skipping to next in chain"
                    );
                    reason.push_str(&format!("; {head} skipped at {:.0}% failures", rate * 100.0));
                    chain.remove(0);
                }
                _ => break,
            }
        }

        let primary = chain[0];
        let estimated_cost = pricing::estimate_cost(
            query_tokens as u32,
            self.reserve_tokens,
            self.tiers.get(primary),
        );

        tracing::debug!(
            primary = %primary,
            chain = ?chain,
            complexity = score,
            estimated_cost,
            "model selected"
        );

        ModelDecision { primary, chain, reason, estimated_cost, complexity: score }
    }
}

/// `[chosen, next_smaller, small]`, deduplicated.
fn build_chain(chosen: Tier) -> Vec<Tier> {
    let mut chain = vec![chosen];
    if let Some(smaller) = chosen.next_smaller() {
        chain.push(smaller);
    }
    if !chain.contains(&Tier::Small) {
        chain.push(Tier::Small);
    }
    chain
}
