//! Request classifier.
//!
//! Maps `{query, recent context}` to a specialist with a confidence and a
//! reasoning string. A forced agent short-circuits everything; otherwise a
//! small-tier call produces a structured reply, retried once at medium on
//! parse failure before falling back to the conversation's agent hint.

use crate::agents::AgentKind;
use crate::error::Result;
use crate::gateway::LlmGateway;
use crate::tier::Tier;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// The routing decision for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationDecision {
    pub agent: AgentKind,
    /// In [0, 1]. 1.0 when forced, 0.0 on parse failure.
    pub confidence: f64,
    pub reasoning: String,
    pub forced: bool,
    /// Why the classifier's own answer was overridden, when it was.
    pub fallback_from: Option<String>,
}

impl ClassificationDecision {
    fn forced(agent: AgentKind) -> Self {
        Self {
            agent,
            confidence: 1.0,
            reasoning: "agent explicitly requested by caller".to_string(),
            forced: true,
            fallback_from: None,
        }
    }
}

/// Shape the model is asked to reply with.
#[derive(Debug, Deserialize)]
struct RawReply {
    agent: String,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

pub struct Classifier {
    confidence_threshold: f64,
}

impl Classifier {
    pub fn new(confidence_threshold: f64) -> Self {
        Self { confidence_threshold }
    }

    /// Classify a query. `recent_context` is a short transcript excerpt;
    /// `agent_hint` is the conversation's last specialist.
    pub async fn classify(
        &self,
        gateway: &LlmGateway,
        query: &str,
        recent_context: &str,
        agent_hint: Option<AgentKind>,
        forced_agent: Option<AgentKind>,
        cancel: &CancellationToken,
    ) -> Result<ClassificationDecision> {
        if let Some(agent) = forced_agent {
            tracing::debug!(agent = %agent, "classification forced, skipping model call");
            return Ok(ClassificationDecision::forced(agent));
        }

        let prompt = build_prompt(query, recent_context);

        // First try on the small tier, one retry at medium on parse failure.
        for tier in [Tier::Small, Tier::Medium] {
            let response = match gateway
                .complete_simple(tier, CLASSIFIER_SYSTEM, &prompt, 256, cancel)
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(tier = %tier, error = %err, "classifier call failed");
                    if matches!(err, crate::error::OrchestratorError::Cancelled) {
                        return Err(err);
                    }
                    continue;
                }
            };

            match parse_reply(&response.content) {
                Some((agent, confidence, reasoning)) => {
                    return Ok(self.apply_confidence_fallback(agent, confidence, reasoning, agent_hint));
                }
                None => {
                    tracing::warn!(
                        tier = %tier,
                        reply = %response.content.chars().take(200).collect::<String>(),
                        "classifier reply failed validation"
                    );
                }
            }
        }

        // Both tiers produced garbage: fall back to the hint or the default.
        let agent = agent_hint.unwrap_or(AgentKind::DEFAULT);
        tracing::warn!(agent = %agent, "classification unusable, using fallback agent");
        Ok(ClassificationDecision {
            agent,
            confidence: 0.0,
            reasoning: "classifier reply could not be parsed".to_string(),
            forced: false,
            fallback_from: Some("parse_error".to_string()),
        })
    }

    /// Below the confidence threshold, a differing agent hint wins.
    fn apply_confidence_fallback(
        &self,
        agent: AgentKind,
        confidence: f64,
        reasoning: String,
        agent_hint: Option<AgentKind>,
    ) -> ClassificationDecision {
        let confidence = confidence.clamp(0.0, 1.0);
        if confidence < self.confidence_threshold
            && let Some(hint) = agent_hint
            && hint != agent
        {
            tracing::debug!(
                proposed = %agent,
                hint = %hint,
                confidence,
                "low confidence, preferring conversation's agent hint"
            );
            return ClassificationDecision {
                agent: hint,
                confidence,
                reasoning,
                forced: false,
                fallback_from: Some("low_confidence".to_string()),
            };
        }
        ClassificationDecision {
            agent,
            confidence,
            reasoning,
            forced: false,
            fallback_from: None,
        }
    }
}

const CLASSIFIER_SYSTEM: &str = "You route aircraft maintenance queries to a specialist. \
    Reply with a single JSON object {\"agent\": \"...\", \"confidence\": 0.0-1.0, \
    \"reasoning\": \"...\"} and nothing else.";

fn build_prompt(query: &str, recent_context: &str) -> String {
    let mut prompt = String::from("Available specialists:\n");
    for agent in AgentKind::ALL {
        prompt.push_str(&format!("- {}: {}\n", agent.as_str(), agent.capability()));
    }
    if !recent_context.is_empty() {
        prompt.push_str("\nRecent conversation:\n");
        prompt.push_str(recent_context);
        prompt.push('\n');
    }
    prompt.push_str("\nQuery: ");
    prompt.push_str(query);
    prompt.push_str("\n\nWhich specialist should handle this query?");
    prompt
}

/// Parse and validate the structured reply. Tolerates markdown fences and
/// prose around the JSON object; rejects agents outside the closed set.
fn parse_reply(raw: &str) -> Option<(AgentKind, f64, String)> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    let reply: RawReply = serde_json::from_str(&raw[start..=end]).ok()?;
    let agent = AgentKind::parse(&reply.agent)?;
    if !reply.confidence.is_finite() {
        return None;
    }
    Some((agent, reply.confidence, reply.reasoning))
}
