//! Metrics and cost ledger.
//!
//! Append-only log of request runs. Writers enqueue onto an unbounded
//! channel drained by a dedicated aggregator task; per-tier failure-rate
//! rings are updated synchronously on every attempt completion so the
//! selector's read path never waits on the queue.

use crate::agents::AgentKind;
use crate::tier::Tier;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// One call to one tier within a request run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub tier: Tier,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub error: Option<String>,
}

impl Attempt {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Terminal outcome of a request run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Ok,
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Ok => "ok",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

/// The ledger record for one end-to-end run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRunRecord {
    pub run_id: Uuid,
    pub conversation_id: Uuid,
    pub owner_id: String,
    pub agent: AgentKind,
    /// Tier that produced the final answer, when one did.
    pub tier: Option<Tier>,
    pub attempts: Vec<Attempt>,
    pub outcome: RunOutcome,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub latency_ms: u64,
    /// Degradation note, e.g. summarization fell back to truncation.
    pub warning: Option<String>,
    pub error_kind: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Aggregated usage for one owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub requests: u64,
    pub ok: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub total_cost: f64,
}

/// Latency distribution for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub samples: usize,
}

enum LedgerMsg {
    Run(RequestRunRecord),
    Flush(oneshot::Sender<()>),
}

/// Fixed-size ring of recent attempt outcomes for one tier.
struct TierRing {
    entries: VecDeque<(DateTime<Utc>, bool)>,
    capacity: usize,
}

impl TierRing {
    fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity), capacity }
    }

    fn push(&mut self, at: DateTime<Utc>, ok: bool) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((at, ok));
    }

    /// Failure fraction over entries younger than `max_age`. None when the
    /// ring holds no recent data.
    fn failure_rate(&self, now: DateTime<Utc>, max_age: ChronoDuration) -> Option<f64> {
        let recent: Vec<bool> = self
            .entries
            .iter()
            .filter(|(at, _)| now.signed_duration_since(*at) <= max_age)
            .map(|(_, ok)| *ok)
            .collect();
        if recent.is_empty() {
            return None;
        }
        let failures = recent.iter().filter(|ok| !**ok).count();
        Some(failures as f64 / recent.len() as f64)
    }
}

/// The metrics/cost ledger.
pub struct Ledger {
    tx: mpsc::UnboundedSender<LedgerMsg>,
    runs: Arc<RwLock<Vec<RequestRunRecord>>>,
    rings: [Mutex<TierRing>; 3],
}

impl Ledger {
    /// Create the ledger and spawn its aggregator task. Must be called
    /// from within a tokio runtime.
    pub fn spawn(failure_window: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<LedgerMsg>();
        let runs = Arc::new(RwLock::new(Vec::new()));

        let ledger = Arc::new(Self {
            tx,
            runs: Arc::clone(&runs),
            rings: [
                Mutex::new(TierRing::new(failure_window)),
                Mutex::new(TierRing::new(failure_window)),
                Mutex::new(TierRing::new(failure_window)),
            ],
        });

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    LedgerMsg::Run(record) => {
                        tracing::debug!(
                            run_id = %record.run_id,
                            outcome = record.outcome.as_str(),
                            cost = record.cost,
                            "run recorded"
                        );
                        runs.write().expect("ledger runs lock poisoned").push(record);
                    }
                    LedgerMsg::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });

        ledger
    }

    /// Record one attempt completion. O(1), called on the request path.
    pub fn record_attempt(&self, tier: Tier, ok: bool) {
        self.rings[tier.index()]
            .lock()
            .expect("tier ring lock poisoned")
            .push(Utc::now(), ok);
    }

    /// Enqueue a completed run record.
    pub fn record_run(&self, record: RequestRunRecord) {
        if self.tx.send(LedgerMsg::Run(record)).is_err() {
            tracing::warn!("ledger aggregator is gone, dropping run record");
        }
    }

    /// Wait until every record enqueued so far has been aggregated.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(LedgerMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Failure rate for a tier over the last-N ring, ignoring entries
    /// older than one hour. None means no recent data.
    pub fn failure_rate(&self, tier: Tier) -> Option<f64> {
        self.rings[tier.index()]
            .lock()
            .expect("tier ring lock poisoned")
            .failure_rate(Utc::now(), ChronoDuration::hours(1))
    }

    /// Recorded runs for one conversation, oldest first.
    pub fn run_records(&self, conversation_id: Uuid) -> Vec<RequestRunRecord> {
        self.runs
            .read()
            .expect("ledger runs lock poisoned")
            .iter()
            .filter(|r| r.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Total spend for an owner since `since`.
    pub fn cost_for_owner(&self, owner_id: &str, since: DateTime<Utc>) -> f64 {
        self.runs
            .read()
            .expect("ledger runs lock poisoned")
            .iter()
            .filter(|r| r.owner_id == owner_id && r.started_at >= since)
            .map(|r| r.cost)
            .sum()
    }

    /// Aggregate usage for an owner across all recorded runs.
    pub fn usage_summary(&self, owner_id: &str) -> UsageSummary {
        let runs = self.runs.read().expect("ledger runs lock poisoned");
        let mut summary = UsageSummary::default();
        for run in runs.iter().filter(|r| r.owner_id == owner_id) {
            summary.requests += 1;
            match run.outcome {
                RunOutcome::Ok => summary.ok += 1,
                RunOutcome::Failed => summary.failed += 1,
                RunOutcome::Cancelled => summary.cancelled += 1,
            }
            summary.tokens_in += run.tokens_in as u64;
            summary.tokens_out += run.tokens_out as u64;
            summary.total_cost += run.cost;
        }
        summary
    }

    /// Latency percentiles for runs handled by one agent.
    pub fn latency_percentiles(&self, agent: AgentKind) -> Option<LatencyPercentiles> {
        let runs = self.runs.read().expect("ledger runs lock poisoned");
        let mut samples: Vec<u64> = runs
            .iter()
            .filter(|r| r.agent == agent && r.outcome == RunOutcome::Ok)
            .map(|r| r.latency_ms)
            .collect();
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let pick = |q: f64| {
            let idx = ((samples.len() as f64 - 1.0) * q).round() as usize;
            samples[idx]
        };
        Some(LatencyPercentiles {
            p50_ms: pick(0.50),
            p95_ms: pick(0.95),
            p99_ms: pick(0.99),
            samples: samples.len(),
        })
    }
}
