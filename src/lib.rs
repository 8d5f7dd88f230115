//! aeromx — multi-agent LLM orchestrator for aircraft maintenance.
//!
//! The orchestrator accepts a user query inside a durable conversation,
//! classifies it to a specialist agent, selects an LLM tier by estimated
//! complexity, assembles a token-bounded context window from conversation
//! history, dispatches the request with retry/backoff and cost accounting,
//! fans streamed output out to real-time subscribers, and persists the
//! outcome.
//!
//! ## Architecture
//!
//! - [`orchestrator::Runtime`] — dependency-injected handle over every
//!   subsystem; one value per process, tests build their own
//! - [`classifier`] — query → specialist routing with confidence fallback
//! - [`selector`] — complexity scoring → tier + fallback chain
//! - [`context`] — token-bounded window assembly with cached summarization
//! - [`gateway`] — provider calls: admission control, retries, streaming
//! - [`hub`] — real-time event fan-out with drop-oldest backpressure
//! - [`ledger`] — cost accounting and per-tier health tracking
//! - [`store`] — SQLite persistence with dense per-conversation sequencing
//! - [`server`] — axum HTTP + WebSocket surface

pub mod agents;
pub mod classifier;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod pricing;
pub mod selector;
pub mod server;
pub mod store;
pub mod tier;
pub mod tokens;

// Re-export commonly used types
pub use agents::AgentKind;
pub use config::Config;
pub use error::{OrchestratorError, Result};
pub use orchestrator::{QueryRequest, QueryResponse, Runtime};
pub use tier::Tier;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
