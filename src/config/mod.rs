//! Configuration types, defaults, loading, and validation.

use crate::tier::Tier;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP/WebSocket server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// LLM tier deployments
    #[serde(default)]
    pub tier: TierTable,

    /// Classifier configuration
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Context window assembly configuration
    #[serde(default)]
    pub context: ContextConfig,

    /// LLM gateway retry/concurrency configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Real-time session layer configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Cost policy configuration
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Model selector configuration
    #[serde(default)]
    pub selector: SelectorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (default: "127.0.0.1")
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Server port (default: 18650)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional API key for authenticating requests (Bearer token).
    /// If unset, no authentication is required (loopback-only use).
    #[serde(default)]
    pub api_key: Option<String>,

    /// Allowed CORS origins. Empty = no cross-origin requests.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18650
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            api_key: None,
            allowed_origins: vec![],
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path, or ":memory:" for ephemeral storage
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "aeromx.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// One LLM deployment: provider model name, window size, per-1k rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Provider deployment identifier
    pub name: String,

    /// Context window capacity in tokens
    pub context_tokens: u32,

    /// USD per 1,000 input tokens
    pub rate_per_1k_in: f64,

    /// USD per 1,000 output tokens
    pub rate_per_1k_out: f64,

    /// Whether the deployment supports streamed responses
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
}

fn default_true() -> bool {
    true
}

/// The three tier deployments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierTable {
    #[serde(default = "default_small_tier")]
    pub small: TierConfig,
    #[serde(default = "default_medium_tier")]
    pub medium: TierConfig,
    #[serde(default = "default_large_tier")]
    pub large: TierConfig,
}

fn default_small_tier() -> TierConfig {
    TierConfig {
        name: "gpt-4o-mini".to_string(),
        context_tokens: 16_384,
        rate_per_1k_in: 0.000_15,
        rate_per_1k_out: 0.000_60,
        supports_streaming: true,
    }
}

fn default_medium_tier() -> TierConfig {
    TierConfig {
        name: "gpt-4o".to_string(),
        context_tokens: 128_000,
        rate_per_1k_in: 0.002_50,
        rate_per_1k_out: 0.010_00,
        supports_streaming: true,
    }
}

fn default_large_tier() -> TierConfig {
    TierConfig {
        name: "o1".to_string(),
        context_tokens: 200_000,
        rate_per_1k_in: 0.015_00,
        rate_per_1k_out: 0.060_00,
        supports_streaming: true,
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            small: default_small_tier(),
            medium: default_medium_tier(),
            large: default_large_tier(),
        }
    }
}

impl TierTable {
    pub fn get(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Small => &self.small,
            Tier::Medium => &self.medium,
            Tier::Large => &self.large,
        }
    }
}

/// Classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Confidence below this prefers the conversation's agent hint
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

fn default_confidence_threshold() -> f64 {
    0.55
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { confidence_threshold: default_confidence_threshold() }
    }
}

/// Context window assembly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Output budget reserved out of the tier's window
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: u32,

    /// Summarize instead of silently dropping once this many prior
    /// messages fall outside the window
    #[serde(default = "default_summarize_after")]
    pub summarize_after_messages: usize,

    /// Per-message framing overhead added by the token accountant
    #[serde(default = "default_message_overhead")]
    pub message_overhead_tokens: usize,
}

fn default_reserve_tokens() -> u32 {
    1024
}

fn default_summarize_after() -> usize {
    20
}

fn default_message_overhead() -> usize {
    4
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            reserve_tokens: default_reserve_tokens(),
            summarize_after_messages: default_summarize_after(),
            message_overhead_tokens: default_message_overhead(),
        }
    }
}

/// LLM gateway retry/concurrency configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Provider base URL (OpenAI chat-completions protocol)
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,

    /// Provider API key. Empty disables the Authorization header
    /// (local deployments).
    #[serde(default)]
    pub api_key: String,

    /// Max provider calls per tier before advancing the fallback chain
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff base delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// In-flight call limit per tier
    #[serde(default = "default_concurrency_per_tier")]
    pub concurrency_per_tier: usize,

    /// How long a caller may wait for a concurrency slot before
    /// `Overloaded`, in seconds
    #[serde(default = "default_admit_timeout_secs")]
    pub admit_timeout_secs: u64,

    /// Per-attempt deadline in seconds; exceeding it counts as retriable
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// End-to-end request deadline in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Per-conversation lock wait deadline in seconds
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Upstream close deadline on cancellation, in milliseconds
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

fn default_gateway_base_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_concurrency_per_tier() -> usize {
    8
}

fn default_admit_timeout_secs() -> u64 {
    10
}

fn default_attempt_timeout_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_lock_timeout_secs() -> u64 {
    60
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            api_key: String::new(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            concurrency_per_tier: default_concurrency_per_tier(),
            admit_timeout_secs: default_admit_timeout_secs(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

/// Real-time session layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Outbound event buffer per conversation channel
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// A session lagging longer than this is disconnected, in milliseconds
    #[serde(default = "default_lag_timeout_ms")]
    pub lag_timeout_ms: u64,
}

fn default_buffer_size() -> usize {
    128
}

fn default_lag_timeout_ms() -> u64 {
    10_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            lag_timeout_ms: default_lag_timeout_ms(),
        }
    }
}

/// Cost policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Budget remaining below this downshifts one tier (unless the
    /// complexity safety floor applies), USD
    #[serde(default = "default_downshift_threshold")]
    pub downshift_threshold: f64,

    /// Per-owner spending limit, USD. None = unmetered.
    #[serde(default)]
    pub per_owner_limit: Option<f64>,
}

fn default_downshift_threshold() -> f64 {
    1.0
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            downshift_threshold: default_downshift_threshold(),
            per_owner_limit: None,
        }
    }
}

/// Model selector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Skip a tier whose recent failure rate exceeds this fraction
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,

    /// Number of recent attempts the failure rate is computed over
    #[serde(default = "default_failure_window")]
    pub failure_window: usize,
}

fn default_failure_threshold() -> f64 {
    0.5
}

fn default_failure_window() -> usize {
    20
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window: default_failure_window(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file directory; stdout only when unset
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_log_level() -> String {
    "info,sqlx=warn,hyper=warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), directory: None }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for
    /// anything not present.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the path in `AEROMX_CONFIG`, or defaults when unset.
    pub fn load_from_env() -> Result<Self> {
        match std::env::var("AEROMX_CONFIG") {
            Ok(path) => Self::load(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            let tc = self.tier.get(tier);
            anyhow::ensure!(!tc.name.is_empty(), "tier.{tier}.name must not be empty");
            anyhow::ensure!(
                tc.context_tokens > self.context.reserve_tokens,
                "tier.{tier}.context_tokens must exceed context.reserve_tokens"
            );
        }
        anyhow::ensure!(
            self.gateway.max_attempts >= 1,
            "gateway.max_attempts must be at least 1"
        );
        anyhow::ensure!(
            self.gateway.concurrency_per_tier >= 1,
            "gateway.concurrency_per_tier must be at least 1"
        );
        anyhow::ensure!(self.session.buffer_size >= 1, "session.buffer_size must be at least 1");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.classifier.confidence_threshold),
            "classifier.confidence_threshold must be within [0, 1]"
        );
        Ok(())
    }
}
