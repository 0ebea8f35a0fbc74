//! TOML configuration.
//!
//! Every section and field has a default, so an empty file is a valid
//! all-defaults configuration. [`load_config`] parses and validates.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:5001"
//!
//! [broker]
//! backend = "redis"
//! url = "redis://127.0.0.1:6379/0"
//!
//! [cache]
//! url = "redis://127.0.0.1:6379/0"
//! ttl_secs = 3600
//!
//! [knowledge]
//! path = "./data/knowledge.sqlite"
//!
//! [embedding]
//! provider = "local"
//! model = "all-minilm-l6-v2"
//!
//! [llm]
//! provider = "openai"
//! model = "gpt-4.1"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use maint_assist_core::prompt::{
    PromptBuilder, DEFAULT_FALLBACK_CONTEXT, DEFAULT_HISTORY_WINDOW, DEFAULT_SYSTEM_INSTRUCTION,
    DEFAULT_USER_TEMPLATE,
};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ============ server ============

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:5001".to_string()
}

// ============ broker ============

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    /// `"redis"` or `"memory"` (single-process only).
    #[serde(default = "default_broker_backend")]
    pub backend: String,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    /// How long an unread reply stays in its destination.
    #[serde(default = "default_reply_ttl_secs")]
    pub reply_ttl_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Identity of this worker process; names its processing lists. Must
    /// be unique among live processes. Generated per process when unset.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Lifetime of a consumer's liveness key. A consumer silent for longer
    /// is presumed dead and its unacknowledged jobs are requeued.
    #[serde(default = "default_heartbeat_ttl_secs")]
    pub heartbeat_ttl_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: default_broker_backend(),
            url: default_redis_url(),
            queue: default_queue(),
            reply_ttl_secs: default_reply_ttl_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            worker_id: None,
            heartbeat_ttl_secs: default_heartbeat_ttl_secs(),
        }
    }
}

impl BrokerConfig {
    pub fn reply_ttl(&self) -> Duration {
        Duration::from_secs(self.reply_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs.max(1))
    }

    /// The configured worker id, or `{host}-{pid}-{random}`. Call once per
    /// process: every unset call yields a new id.
    pub fn worker_id(&self) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", host, std::process::id(), &nonce[..8])
    }
}

fn default_broker_backend() -> String {
    "redis".to_string()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_queue() -> String {
    "query_queue".to_string()
}
fn default_reply_ttl_secs() -> u64 {
    60
}
fn default_heartbeat_ttl_secs() -> u64 {
    30
}
fn default_connect_timeout_ms() -> u64 {
    2000
}

// ============ cache ============

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// `"redis"`, `"memory"`, or `"disabled"`.
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_hour")]
    pub ttl_secs: u64,
    #[serde(default = "default_hour")]
    pub history_ttl_secs: u64,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    /// Fold a knowledge-generation counter into cache keys so that knowledge
    /// writes orphan previously cached replies.
    #[serde(default)]
    pub invalidate_on_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            url: default_redis_url(),
            prefix: default_prefix(),
            ttl_secs: default_hour(),
            history_ttl_secs: default_hour(),
            op_timeout_ms: default_op_timeout_ms(),
            invalidate_on_write: false,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

fn default_cache_backend() -> String {
    "redis".to_string()
}
fn default_prefix() -> String {
    "maint".to_string()
}
fn default_hour() -> u64 {
    3600
}
fn default_op_timeout_ms() -> u64 {
    500
}

// ============ knowledge ============

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeConfig {
    /// `"sqlite"` or `"memory"`.
    #[serde(default = "default_knowledge_backend")]
    pub backend: String,
    #[serde(default = "default_knowledge_path")]
    pub path: PathBuf,
    /// Neighbors fetched per query.
    #[serde(default = "default_retrieve_k")]
    pub retrieve_k: usize,
    /// Neighbors kept after ranking.
    #[serde(default = "default_keep_top")]
    pub keep_top: usize,
    /// Known technician names used to canonicalize intervention records.
    #[serde(default)]
    pub technicians: Vec<String>,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            backend: default_knowledge_backend(),
            path: default_knowledge_path(),
            retrieve_k: default_retrieve_k(),
            keep_top: default_keep_top(),
            technicians: Vec::new(),
        }
    }
}

fn default_knowledge_backend() -> String {
    "sqlite".to_string()
}
fn default_knowledge_path() -> PathBuf {
    PathBuf::from("./data/knowledge.sqlite")
}
fn default_retrieve_k() -> usize {
    10
}
fn default_keep_top() -> usize {
    5
}

// ============ embedding ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"disabled"`, `"openai"`, `"ollama"`, or `"local"`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_openai_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

// ============ llm ============

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `"disabled"` or `"openai"` (any OpenAI-compatible chat endpoint).
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_openai_key_env(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_retries(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4.1".to_string()
}
fn default_max_tokens() -> u32 {
    500
}
fn default_temperature() -> f32 {
    0.7
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_llm_retries() -> u32 {
    1
}

// ============ gateway ============

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
    /// Overall bound on one submission, broker connection included.
    #[serde(default = "default_request_budget_secs")]
    pub request_budget_secs: u64,
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reply_timeout_secs: default_reply_timeout_secs(),
            request_budget_secs: default_request_budget_secs(),
            max_query_chars: default_max_query_chars(),
        }
    }
}

impl GatewayConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn request_budget(&self) -> Duration {
        Duration::from_secs(self.request_budget_secs)
    }
}

fn default_reply_timeout_secs() -> u64 {
    15
}
fn default_request_budget_secs() -> u64 {
    30
}
fn default_max_query_chars() -> usize {
    4000
}

// ============ worker ============

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Consumer loops per worker process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Upper bound on one blocking dequeue; loops re-check shutdown between waits.
    #[serde(default = "default_dequeue_wait_secs")]
    pub dequeue_wait_secs: u64,
    /// How often each consumer loop requeues jobs held by dead consumers.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            dequeue_wait_secs: default_dequeue_wait_secs(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn dequeue_wait(&self) -> Duration {
        Duration::from_secs(self.dequeue_wait_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

fn default_concurrency() -> usize {
    1
}
fn default_reap_interval_secs() -> u64 {
    15
}
fn default_dequeue_wait_secs() -> u64 {
    1
}

// ============ prompt ============

#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,
    /// Template for the main user message; `{context}` and `{query}` are
    /// substituted.
    #[serde(default = "default_user_template")]
    pub user_template: String,
    #[serde(default = "default_fallback_context")]
    pub fallback_context: String,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_instruction: default_system_instruction(),
            user_template: default_user_template(),
            fallback_context: default_fallback_context(),
            history_window: default_history_window(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

impl PromptConfig {
    pub fn builder(&self) -> PromptBuilder {
        PromptBuilder {
            system_instruction: self.system_instruction.clone(),
            user_template: self.user_template.clone(),
            fallback_context: self.fallback_context.clone(),
            history_window: self.history_window,
            max_context_chars: self.max_context_chars,
        }
    }
}

fn default_system_instruction() -> String {
    DEFAULT_SYSTEM_INSTRUCTION.to_string()
}
fn default_user_template() -> String {
    DEFAULT_USER_TEMPLATE.to_string()
}
fn default_fallback_context() -> String {
    DEFAULT_FALLBACK_CONTEXT.to_string()
}
fn default_history_window() -> usize {
    DEFAULT_HISTORY_WINDOW
}
fn default_max_context_chars() -> usize {
    12_000
}

// ============ messages ============

/// User-facing strings for degraded replies.
#[derive(Debug, Deserialize, Clone)]
pub struct MessagesConfig {
    #[serde(default = "default_timed_out")]
    pub timed_out: String,
    #[serde(default = "default_unavailable")]
    pub unavailable: String,
    #[serde(default = "default_internal_error")]
    pub internal_error: String,
    #[serde(default = "default_model_unavailable")]
    pub model_unavailable: String,
    #[serde(default = "default_malformed_job")]
    pub malformed_job: String,
    #[serde(default = "default_processing_error")]
    pub processing_error: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            timed_out: default_timed_out(),
            unavailable: default_unavailable(),
            internal_error: default_internal_error(),
            model_unavailable: default_model_unavailable(),
            malformed_job: default_malformed_job(),
            processing_error: default_processing_error(),
        }
    }
}

fn default_timed_out() -> String {
    "The system is taking longer than expected to respond. Please try again.".to_string()
}
fn default_unavailable() -> String {
    "Chat service temporarily unavailable. Please try again in a few moments.".to_string()
}
fn default_internal_error() -> String {
    "An unexpected error occurred. Please try again.".to_string()
}
fn default_model_unavailable() -> String {
    "Sorry, I cannot generate a response right now. Please try again later.".to_string()
}
fn default_malformed_job() -> String {
    "Malformed request format.".to_string()
}
fn default_processing_error() -> String {
    "An error occurred while processing your request.".to_string()
}

// ============ logging ============

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `"text"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            filter: default_log_filter(),
        }
    }
}

fn default_log_format() -> String {
    "text".to_string()
}
fn default_log_filter() -> String {
    "maint_assist=info,tower_http=info".to_string()
}

// ============ loading ============

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.broker.backend.as_str() {
        "redis" | "memory" => {}
        other => anyhow::bail!(
            "Unknown broker backend: '{}'. Must be redis or memory.",
            other
        ),
    }

    match config.cache.backend.as_str() {
        "redis" | "memory" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown cache backend: '{}'. Must be redis, memory, or disabled.",
            other
        ),
    }

    match config.knowledge.backend.as_str() {
        "sqlite" | "memory" => {}
        other => anyhow::bail!(
            "Unknown knowledge backend: '{}'. Must be sqlite or memory.",
            other
        ),
    }

    if config.knowledge.retrieve_k == 0 || config.knowledge.keep_top == 0 {
        anyhow::bail!("knowledge.retrieve_k and knowledge.keep_top must be >= 1");
    }
    if config.knowledge.keep_top > config.knowledge.retrieve_k {
        anyhow::bail!("knowledge.keep_top must not exceed knowledge.retrieve_k");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.gateway.reply_timeout_secs == 0 {
        anyhow::bail!("gateway.reply_timeout_secs must be > 0");
    }
    if config.gateway.request_budget_secs < config.gateway.reply_timeout_secs {
        anyhow::bail!("gateway.request_budget_secs must be >= gateway.reply_timeout_secs");
    }
    if config.gateway.max_query_chars == 0 {
        anyhow::bail!("gateway.max_query_chars must be > 0");
    }

    if config.worker.concurrency == 0 {
        anyhow::bail!("worker.concurrency must be >= 1");
    }
    if config.broker.heartbeat_ttl_secs == 0 {
        anyhow::bail!("broker.heartbeat_ttl_secs must be > 0");
    }

    if !config.prompt.user_template.contains("{query}") {
        anyhow::bail!("prompt.user_template must contain a {{query}} placeholder");
    }

    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!("Unknown logging format: '{}'. Must be text or json.", other),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:5001");
        assert_eq!(cfg.broker.queue, "query_queue");
        assert_eq!(cfg.cache.ttl_secs, 3600);
        assert_eq!(cfg.knowledge.retrieve_k, 10);
        assert_eq!(cfg.knowledge.keep_top, 5);
        assert_eq!(cfg.gateway.reply_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.gateway.request_budget(), Duration::from_secs(30));
        assert_eq!(cfg.prompt.history_window, 10);
        assert!(!cfg.cache.invalidate_on_write);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let cfg = parse_config(
            r#"
[broker]
backend = "memory"

[gateway]
reply_timeout_secs = 2
request_budget_secs = 5
"#,
        )
        .unwrap();
        assert_eq!(cfg.broker.backend, "memory");
        assert_eq!(cfg.broker.reply_ttl_secs, 60);
        assert_eq!(cfg.gateway.reply_timeout_secs, 2);
        assert_eq!(cfg.gateway.max_query_chars, 4000);
    }

    #[test]
    fn test_rejects_unknown_backends() {
        assert!(parse_config("[broker]\nbackend = \"amqp\"").is_err());
        assert!(parse_config("[cache]\nbackend = \"memcached\"").is_err());
        assert!(parse_config("[embedding]\nprovider = \"cohere\"").is_err());
        assert!(parse_config("[logging]\nformat = \"xml\"").is_err());
    }

    #[test]
    fn test_rejects_inconsistent_bounds() {
        assert!(parse_config("[gateway]\nreply_timeout_secs = 40").is_err());
        assert!(parse_config("[knowledge]\nretrieve_k = 3\nkeep_top = 5").is_err());
        assert!(parse_config("[worker]\nconcurrency = 0").is_err());
        assert!(parse_config("[broker]\nheartbeat_ttl_secs = 0").is_err());
    }

    #[test]
    fn test_generated_worker_ids_are_unique_per_call() {
        let broker = BrokerConfig::default();
        let a = broker.worker_id();
        let b = broker.worker_id();
        assert_ne!(a, b);
        assert!(a.contains(&format!("-{}-", std::process::id())));

        let pinned = BrokerConfig {
            worker_id: Some("press-line-2".into()),
            ..Default::default()
        };
        assert_eq!(pinned.worker_id(), "press-line-2");
    }

    #[test]
    fn test_remote_embedding_requires_model_and_dims() {
        assert!(parse_config("[embedding]\nprovider = \"openai\"").is_err());
        assert!(parse_config(
            "[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536"
        )
        .is_ok());
    }
}
