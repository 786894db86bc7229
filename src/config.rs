//! TOML configuration parsing.
//!
//! All non-secret settings are read from a single TOML file. Upstream API
//! keys are never stored in the file; each upstream section names the
//! environment variable that holds its key (`api_key_env`).
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:5050"
//!
//! [openai]
//! endpoint = "https://my-resource.openai.azure.com"
//! chat_deployment = "gpt-4o-mini"
//! embedding_deployment = "text-embedding-3-small"
//!
//! [search]
//! endpoint = "https://my-search.search.windows.net"
//! index_name = "training-index"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Largest `topK` a request may ask for.
pub const MAX_TOP_K: usize = 20;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub openai: OpenAiConfig,
    pub search: SearchConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    /// Per-request deadline. Unset means requests may run indefinitely.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origin: default_cors_origin(),
            request_timeout_secs: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5050".to_string()
}
fn default_cors_origin() -> String {
    "*".to_string()
}

/// Azure OpenAI deployment settings shared by the embedder and the generator.
#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    pub endpoint: String,
    #[serde(default = "default_openai_api_version")]
    pub api_version: String,
    pub chat_deployment: String,
    pub embedding_deployment: String,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
}

fn default_openai_api_version() -> String {
    "2024-06-01".to_string()
}
fn default_openai_key_env() -> String {
    "AZURE_OPENAI_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    pub endpoint: String,
    #[serde(default = "default_index_name")]
    pub index_name: String,
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_search_api_version")]
    pub api_version: String,
    #[serde(default = "default_vector_field")]
    pub vector_field: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
}

fn default_index_name() -> String {
    "training-index".to_string()
}
fn default_search_key_env() -> String {
    "AZURE_SEARCH_ADMIN_KEY".to_string()
}
fn default_search_api_version() -> String {
    "2023-11-01".to_string()
}
fn default_vector_field() -> String {
    "content_vector".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    8
}

/// What happens to a user turn that never receives an assistant reply
/// (upstream failure, timeout or client cancellation).
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnansweredTurns {
    /// Keep the question in the ledger.
    #[default]
    Retain,
    /// Remove the question from the ledger.
    Discard,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    /// Number of prior turns replayed to the model.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Upper bound on live conversations; least-recently-used are evicted.
    #[serde(default)]
    pub max_conversations: Option<usize>,
    /// Upper bound on turns kept per conversation; oldest are dropped.
    #[serde(default)]
    pub max_turns: Option<usize>,
    /// Conversations untouched for this long are expired.
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,
    #[serde(default)]
    pub unanswered_turns: UnansweredTurns,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            history_turns: default_history_turns(),
            max_conversations: None,
            max_turns: None,
            idle_ttl_secs: None,
            unanswered_turns: UnansweredTurns::Retain,
        }
    }
}

fn default_history_turns() -> usize {
    20
}

impl OpenAiConfig {
    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String> {
        read_key(&self.api_key_env)
    }
}

impl SearchConfig {
    pub fn api_key(&self) -> Result<String> {
        read_key(&self.api_key_env)
    }
}

fn read_key(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => bail!("{} environment variable not set", var),
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.openai.endpoint.trim().is_empty() {
        bail!("openai.endpoint must not be empty");
    }
    if config.openai.chat_deployment.trim().is_empty() {
        bail!("openai.chat_deployment must not be empty");
    }
    if config.openai.embedding_deployment.trim().is_empty() {
        bail!("openai.embedding_deployment must not be empty");
    }
    if !(0.0..=2.0).contains(&config.openai.temperature) {
        bail!("openai.temperature must be in [0.0, 2.0]");
    }

    if config.search.endpoint.trim().is_empty() {
        bail!("search.endpoint must not be empty");
    }
    if config.search.index_name.trim().is_empty() {
        bail!("search.index_name must not be empty");
    }

    if !(1..=MAX_TOP_K).contains(&config.retrieval.default_top_k) {
        bail!("retrieval.default_top_k must be in [1, {}]", MAX_TOP_K);
    }

    if config.conversation.history_turns == 0 {
        bail!("conversation.history_turns must be > 0");
    }
    if config.conversation.max_conversations == Some(0) {
        bail!("conversation.max_conversations must be > 0 when set");
    }
    if config.conversation.max_turns == Some(0) {
        bail!("conversation.max_turns must be > 0 when set");
    }

    Ok(())
}
