//! TOML configuration.
//!
//! Every section except `[index]` has defaults, so a minimal config is:
//!
//! ```toml
//! [index]
//! path = "./data/index.sqlite"
//! ```
//!
//! [`load_config`] parses and validates; [`parse_config`] does the same on
//! an in-memory string.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use local_rag_core::prompt::PromptTemplate;
use local_rag_core::session::SessionLimits;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub locking: LockingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// SQLite file holding vectors and the chunk map together.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    200
}
fn default_overlap() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
            url: default_ollama_url(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_embedding_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: usize,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            url: default_ollama_url(),
            max_response_tokens: default_max_response_tokens(),
            timeout_secs: default_generation_timeout(),
            temperature: default_temperature(),
        }
    }
}

fn default_generation_provider() -> String {
    "ollama".to_string()
}
fn default_generation_model() -> String {
    "qwen2.5:0.5b-instruct".to_string()
}
fn default_max_response_tokens() -> usize {
    256
}
fn default_generation_timeout() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    #[serde(default = "default_budget_tokens")]
    pub budget_tokens: usize,
    #[serde(default = "default_system_instructions")]
    pub system_instructions: String,
    #[serde(default = "default_template")]
    pub template: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_tokens: default_budget_tokens(),
            system_instructions: default_system_instructions(),
            template: default_template(),
        }
    }
}

impl PromptConfig {
    pub fn template(&self) -> Result<PromptTemplate> {
        PromptTemplate::parse(&self.template).with_context(|| {
            format!(
                "Unknown prompt template: '{}'. Must be chatml or plain.",
                self.template
            )
        })
    }
}

fn default_budget_tokens() -> usize {
    2048
}
fn default_system_instructions() -> String {
    "You are a helpful assistant. Answer the question using the context passages \
     when they are relevant. If the context does not contain the answer, say so \
     briefly. Keep answers concise."
        .to_string()
}
fn default_template() -> String {
    "chatml".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_max_history_tokens")]
    pub max_history_tokens: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_history_tokens: default_max_history_tokens(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl SessionConfig {
    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            max_turns: self.max_turns,
            max_history_tokens: self.max_history_tokens,
            max_sessions: self.max_sessions,
        }
    }
}

fn default_max_turns() -> usize {
    20
}
fn default_max_history_tokens() -> usize {
    1024
}
fn default_max_sessions() -> usize {
    10_000
}

/// Retry policy for readers that find the index write-locked.
#[derive(Debug, Deserialize, Clone)]
pub struct LockingConfig {
    #[serde(default = "default_lock_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            max_retries: default_lock_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_lock_retries() -> u32 {
    8
}
fn default_backoff_ms() -> u64 {
    25
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        bail!(
            "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
            config.chunking.overlap,
            config.chunking.chunk_size
        );
    }

    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }

    if config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "hash" | "local" => {}
        "ollama" => {
            if config.embedding.model.is_none() {
                bail!("embedding.model must be specified when provider is 'ollama'");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, ollama, or local.",
            other
        ),
    }

    match config.generation.provider.as_str() {
        "disabled" => {}
        "ollama" => {
            if config.generation.model.trim().is_empty() {
                bail!("generation.model must be specified when provider is 'ollama'");
            }
        }
        other => bail!(
            "Unknown generation provider: '{}'. Must be ollama or disabled.",
            other
        ),
    }
    if config.generation.max_response_tokens == 0 {
        bail!("generation.max_response_tokens must be > 0");
    }
    if config.generation.timeout_secs == 0 {
        bail!("generation.timeout_secs must be > 0");
    }

    if config.prompt.budget_tokens == 0 {
        bail!("prompt.budget_tokens must be > 0");
    }
    config.prompt.template()?;

    if config.session.max_turns < 2 {
        bail!("session.max_turns must be >= 2 (one question and its answer)");
    }
    if config.session.max_sessions == 0 {
        bail!("session.max_sessions must be > 0");
    }

    if config.server.max_upload_bytes == 0 {
        bail!("server.max_upload_bytes must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("[index]\npath = \"./data/index.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.chunk_size, 200);
        assert_eq!(config.chunking.overlap, 20);
        assert_eq!(config.retrieval.top_k, 4);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.embedding.dims, 384);
        assert_eq!(config.generation.model, "qwen2.5:0.5b-instruct");
        assert_eq!(config.prompt.template().unwrap(), PromptTemplate::ChatMl);
        assert_eq!(config.server.bind, "0.0.0.0:8000");
        assert_eq!(config.session.limits().max_sessions, 10_000);
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(include_str!("../config/rag.example.toml")).unwrap();
        assert_eq!(config.generation.provider, "ollama");
        assert_eq!(config.locking.backoff_ms, 25);
    }

    #[test]
    fn test_missing_index_section_fails() {
        assert!(parse_config("[chunking]\nchunk_size = 10\n").is_err());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk_size() {
        let err = parse_config(
            "[index]\npath = \"x\"\n[chunking]\nchunk_size = 20\noverlap = 20\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_zero_max_sessions_rejected() {
        let err = parse_config("[index]\npath = \"x\"\n[session]\nmax_sessions = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("max_sessions"));
    }

    #[test]
    fn test_ollama_embedding_requires_model() {
        let err = parse_config("[index]\npath = \"x\"\n[embedding]\nprovider = \"ollama\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn test_unknown_providers_rejected() {
        assert!(parse_config("[index]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n").is_err());
        assert!(parse_config("[index]\npath = \"x\"\n[generation]\nprovider = \"llama\"\n").is_err());
        assert!(parse_config("[index]\npath = \"x\"\n[prompt]\ntemplate = \"vicuna\"\n").is_err());
    }
}
