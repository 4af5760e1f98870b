//! Generation model abstraction and backends.
//!
//! - **[`OllamaGenerator`]** runs a local model through an Ollama server's
//!   `POST /api/generate` endpoint with a raw, fully-rendered prompt.
//! - **[`DisabledGenerator`]** always fails with
//!   [`RagError::ModelUnavailable`]; the service still ingests and
//!   retrieves, and `/health` reports unhealthy.
//!
//! A generator is constructed once, loaded once at startup, shared
//! read-only by every request, and shut down explicitly. It does not retry;
//! the caller decides whether to try again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use local_rag_core::error::RagError;

use crate::config::GenerationConfig;

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    /// Whether [`Generator::load`] has completed successfully.
    fn is_loaded(&self) -> bool;

    /// Load model weights. Called once before serving.
    async fn load(&self) -> Result<(), RagError>;

    /// Produce a response of at most `max_response_tokens` tokens.
    async fn generate(&self, prompt: &str, max_response_tokens: usize)
        -> Result<String, RagError>;

    /// Release the model.
    async fn shutdown(&self) -> Result<(), RagError> {
        Ok(())
    }
}

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn is_loaded(&self) -> bool {
        false
    }

    async fn load(&self) -> Result<(), RagError> {
        Err(RagError::ModelUnavailable(
            "generation provider is disabled".to_string(),
        ))
    }

    async fn generate(&self, _prompt: &str, _max: usize) -> Result<String, RagError> {
        Err(RagError::ModelUnavailable(
            "generation provider is disabled".to_string(),
        ))
    }
}

/// Generator backed by a local Ollama server.
///
/// Prompts are sent with `raw: true` because the prompt composer already
/// applied the chat template. `num_predict` carries the response cap.
pub struct OllamaGenerator {
    model: String,
    url: String,
    temperature: f32,
    timeout_secs: u64,
    client: reqwest::Client,
    loaded: AtomicBool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self, RagError> {
        // The pipeline enforces the real budget; this only bounds a hung socket.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs + 5))
            .build()
            .map_err(|e| RagError::ModelUnavailable(e.to_string()))?;
        Ok(Self {
            model: config.model.clone(),
            url: config.url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            timeout_secs: config.timeout_secs,
            client,
            loaded: AtomicBool::new(false),
        })
    }

    async fn post(&self, body: serde_json::Value) -> Result<GenerateResponse, RagError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::ModelUnavailable(format!(
                "Ollama error {} for model '{}': {}",
                status, self.model, text
            )));
        }
        response
            .json::<GenerateResponse>()
            .await
            .map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, e: reqwest::Error) -> RagError {
        if e.is_timeout() {
            RagError::GenerationTimeout {
                secs: self.timeout_secs,
            }
        } else if e.is_connect() {
            RagError::ModelUnavailable(format!(
                "cannot reach Ollama at {} (is it running?): {}",
                self.url, e
            ))
        } else {
            RagError::ModelUnavailable(e.to_string())
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    async fn load(&self) -> Result<(), RagError> {
        // A request without a prompt makes Ollama load the weights and return.
        self.post(serde_json::json!({
            "model": self.model,
            "keep_alive": "30m",
        }))
        .await?;
        self.loaded.store(true, Ordering::Release);
        info!(model = %self.model, url = %self.url, "generation model loaded");
        Ok(())
    }

    async fn generate(
        &self,
        prompt: &str,
        max_response_tokens: usize,
    ) -> Result<String, RagError> {
        if !self.is_loaded() {
            return Err(RagError::ModelUnavailable(format!(
                "model '{}' is still loading",
                self.model
            )));
        }
        let reply = self
            .post(serde_json::json!({
                "model": self.model,
                "prompt": prompt,
                "raw": true,
                "stream": false,
                "options": {
                    "num_predict": max_response_tokens,
                    "temperature": self.temperature,
                    "stop": ["<|im_end|>", "<|im_start|>", "\nUser:"],
                },
            }))
            .await?;
        debug!(chars = reply.response.len(), "generation finished");
        Ok(reply.response)
    }

    async fn shutdown(&self) -> Result<(), RagError> {
        if !self.loaded.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        match self
            .post(serde_json::json!({ "model": self.model, "keep_alive": 0 }))
            .await
        {
            Ok(_) => {
                info!(model = %self.model, "generation model unloaded");
                Ok(())
            }
            Err(e) => {
                warn!(model = %self.model, error = %e, "model unload failed");
                Err(e)
            }
        }
    }
}

/// Build the generator named by `config.provider`. Does not load it.
pub fn create_generator(
    config: &GenerationConfig,
) -> anyhow::Result<std::sync::Arc<dyn Generator>> {
    match config.provider.as_str() {
        "ollama" => Ok(std::sync::Arc::new(OllamaGenerator::new(config)?)),
        "disabled" => Ok(std::sync::Arc::new(DisabledGenerator)),
        other => anyhow::bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> GenerationConfig {
        GenerationConfig {
            // Port 9 (discard) on localhost refuses connections.
            url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            ..GenerationConfig::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_generator_is_unavailable() {
        let generator = DisabledGenerator;
        assert!(!generator.is_loaded());
        assert!(matches!(
            generator.generate("hi", 10).await,
            Err(RagError::ModelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_ollama_is_unavailable() {
        let generator = OllamaGenerator::new(&unreachable_config()).unwrap();
        let err = generator.load().await.unwrap_err();
        assert!(matches!(err, RagError::ModelUnavailable(_)), "{err:?}");
        assert!(!generator.is_loaded());
    }

    #[tokio::test]
    async fn test_generate_before_load_is_unavailable() {
        let generator = OllamaGenerator::new(&unreachable_config()).unwrap();
        assert!(matches!(
            generator.generate("prompt", 16).await,
            Err(RagError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn test_create_generator() {
        let config = GenerationConfig {
            provider: "disabled".to_string(),
            ..GenerationConfig::default()
        };
        assert_eq!(create_generator(&config).unwrap().model_name(), "disabled");
    }
}
