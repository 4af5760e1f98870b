//! Shared fixtures for the integration tests: config builders, stub model
//! backends for failure injection, and document generators.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use local_rag::config::{parse_config, Config};
use local_rag::generator::Generator;
use local_rag::metrics::Metrics;
use local_rag::pipeline::RagPipeline;
use local_rag::services::ModelServices;
use local_rag_core::embedding::{Embedder, HashEmbedder};
use local_rag_core::error::RagError;

pub const DIMS: usize = 256;

pub fn test_config(tmp: &TempDir) -> Config {
    test_config_with(tmp, "")
}

/// Test config with extra TOML appended (later keys must be in sections
/// not already present above).
pub fn test_config_with(tmp: &TempDir, extra: &str) -> Config {
    let content = format!(
        r#"
[index]
path = "{}/index.sqlite"

[chunking]
chunk_size = 200
overlap = 20

[retrieval]
top_k = 4

[embedding]
provider = "hash"
dims = {}

[locking]
max_retries = 8
backoff_ms = 5

{}
"#,
        tmp.path().display(),
        DIMS,
        extra
    );
    parse_config(&content).unwrap()
}

/// Generator that answers with a fixed reply after an optional delay and
/// records every prompt it was given.
pub struct StubGenerator {
    reply: String,
    delay: Duration,
    loaded: AtomicBool,
    pub calls: AtomicUsize,
    /// Generations that ran to completion, including the delay.
    pub completed: AtomicUsize,
    pub last_prompt: std::sync::Mutex<String>,
}

impl StubGenerator {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            delay: Duration::ZERO,
            loaded: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            last_prompt: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn slow(reply: &str, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(reply)
        }
    }

    pub fn unloaded() -> Self {
        let generator = Self::new("unused");
        generator.loaded.store(false, Ordering::SeqCst);
        generator
    }
}

#[async_trait]
impl Generator for StubGenerator {
    fn model_name(&self) -> &str {
        "stub-generator"
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn load(&self) -> Result<(), RagError> {
        Ok(())
    }

    async fn generate(&self, prompt: &str, _max: usize) -> Result<String, RagError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = prompt.to_string();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

/// Hash embedder that fails any batch containing `trigger`.
pub struct FailingEmbedder {
    inner: HashEmbedder,
    trigger: String,
}

impl FailingEmbedder {
    pub fn new(trigger: &str) -> Self {
        Self {
            inner: HashEmbedder::new(DIMS),
            trigger: trigger.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model_name(&self) -> &str {
        HashEmbedder::MODEL_NAME
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.iter().any(|t| t.contains(&self.trigger)) {
            return Err(RagError::EmbeddingModel("backend went away".to_string()));
        }
        self.inner.embed_batch(texts).await
    }
}

/// Hash embedder that returns a short vector for the chunk containing
/// `trigger`, as a misconfigured backend would.
pub struct ShortVectorEmbedder {
    inner: HashEmbedder,
    trigger: String,
}

impl ShortVectorEmbedder {
    pub fn new(trigger: &str) -> Self {
        Self {
            inner: HashEmbedder::new(DIMS),
            trigger: trigger.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for ShortVectorEmbedder {
    fn model_name(&self) -> &str {
        HashEmbedder::MODEL_NAME
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let mut vectors = self.inner.embed_batch(texts).await?;
        for (text, vector) in texts.iter().zip(vectors.iter_mut()) {
            if text.contains(&self.trigger) {
                vector.truncate(DIMS / 2);
            }
        }
        Ok(vectors)
    }
}

pub fn hash_embedder() -> Arc<dyn Embedder> {
    Arc::new(HashEmbedder::new(DIMS))
}

pub async fn open_pipeline(
    config: &Config,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
) -> RagPipeline {
    let models = ModelServices::new(embedder, generator);
    RagPipeline::with_models(config, models, Metrics::new().unwrap())
        .await
        .unwrap()
}

/// `count` space-separated words cycling through `vocabulary`.
pub fn words(vocabulary: &[&str], count: usize) -> String {
    (0..count)
        .map(|i| vocabulary[i % vocabulary.len()])
        .collect::<Vec<_>>()
        .join(" ")
}

/// A plain-text document whose pages are separated by form feeds.
pub fn paged_text(pages: &[String]) -> Vec<u8> {
    pages.join("\u{c}").into_bytes()
}

pub const PAGE_ONE: &[&str] = &["apple", "banana", "cherry", "orchard"];
pub const PAGE_TWO: &[&str] = &["quantum", "photon", "laser", "optics"];
pub const PAGE_THREE: &[&str] = &["river", "mountain", "forest", "valley"];

/// Three pages of 600 words each, one vocabulary per page.
pub fn three_page_document() -> Vec<u8> {
    paged_text(&[
        words(PAGE_ONE, 600),
        words(PAGE_TWO, 600),
        words(PAGE_THREE, 600),
    ])
}
