//! Model services: the embedder and generator shared by all requests.
//!
//! Both are built once from config (or injected, for tests and embedding
//! in other binaries), loaded once, and torn down explicitly with
//! [`ModelServices::shutdown`].

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument, warn};

use local_rag_core::embedding::Embedder;
use local_rag_core::error::RagError;

use crate::config::Config;
use crate::generator::{create_generator, Generator};
use crate::metrics::Metrics;
use crate::providers::create_embedder;

#[derive(Clone)]
pub struct ModelServices {
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
}

impl ModelServices {
    pub fn new(embedder: Arc<dyn Embedder>, generator: Arc<dyn Generator>) -> Self {
        Self {
            embedder,
            generator,
        }
    }

    /// Build the backends named in `config`. Nothing is loaded yet.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let embedder = create_embedder(&config.embedding).await?;
        let generator = create_generator(&config.generation)?;
        Ok(Self::new(embedder, generator))
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn generator(&self) -> &Arc<dyn Generator> {
        &self.generator
    }

    /// Load the generation model and record how long it took.
    #[instrument(skip(self, metrics), fields(model = %self.generator.model_name()))]
    pub async fn load(&self, metrics: &Metrics) -> Result<(), RagError> {
        if self.generator.is_loaded() {
            return Ok(());
        }
        let started = Instant::now();
        let result = self.generator.load().await;
        Metrics::observe(&metrics.model_load_duration, started.elapsed());
        match &result {
            Ok(()) => info!(
                model = %self.generator.model_name(),
                secs = started.elapsed().as_secs_f64(),
                "model ready"
            ),
            Err(e) => warn!(
                model = %self.generator.model_name(),
                error = %e,
                "model failed to load; chat requests will be rejected"
            ),
        }
        result
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.generator.shutdown().await {
            warn!(error = %e, "generator shutdown failed");
        }
    }
}
