//! The retrieval-augmented pipeline.
//!
//! [`RagPipeline`] ties the pieces together:
//!
//! ```text
//! ingest: bytes ─▶ loader ─▶ chunker ─▶ embedder ─▶ SharedIndex (write + persist)
//! ask:    question ─▶ embedder ─▶ SharedIndex (read, top-k) ─▶ composer ─▶ generator
//!                                                    ▲                       │
//!                                     session history└───────────────────────┘
//! ```
//!
//! Ingestion is all-or-nothing per document. Every chunk is embedded before
//! the index is touched, and the index insert and its durable write happen
//! under one lock acquisition that rolls back on failure.
//!
//! Generation is bounded twice: a wall-clock budget enforced here with
//! `tokio::time::timeout`, and a response token cap passed to the model
//! and re-applied to its output. Dropping an [`RagPipeline::ask`] future
//! (for example when an HTTP client disconnects) cancels the in-flight
//! model request.

use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use local_rag_core::chunk::chunk_pages;
use local_rag_core::error::RagError;
use local_rag_core::index::IndexEntry;
use local_rag_core::models::Passage;
use local_rag_core::prompt::PromptComposer;
use local_rag_core::session::{validate_session_id, SessionStore};
use local_rag_core::tokenize::truncate_to_tokens;

use crate::config::Config;
use crate::loader;
use crate::metrics::Metrics;
use crate::services::ModelServices;
use crate::shared_index::{IndexStats, LockPolicy, SharedIndex};
use crate::store::{DocumentRecord, LoadStatus};

/// Result of a successful ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub filename: String,
    pub pages: usize,
    pub chunks: usize,
}

/// A generated answer and the context it was conditioned on.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub response: String,
    pub passages: Vec<Passage>,
    pub prompt_tokens: usize,
    pub dropped_history: usize,
    pub dropped_passages: usize,
}

pub struct RagPipeline {
    config: Config,
    index: SharedIndex,
    models: ModelServices,
    sessions: SessionStore,
    composer: PromptComposer,
    metrics: Metrics,
}

impl RagPipeline {
    /// Build model backends from config, open the index, and load the
    /// generation model.
    ///
    /// A generator that fails to load is logged and left unloaded: the
    /// pipeline still ingests and retrieves, and chat requests fail with
    /// [`RagError::ModelUnavailable`].
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let models = ModelServices::from_config(config).await?;
        let pipeline = Self::with_models(config, models, Metrics::new()?).await?;
        let _ = pipeline.models.load(&pipeline.metrics).await;
        Ok(pipeline)
    }

    /// Open the index with injected model backends. The generator is not
    /// loaded; call [`ModelServices::load`] if needed.
    pub async fn with_models(
        config: &Config,
        models: ModelServices,
        metrics: Metrics,
    ) -> anyhow::Result<Self> {
        let embedder = models.embedder();
        let index = SharedIndex::open(
            &config.index.path,
            embedder.dims(),
            embedder.model_name(),
            LockPolicy::from(&config.locking),
        )
        .await?;
        metrics.set_index_entries(index.stats().await?.entries);

        let composer = PromptComposer::new(
            config.prompt.template()?,
            config.prompt.budget_tokens,
            config.prompt.system_instructions.clone(),
        );

        Ok(Self {
            config: config.clone(),
            index,
            sessions: SessionStore::new(config.session.limits()),
            models,
            composer,
            metrics,
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn models(&self) -> &ModelServices {
        &self.models
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// How the persisted index was obtained at startup.
    pub fn load_status(&self) -> &LoadStatus {
        self.index.load_status()
    }

    /// Load, chunk, embed, and index one uploaded document.
    ///
    /// Returns the number of chunks indexed. On any error nothing from this
    /// document is searchable or persisted.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn ingest(
        &self,
        session_id: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<IngestReport, RagError> {
        let started = Instant::now();
        match self.ingest_inner(session_id, filename, bytes).await {
            Ok(report) => {
                Metrics::observe(&self.metrics.ingest_duration, started.elapsed());
                self.metrics.index_entries.add(report.chunks as i64);
                info!(
                    document_id = %report.document_id,
                    filename = %report.filename,
                    pages = report.pages,
                    chunks = report.chunks,
                    "document ingested"
                );
                Ok(report)
            }
            Err(e) => {
                self.metrics.ingest_failures.inc();
                warn!(filename = %filename, code = e.error_code(), error = %e, "ingestion failed");
                Err(e)
            }
        }
    }

    async fn ingest_inner(
        &self,
        session_id: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<IngestReport, RagError> {
        validate_session_id(session_id)?;
        if bytes.is_empty() {
            return Err(RagError::InvalidInput("upload is empty".to_string()));
        }
        let filename = loader::sanitize_filename(filename);
        let content_hash = format!("{:x}", Sha256::digest(&bytes));

        let kind = loader::detect(&bytes, Some(filename.as_str()))?;
        let name = filename.clone();
        let pages =
            tokio::task::spawn_blocking(move || loader::extract(&bytes, Some(name.as_str())))
                .await
                .map_err(|e| RagError::CorruptDocument(format!("extraction task failed: {}", e)))??;

        let document_id = uuid::Uuid::new_v4().simple().to_string();
        let chunked = chunk_pages(
            &document_id,
            &pages,
            self.config.chunking.chunk_size,
            self.config.chunking.overlap,
        )?;

        let texts: Vec<String> = chunked.chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.models.embedder().embed_batch(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(RagError::EmbeddingModel(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                texts.len()
            )));
        }
        debug!(document_id = %document_id, chunks = texts.len(), "chunks embedded");

        let entries: Vec<IndexEntry> = chunked
            .chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry { chunk, vector })
            .collect();

        let record = DocumentRecord {
            id: document_id.clone(),
            session_id: session_id.to_string(),
            filename: filename.clone(),
            kind: kind.as_str().to_string(),
            content_hash,
            pages: pages.len(),
            chunk_count: entries.len(),
            ingested_at: chrono::Utc::now().timestamp(),
        };
        let chunks = self.index.insert_document(record, entries).await?;
        self.sessions.record_upload(session_id, &document_id);

        Ok(IngestReport {
            document_id,
            filename,
            pages: pages.len(),
            chunks,
        })
    }

    /// Top-`k` passages for `query`, highest score first. An empty index
    /// yields no passages rather than an error.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Passage>, RagError> {
        if query.trim().is_empty() {
            return Err(RagError::InvalidInput("query must not be empty".to_string()));
        }
        let started = Instant::now();
        if self.index.read().await?.index.is_empty() {
            debug!("index is empty, skipping retrieval");
            return Ok(Vec::new());
        }

        let vector = self.models.embedder().embed(query).await?;
        let hits = self.index.search(&vector, k).await?;
        Metrics::observe(&self.metrics.retrieval_duration, started.elapsed());
        Ok(hits.into_iter().map(|h| h.into_passage()).collect())
    }

    /// Answer `question` for `session_id` using retrieved context and the
    /// session's history, then record the exchange.
    #[instrument(skip(self, question))]
    pub async fn ask(&self, session_id: &str, question: &str) -> Result<Answer, RagError> {
        self.metrics.requests.inc();
        validate_session_id(session_id)?;
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::InvalidInput("message must not be empty".to_string()));
        }
        let generator = self.models.generator();
        if !generator.is_loaded() {
            return Err(RagError::ModelUnavailable(format!(
                "model '{}' is not loaded",
                generator.model_name()
            )));
        }

        let passages = self
            .retrieve(question, self.config.retrieval.top_k)
            .await?;
        let history = self.sessions.history(session_id);
        let prompt = self.composer.compose(&passages, &history, question)?;
        debug!(
            session_id,
            prompt_tokens = prompt.token_count,
            passages = prompt.passages.len(),
            history_turns = prompt.history_turns,
            dropped_history = prompt.dropped_history,
            dropped_passages = prompt.dropped_passages,
            "prompt composed"
        );

        let response = self.generate_capped(&prompt.text).await?;
        self.sessions
            .append_exchange(session_id, question, &response);

        Ok(Answer {
            response,
            passages: prompt.passages,
            prompt_tokens: prompt.token_count,
            dropped_history: prompt.dropped_history,
            dropped_passages: prompt.dropped_passages,
        })
    }

    async fn generate_capped(&self, prompt: &str) -> Result<String, RagError> {
        let max_tokens = self.config.generation.max_response_tokens;
        let budget_secs = self.config.generation.timeout_secs;
        let generator = self.models.generator();

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(budget_secs),
            generator.generate(prompt, max_tokens),
        )
        .await;
        Metrics::observe(&self.metrics.generation_duration, started.elapsed());

        let text = match result {
            Ok(text) => text?,
            Err(_) => {
                warn!(budget_secs, "generation exceeded its time budget");
                return Err(RagError::GenerationTimeout { secs: budget_secs });
            }
        };
        Ok(truncate_to_tokens(text.trim(), max_tokens).to_string())
    }

    /// Remove a document and all of its chunks by rebuilding the index.
    pub async fn delete_document(&self, document_id: &str) -> Result<usize, RagError> {
        let removed = self.index.delete_document(document_id).await?;
        self.sessions.forget_document(document_id);
        self.metrics.index_entries.sub(removed as i64);
        info!(document_id, removed, "document deleted, index rebuilt");
        Ok(removed)
    }

    pub async fn documents(&self) -> Result<Vec<DocumentRecord>, RagError> {
        self.index.documents().await
    }

    /// Indexed documents uploaded through `session_id` in this process,
    /// in upload order.
    pub async fn session_documents(
        &self,
        session_id: &str,
    ) -> Result<Vec<DocumentRecord>, RagError> {
        validate_session_id(session_id)?;
        let uploads = self.sessions.uploads(session_id);
        if uploads.is_empty() {
            return Ok(Vec::new());
        }
        let mut documents = self.index.documents().await?;
        documents.retain(|d| uploads.contains(&d.id));
        documents.sort_by_key(|d| uploads.iter().position(|id| *id == d.id));
        Ok(documents)
    }

    pub async fn stats(&self) -> Result<IndexStats, RagError> {
        self.index.stats().await
    }

    /// Drop a session and its history. Returns `false` for unknown sessions.
    pub fn reset_session(&self, session_id: &str) -> bool {
        self.sessions.reset(session_id)
    }

    /// Unload the model and close the index store.
    pub async fn shutdown(&self) {
        self.models.shutdown().await;
        self.index.close().await;
    }
}
