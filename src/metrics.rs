//! Prometheus metrics for the pipeline.
//!
//! Tracks:
//! - `rag_requests_total` - chat requests received
//! - `rag_ingest_failures_total` - uploads rejected or rolled back
//! - `rag_ingest_duration_seconds` - load + chunk + embed + index per document
//! - `rag_retrieval_duration_seconds` - query embedding + index search
//! - `rag_generation_duration_seconds` - generator wall-clock time
//! - `rag_model_load_duration_seconds` - generator warm-up at startup
//! - `rag_index_entries` - current number of index entries
//! - `rag_process_resident_memory_bytes` - resident set size of this process,
//!   sampled by [`Metrics::spawn_memory_monitor`] and on every render
//!
//! Exposed in the text exposition format by `GET /metrics`; scraping and
//! dashboards are left to an external collector.

use std::time::Duration;

use anyhow::Result;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub requests: IntCounter,
    pub ingest_failures: IntCounter,
    pub ingest_duration: Histogram,
    pub retrieval_duration: Histogram,
    pub generation_duration: Histogram,
    pub model_load_duration: Histogram,
    pub index_entries: IntGauge,
    pub resident_memory: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounter::new("rag_requests_total", "Total chat requests")?;
        let ingest_failures =
            IntCounter::new("rag_ingest_failures_total", "Total failed document ingestions")?;
        let ingest_duration = histogram(
            "rag_ingest_duration_seconds",
            "Document ingestion duration in seconds",
            vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        )?;
        let retrieval_duration = histogram(
            "rag_retrieval_duration_seconds",
            "Query embedding and index search duration in seconds",
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
        )?;
        let generation_duration = histogram(
            "rag_generation_duration_seconds",
            "Generation duration in seconds",
            vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
        )?;
        let model_load_duration = histogram(
            "rag_model_load_duration_seconds",
            "Generation model load duration in seconds",
            vec![0.1, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0],
        )?;
        let index_entries = IntGauge::new("rag_index_entries", "Entries in the vector index")?;
        let resident_memory = IntGauge::new(
            "rag_process_resident_memory_bytes",
            "Resident memory of the process in bytes",
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(ingest_failures.clone()))?;
        registry.register(Box::new(ingest_duration.clone()))?;
        registry.register(Box::new(retrieval_duration.clone()))?;
        registry.register(Box::new(generation_duration.clone()))?;
        registry.register(Box::new(model_load_duration.clone()))?;
        registry.register(Box::new(index_entries.clone()))?;
        registry.register(Box::new(resident_memory.clone()))?;

        Ok(Self {
            registry,
            requests,
            ingest_failures,
            ingest_duration,
            retrieval_duration,
            generation_duration,
            model_load_duration,
            index_entries,
            resident_memory,
        })
    }

    pub fn observe(histogram: &Histogram, elapsed: Duration) {
        histogram.observe(elapsed.as_secs_f64());
    }

    pub fn set_index_entries(&self, entries: usize) {
        self.index_entries.set(entries as i64);
    }

    /// Sample this process's resident memory into the gauge. Returns the
    /// sampled value, or `None` where the platform does not report it.
    pub fn sample_memory(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = System::new();
        system.refresh_process(pid);
        let bytes = system.process(pid)?.memory();
        self.resident_memory.set(bytes as i64);
        Some(bytes)
    }

    /// Sample resident memory every `interval` until the task is aborted.
    pub fn spawn_memory_monitor(&self, interval: Duration) -> JoinHandle<()> {
        let metrics = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Some(bytes) = metrics.sample_memory() {
                    debug!(resident_mb = bytes / (1024 * 1024), "memory usage");
                }
            }
        })
    }

    /// Content type of [`Metrics::render`] output.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Current values in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        self.sample_memory();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Result<Histogram> {
    Ok(Histogram::with_opts(
        HistogramOpts::new(name, help).buckets(buckets),
    )?)
}
