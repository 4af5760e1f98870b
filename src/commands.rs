//! CLI command implementations.
//!
//! Each `run_*` function opens what it needs, prints a human-readable
//! result, and closes the index store before returning. Only `ask` loads
//! the generation model.

use std::path::Path;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::pipeline::RagPipeline;
use crate::services::ModelServices;

/// Session id used by CLI commands when `--session` is not given.
pub const CLI_SESSION: &str = "cli";

/// Open the pipeline without loading the generation model.
async fn open_for_indexing(config: &Config) -> Result<RagPipeline> {
    let models = ModelServices::from_config(config).await?;
    RagPipeline::with_models(config, models, Metrics::new()?).await
}

pub async fn run_init(config: &Config) -> Result<()> {
    let pipeline = open_for_indexing(config).await?;
    let stats = pipeline.stats().await?;
    if pipeline.load_status().is_reset() {
        println!("Index initialized at {}.", stats.path);
    } else {
        println!(
            "Index at {} already holds {} entries from {} documents.",
            stats.path, stats.entries, stats.documents
        );
    }
    pipeline.shutdown().await;
    Ok(())
}

pub async fn run_ingest(config: &Config, file: &Path, session: &str) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    let pipeline = open_for_indexing(config).await?;
    let result = pipeline.ingest(session, &filename, bytes).await;
    pipeline.shutdown().await;
    let report = result?;

    println!(
        "Ingested {} ({} pages) as {}: {} chunks indexed.",
        report.filename, report.pages, report.document_id, report.chunks
    );
    Ok(())
}

pub async fn run_ask(config: &Config, question: &str, session: &str) -> Result<()> {
    let pipeline = RagPipeline::open(config).await?;
    let result = pipeline.ask(session, question).await;
    pipeline.shutdown().await;
    let answer = result?;

    println!("{}", answer.response);
    if answer.passages.is_empty() {
        println!();
        println!("(no indexed passages)");
        return Ok(());
    }
    println!();
    println!("Sources:");
    for (i, p) in answer.passages.iter().enumerate() {
        println!(
            "  {}. [{:.3}] {}  pages {}-{}",
            i + 1,
            p.score,
            p.chunk_id,
            p.page_start,
            p.page_end
        );
    }
    Ok(())
}

pub async fn run_delete(config: &Config, document_id: &str) -> Result<()> {
    let pipeline = open_for_indexing(config).await?;
    let result = pipeline.delete_document(document_id).await;
    pipeline.shutdown().await;
    let removed = result?;
    println!("Deleted {} ({} chunks removed).", document_id, removed);
    Ok(())
}

pub async fn run_documents(config: &Config) -> Result<()> {
    let pipeline = open_for_indexing(config).await?;
    let documents = pipeline.documents().await;
    pipeline.shutdown().await;
    let documents = documents?;

    if documents.is_empty() {
        println!("No documents indexed.");
        return Ok(());
    }
    println!(
        "{:<34} {:<28} {:>6} {:>7}   {}",
        "ID", "FILENAME", "PAGES", "CHUNKS", "INGESTED"
    );
    println!("{}", "-".repeat(98));
    for d in &documents {
        let ingested = chrono::DateTime::from_timestamp(d.ingested_at, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<34} {:<28} {:>6} {:>7}   {}",
            d.id,
            truncate_display(&d.filename, 28),
            d.pages,
            d.chunk_count,
            ingested
        );
    }
    Ok(())
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pipeline = open_for_indexing(config).await?;
    let stats = pipeline.stats().await;
    pipeline.shutdown().await;
    let stats = stats?;

    println!("Local RAG: Index Stats");
    println!("======================");
    println!();
    println!("  Index:       {}", stats.path);
    println!("  Size:        {}", format_bytes(stats.size_bytes));
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Chunks:      {}", stats.entries);
    println!("  Model:       {} ({} dims)", stats.model, stats.dims);
    println!();
    Ok(())
}

fn truncate_display(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let kept: String = s.chars().take(width.saturating_sub(1)).collect();
    format!("{}…", kept)
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_truncate_display() {
        assert_eq!(truncate_display("short.pdf", 28), "short.pdf");
        assert_eq!(truncate_display("abcdefgh", 5), "abcd…");
    }
}
