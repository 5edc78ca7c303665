//! # kbase CLI (`kb`)
//!
//! The `kb` binary drives the ingestion and retrieval engine: database
//! initialization, document ingestion, semantic search, deletion, embedding
//! rebuilds, and index statistics.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the database and schema for the configured backend |
//! | `kb ingest <file>` | Extract, chunk, embed, and index one document |
//! | `kb search "<query>"` | Ranked nearest-neighbor search |
//! | `kb delete <id>` | Remove a document and all its vectors |
//! | `kb rebuild` | Re-embed chunks in resumable batches |
//! | `kb stats` | Aggregate and per-document index statistics |

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kbase::config::{load_config, Config};
use kbase::extract::resolve_format;
use kbase::ingest::{ingest_bytes, rebuild_embeddings};
use kbase::models::DocumentFormat;
use kbase::retrieval::{Retriever, SearchRequest};
use kbase::store::{create_store, VectorStore};

/// kbase — a document ingestion and semantic retrieval engine.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "kbase — document ingestion and semantic retrieval",
    version,
    long_about = "kbase extracts text from uploaded documents (PDF, DOCX, TXT, MD), \
    splits it into overlapping chunks, embeds them, and serves ranked cosine-similarity \
    search from an embedded SQLite store or a PostgreSQL + pgvector store."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the configured backend's tables (and, for postgres, the
    /// pgvector extension and HNSW index). Idempotent.
    Init,

    /// Ingest a document file.
    Ingest {
        /// Path to the document.
        file: PathBuf,

        /// Declared format (pdf, docx, doc, txt, md). Defaults to the file
        /// extension; an unsupported format fails closed.
        #[arg(long)]
        format: Option<String>,
    },

    /// Search indexed chunks.
    Search {
        /// Query text.
        query: String,

        /// Number of results. Defaults to retrieval.k from config.
        #[arg(long)]
        k: Option<i64>,

        /// Restrict results to one document.
        #[arg(long)]
        document_id: Option<i64>,

        /// Minimum similarity in [0, 1]. Defaults to config.
        #[arg(long)]
        min_similarity: Option<f32>,

        /// Also print entities/relations extracted from the result set.
        #[arg(long)]
        enrich: bool,
    },

    /// Delete a document and all its chunks and vectors.
    Delete {
        /// Document id.
        id: i64,
    },

    /// Re-embed chunks in resumable batches.
    Rebuild {
        /// Chunks per committed batch.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Only embed chunks that have no embedding yet.
        #[arg(long)]
        missing_only: bool,
    },

    /// Show index statistics.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&config).await,
        Commands::Ingest { file, format } => run_ingest(&config, &file, format.as_deref()).await,
        Commands::Search {
            query,
            k,
            document_id,
            min_similarity,
            enrich,
        } => run_search(&config, &query, k, document_id, min_similarity, enrich).await,
        Commands::Delete { id } => run_delete(&config, id).await,
        Commands::Rebuild {
            batch_size,
            missing_only,
        } => run_rebuild(&config, batch_size, missing_only).await,
        Commands::Stats => run_stats(&config).await,
    }
}

async fn run_init(config: &Config) -> Result<()> {
    create_store(config).await?;
    println!("initialized {} backend", config.store.backend);
    Ok(())
}

async fn run_ingest(config: &Config, file: &std::path::Path, format: Option<&str>) -> Result<()> {
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("invalid file path: {}", file.display()))?
        .to_string();

    let declared: DocumentFormat = resolve_format(format, &filename)?;
    let bytes =
        std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;

    let store = create_store(config).await?;
    let retriever = Retriever::from_config(config, store)?;

    let report = ingest_bytes(
        retriever.store(),
        retriever.embedder(),
        config,
        &filename,
        declared,
        &bytes,
        None,
    )
    .await?;

    println!("ingest {}", filename);
    println!("  document id: {}", report.document_id);
    println!("  pages: {}", report.page_count);
    println!("  paragraphs: {}", report.paragraph_count);
    println!("  chunks written: {}", report.chunk_count);
    println!("  embeddings written: {}", report.embedded_count);
    println!("ok");
    Ok(())
}

async fn run_search(
    config: &Config,
    query: &str,
    k: Option<i64>,
    document_id: Option<i64>,
    min_similarity: Option<f32>,
    enrich: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    if let Some(m) = min_similarity {
        if !(0.0..=1.0).contains(&m) {
            bail!("--min-similarity must be in [0, 1]");
        }
    }

    let store = create_store(config).await?;
    let retriever = Retriever::from_config(config, store)?;

    let request = SearchRequest {
        query: query.to_string(),
        k: k.unwrap_or(retriever.default_k()),
        document_id,
        min_similarity,
    };
    let hits = retriever.search(&request).await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.3}] document {} / chunk {}",
            i + 1,
            hit.similarity,
            hit.document_id,
            hit.chunk_index
        );
        println!("    excerpt: \"{}\"", excerpt(&hit.content));
        println!();
    }

    if enrich {
        let enrichment = retriever.enrich(&hits);
        if enrichment.entities.is_empty() {
            println!("entities: none");
        } else {
            println!("entities:");
            for entity in &enrichment.entities {
                println!(
                    "  {} ({} mentions, {})",
                    entity.name, entity.mention_count, entity.entity_type
                );
            }
        }
        if !enrichment.relations.is_empty() {
            println!("relations:");
            for relation in &enrichment.relations {
                println!(
                    "  {} -- {} [{} {:.2}]",
                    relation.source, relation.target, relation.relation_type, relation.confidence
                );
            }
        }
    }

    Ok(())
}

async fn run_delete(config: &Config, id: i64) -> Result<()> {
    let store = create_store(config).await?;
    if store.delete(id).await? {
        println!("deleted document {}", id);
    } else {
        bail!("document {} not found", id);
    }
    Ok(())
}

async fn run_rebuild(config: &Config, batch_size: Option<usize>, missing_only: bool) -> Result<()> {
    let store = create_store(config).await?;
    let retriever = Retriever::from_config(config, store)?;

    let report = rebuild_embeddings(
        retriever.store(),
        retriever.embedder(),
        batch_size.unwrap_or(config.embedding.batch_size),
        missing_only,
    )
    .await?;

    println!("rebuild");
    println!("  chunks scanned: {}", report.scanned);
    println!("  embeddings written: {}", report.embedded);
    println!("  batches committed: {}", report.batches);
    println!("ok");
    Ok(())
}

async fn run_stats(config: &Config) -> Result<()> {
    let store = create_store(config).await?;
    let stats = store.stats().await?;

    println!("kbase — index stats");
    println!("===================");
    println!();
    println!("  Backend:     {}", config.store.backend);
    println!("  Documents:   {}", stats.document_count);
    println!("  Chunks:      {}", stats.chunk_count);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.chunks_with_embeddings,
        stats.chunk_count,
        if stats.chunk_count > 0 {
            (stats.chunks_with_embeddings * 100) / stats.chunk_count
        } else {
            0
        }
    );

    let overview = store.document_overview().await?;
    if !overview.is_empty() {
        println!();
        println!(
            "  {:<6} {:<28} {:<9} {:>7} {:>9}",
            "ID", "FILENAME", "STATUS", "CHUNKS", "EMBEDDED"
        );
        println!("  {}", "-".repeat(62));
        for doc in &overview {
            println!(
                "  {:<6} {:<28} {:<9} {:>7} {:>9}",
                doc.id,
                doc.filename,
                doc.status.as_str(),
                doc.chunk_count,
                doc.embedded_count
            );
        }
    }

    println!();
    Ok(())
}

fn excerpt(content: &str) -> String {
    let flattened = content.replace('\n', " ");
    let trimmed = flattened.trim();
    let cut: String = trimmed.chars().take(160).collect();
    if cut.len() < trimmed.len() {
        format!("{}...", cut)
    } else {
        cut
    }
}
