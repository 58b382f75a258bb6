use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use reposcope_core::config::{Config, Settings};
use reposcope_core::corpus::FsCorpus;
use reposcope_core::logging;
use reposcope_core::traits::RelevanceScorer;
use reposcope_core::types::CorpusFingerprint;
use reposcope_embed::embedder_from_settings;
use reposcope_hybrid::{EngineConfig, HttpRelevanceScorer, IndexCache, PreparedCorpus, QueryRequest, RetrievalEngine};

#[derive(Parser)]
#[command(name = "reposcope", about = "Hybrid code retrieval over a local repository")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build (or load) the indexes for a repository
    Index {
        path: PathBuf,
        #[arg(long)]
        rebuild: bool,
    },
    /// Retrieve ranked context for a question
    Query {
        path: PathBuf,
        question: String,
        /// Literal search seed, repeatable
        #[arg(long = "keyword", short = 'k')]
        keywords: Vec<String>,
        /// File to include in full, repeatable
        #[arg(long = "file", short = 'f')]
        files: Vec<String>,
        #[arg(long)]
        rebuild: bool,
        /// Print the query outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove cached indexes and embeddings
    ClearCache {
        #[arg(long)]
        fingerprint: Option<String>,
    },
}

fn main() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();
    let config = Config::load().map_err(|e| {
        eprintln!("Error loading config: {e}");
        e
    })?;
    let settings = config.settings()?;
    info!(env = config.env_name(), "configuration loaded");

    let cache = Arc::new(IndexCache::new(settings.cache.root_path()));
    let runtime = tokio::runtime::Runtime::new()?;
    if let Command::ClearCache { fingerprint } = &cli.command {
        match fingerprint {
            Some(fp) => {
                let fingerprint = CorpusFingerprint::parse(fp)?;
                runtime.block_on(cache.invalidate(&fingerprint))?;
            }
            None => cache.clear()?,
        }
        println!("✅ Cache cleared ({})", cache.root().display());
        return Ok(());
    }

    // Blocking HTTP clients are created and dropped outside the runtime.
    let engine = build_engine(&settings, cache)?;
    runtime.block_on(run(cli.command, &settings, &engine))
}

fn build_engine(settings: &Settings, cache: Arc<IndexCache>) -> Result<RetrievalEngine> {
    let embedder = embedder_from_settings(&settings.embedding)?;
    let scorer = HttpRelevanceScorer::from_settings(&settings.reranker)?.map(|s| Arc::new(s) as Arc<dyn RelevanceScorer>);
    if scorer.is_none() {
        info!("no reranker endpoint configured, keeping fused order");
    }
    let mut config = EngineConfig::from(settings);
    config.embed.show_progress = true;
    Ok(RetrievalEngine::new(config, embedder, scorer, cache))
}

async fn run(command: Command, settings: &Settings, engine: &RetrievalEngine) -> Result<()> {
    match command {
        Command::Index { path, rebuild } => {
            let prepared = prepare(engine, settings, path, rebuild).await?;
            let report = &prepared.handles.manifest.vector_report;
            println!("Fingerprint: {}", prepared.fingerprint);
            println!("Chunks:      {}", prepared.chunk_count());
            println!("Cache hit:   {}", prepared.cache_hit);
            println!(
                "Embeddings:  {} embedded, {} reused, {} skipped (ANN index: {})",
                report.embedded, report.reused, report.skipped, report.ann_index
            );
            print_degradations(&prepared.degradations);
        }
        Command::Query { path, question, keywords, files, rebuild, json } => {
            let prepared = prepare(engine, settings, path, rebuild).await?;
            let request = QueryRequest::new(question).with_keywords(keywords).with_targeted_files(files);
            let outcome = engine.query(&prepared, &request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                return Ok(());
            }
            for (i, item) in outcome.context.items.iter().enumerate() {
                println!(
                    "{:>2}. {}:{}-{}  relevance={:.3}",
                    i + 1,
                    item.chunk.file_path,
                    item.chunk.start_line,
                    item.chunk.end_line,
                    item.relevance
                );
            }
            println!("\n{}", outcome.context.render());
            println!("\n📊 {} items, {} chars", outcome.context.len(), outcome.context.total_chars);
            print_degradations(&outcome.degradations);
        }
        Command::ClearCache { .. } => {}
    }
    Ok(())
}

async fn prepare(engine: &RetrievalEngine, settings: &Settings, path: PathBuf, rebuild: bool) -> Result<PreparedCorpus> {
    let corpus = FsCorpus::new(path, settings.chunking.max_file_bytes);
    Ok(engine.prepare(&corpus, rebuild).await?)
}

fn print_degradations(degradations: &[reposcope_core::error::Degradation]) {
    for d in degradations {
        eprintln!("⚠️  degraded: {}", d.detail);
    }
}
