use clap::{Parser, Subcommand};
use serde::Serialize;
use sextant_retriever::{
    config::RetrieverConfig,
    retrieval::indexing_engine::{FileOutcome, IndexingEngine, IndexingEngineConfig},
    storage::{IndexStats, SearchOptions, vector_store::VectorStore},
};
use std::path::PathBuf;
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Semantic code search over a local index stored in `<base-dir>/.sextant`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory being indexed; the index lives in its .sextant subdirectory
    #[arg(short, long, default_value = ".")]
    base_dir: PathBuf,

    /// Embedding model name (overrides config.toml)
    #[arg(long)]
    model: Option<String>,

    /// Directory where embedding models are cached (overrides config.toml)
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index changed files under the base directory
    Index {
        /// Only index these files (relative to the base directory)
        files: Vec<String>,
        /// Files chunked and embedded at the same time
        #[arg(long)]
        max_concurrent_files: Option<usize>,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Search the index with a natural language or code query
    Search {
        query: String,
        /// Maximum number of results
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        /// Minimum similarity score (0.0 to 1.0)
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Only return results from these files
        #[arg(long = "file")]
        files: Vec<String>,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show index statistics
    Stats {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Drop all chunks and embeddings; files are re-indexed on the next run
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Full,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "full" => Ok(OutputFormat::Full),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[derive(Serialize, Default)]
struct IndexSummary {
    indexed: usize,
    unchanged: usize,
    failed: usize,
    cancelled: usize,
    chunks: usize,
    embeddings: usize,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn,sextant_retriever=info,sextant_embed=info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn engine_config(args: &Args) -> anyhow::Result<IndexingEngineConfig> {
    let mut config = IndexingEngineConfig::load(args.base_dir.clone())?;
    if let Some(model) = &args.model {
        config.retriever.embedding.model_name = model.clone();
    }
    if let Some(model_dir) = &args.model_dir {
        config.retriever.embedding.model_base_path = model_dir.clone();
    }
    Ok(config)
}

/// Cancels `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight writes");
            token.cancel();
        }
    });
}

async fn run(args: Args) -> anyhow::Result<()> {
    match &args.command {
        Commands::Index {
            files,
            max_concurrent_files,
            format,
        } => {
            let mut config = engine_config(&args)?;
            if let Some(n) = max_concurrent_files {
                config = config.with_max_concurrent_files(*n);
            }

            let engine = IndexingEngine::open(config).await?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let results = if files.is_empty() {
                engine.index_directory(&cancel).await
            } else {
                engine.index_paths(files.clone(), &cancel).await
            };
            engine.shutdown().await?;
            let results = results?;

            let mut summary = IndexSummary::default();
            for result in &results {
                match &result.outcome {
                    FileOutcome::Indexed {
                        chunks, embeddings, ..
                    } => {
                        summary.indexed += 1;
                        summary.chunks += chunks;
                        summary.embeddings += embeddings;
                    }
                    FileOutcome::Unchanged => summary.unchanged += 1,
                    FileOutcome::Failed { .. } => summary.failed += 1,
                    FileOutcome::Cancelled => summary.cancelled += 1,
                }
            }

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&results)?);
                }
                OutputFormat::Full => {
                    for result in &results {
                        match &result.outcome {
                            FileOutcome::Indexed {
                                chunks,
                                embeddings,
                                failed_chunks,
                            } => println!(
                                "  indexed   {} ({chunks} chunks, {embeddings} embeddings, {failed_chunks} failed) in {:?}",
                                result.file_path, result.processing_time
                            ),
                            FileOutcome::Unchanged => println!("  unchanged {}", result.file_path),
                            FileOutcome::Failed { error } => {
                                println!("  failed    {}: {error}", result.file_path)
                            }
                            FileOutcome::Cancelled => println!("  cancelled {}", result.file_path),
                        }
                    }
                    print_index_summary(&summary);
                }
                OutputFormat::Summary => print_index_summary(&summary),
            }
            Ok(())
        }
        Commands::Search {
            query,
            limit,
            threshold,
            files,
            format,
        } => {
            let engine = IndexingEngine::open(engine_config(&args)?).await?;
            let options = SearchOptions {
                limit: *limit,
                min_score: threshold.unwrap_or(0.0),
                file_filter: (!files.is_empty()).then(|| files.clone()),
            };

            let results = engine.search(query, &options).await;
            engine.shutdown().await?;
            let results = results?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&results)?);
                }
                OutputFormat::Summary => {
                    println!("Found {} results:", results.len());
                    for context in &results {
                        println!(
                            "  Score: {:.3} | File: {} | Bytes: {}-{} | Chunks: {}",
                            context.score,
                            context.file_path,
                            context.start_offset,
                            context.end_offset,
                            context.chunk_ids.len()
                        );
                    }
                }
                OutputFormat::Full => {
                    for context in &results {
                        println!("Score: {:.3}", context.score);
                        println!("File: {}", context.file_path);
                        println!("Bytes: {}-{}", context.start_offset, context.end_offset);
                        println!("Kind: {:?}", context.kind);
                        println!("Content:\n{}", context.content);
                        println!("---");
                    }
                }
            }
            Ok(())
        }
        Commands::Stats { format } => {
            let config = RetrieverConfig::load(&args.base_dir)?;
            let store = VectorStore::open(&args.base_dir, config.index).await?;
            store.restore_dimension().await?;
            let stats = store.stats().await?;
            let model = store.files().get_metadata("embedding.model").await?;
            store.dispose().await?;

            match format {
                OutputFormat::Json => {
                    #[derive(Serialize)]
                    struct StatsOutput {
                        #[serde(flatten)]
                        stats: IndexStats,
                        embedding_model: Option<String>,
                    }
                    let output = StatsOutput {
                        stats,
                        embedding_model: model,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Summary | OutputFormat::Full => {
                    println!("Index Statistics:");
                    println!(
                        "  Files: {} ({} indexed)",
                        stats.files_count, stats.indexed_files_count
                    );
                    println!("  Chunks: {}", stats.chunks_count);
                    println!("  Embeddings: {}", stats.embeddings_count);
                    match stats.ann_dimension {
                        Some(dimension) => println!(
                            "  Vector index: {} of {} points, dimension {}",
                            stats.ann_len, stats.ann_capacity, dimension
                        ),
                        None => println!("  Vector index: not initialized"),
                    }
                    if stats.ann_stale_points > 0 {
                        println!("  Stale vector points: {}", stats.ann_stale_points);
                    }
                    if let Some(model) = model {
                        println!("  Embedding model: {model}");
                    }
                }
            }
            Ok(())
        }
        Commands::Clear => {
            let config = RetrieverConfig::load(&args.base_dir)?;
            let store = VectorStore::open(&args.base_dir, config.index).await?;
            store.restore_dimension().await?;
            store.delete_all_embeddings_and_chunks().await?;
            store.dispose().await?;
            info!("Cleared index at {}", args.base_dir.display());
            println!("Cleared all chunks and embeddings");
            Ok(())
        }
    }
}

fn print_index_summary(summary: &IndexSummary) {
    println!("Indexing complete:");
    println!("  Indexed: {}", summary.indexed);
    println!("  Unchanged: {}", summary.unchanged);
    println!("  Failed: {}", summary.failed);
    if summary.cancelled > 0 {
        println!("  Cancelled: {}", summary.cancelled);
    }
    println!("  Chunks: {}", summary.chunks);
    println!("  Embeddings: {}", summary.embeddings);
}
