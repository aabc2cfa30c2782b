use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sentsearch_core::{
    merge_gold_standard, mine, save_artifacts, EncoderConfig, HashEmbeddingProvider,
    LexicalSimilarityProvider, MinerConfig, Passage, RelationSet, RetrieverConfig,
    SentenceEncoder, SentenceSearcher, DEFAULT_N_MATCHING, DEFAULT_N_RETURNS,
    DEFAULT_SPLIT_RATIO, DEFAULT_SPLIT_SEED,
};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sentsearch")]
#[command(about = "Semantic passage retrieval: index, search, mine training data")]
struct Cli {
    /// Embedding dimension for the bundled hash embedder.
    #[arg(long, global = true, default_value_t = 768)]
    dim: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build a new index, or extend the one at --index unless --overwrite.
    BuildIndex {
        /// JSONL corpus of {"id", "text"} passages; omitted uses the
        /// bundled reference corpus.
        #[arg(long)]
        corpus: Option<PathBuf>,
        #[arg(long)]
        index: PathBuf,
        #[arg(long)]
        overwrite: bool,
        /// Skip incoming passages whose id is already indexed.
        #[arg(long)]
        dedupe: bool,
    },
    /// Coarse retrieval only.
    Query {
        #[arg(long)]
        index: PathBuf,
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = DEFAULT_N_RETURNS)]
        n_returns: usize,
    },
    /// Two-stage retrieve-then-rerank search.
    Search {
        #[arg(long)]
        index: PathBuf,
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = DEFAULT_N_RETURNS)]
        n_returns: usize,
    },
    /// Mine labeled training data from a relation set against the index.
    Mine {
        #[arg(long)]
        index: PathBuf,
        /// Relation set JSON (queries / collection / correct / incorrect).
        #[arg(long)]
        relations: PathBuf,
        /// Gold-standard CSV merged in before mining.
        #[arg(long)]
        gold_standard: Option<PathBuf>,
        /// Directory receiving the timestamped run directory.
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = DEFAULT_N_MATCHING)]
        n_matching: usize,
        #[arg(long, default_value_t = DEFAULT_N_RETURNS)]
        n_returns: usize,
        #[arg(long, default_value_t = DEFAULT_SPLIT_RATIO)]
        split_ratio: f64,
        #[arg(long, default_value_t = DEFAULT_SPLIT_SEED)]
        seed: u64,
    },
}

#[derive(Debug, serde::Deserialize)]
struct RawPassage {
    id: String,
    text: String,
}

fn read_corpus_jsonl(path: &Path) -> Result<Vec<Passage>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut passages = Vec::new();

    for line in reader.lines() {
        let line = line.context("read corpus line")?;
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawPassage = serde_json::from_str(&line).context("parse passage json")?;
        passages.push(Passage::new(raw.id, raw.text));
    }
    Ok(passages)
}

fn load_searcher(
    index: &Path,
    dim: usize,
    n_returns: usize,
) -> Result<SentenceSearcher<HashEmbeddingProvider, LexicalSimilarityProvider>> {
    SentenceSearcher::load(
        index,
        HashEmbeddingProvider::new(dim),
        LexicalSimilarityProvider,
        RetrieverConfig { n_returns },
    )
    .with_context(|| format!("load index at {}", index.display()))
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::BuildIndex {
            corpus,
            index,
            overwrite,
            dedupe,
        } => {
            let passages = match corpus {
                Some(path) => read_corpus_jsonl(path)?,
                None => Vec::new(),
            };
            let encoder = SentenceEncoder::new(
                HashEmbeddingProvider::new(cli.dim),
                EncoderConfig {
                    dedupe_on_extend: *dedupe,
                },
            );
            let built = encoder
                .build_or_extend(&passages, index, *overwrite)
                .with_context(|| format!("build index at {}", index.display()))?;
            println!("indexed_passages={} index={}", built.ids.len(), index.display());
        }
        Commands::Query {
            index,
            query,
            n_returns,
        } => {
            let searcher = load_searcher(index, cli.dim, *n_returns)?;
            for result in searcher.retrieve(query, *n_returns)? {
                println!(
                    "id={} score={:.4} text={}",
                    result.passage_id, result.score, result.text
                );
            }
        }
        Commands::Search {
            index,
            query,
            n_returns,
        } => {
            let searcher = load_searcher(index, cli.dim, *n_returns)?;
            for result in searcher.search(query)? {
                println!(
                    "id={} score={:.4} text={}",
                    result.passage_id, result.score, result.text
                );
            }
        }
        Commands::Mine {
            index,
            relations,
            gold_standard,
            output,
            n_matching,
            n_returns,
            split_ratio,
            seed,
        } => {
            let mut relation_set = RelationSet::load(relations)
                .with_context(|| format!("load relation set {}", relations.display()))?;
            if let Some(gold) = gold_standard {
                merge_gold_standard(&mut relation_set, gold)
                    .with_context(|| format!("merge gold standard {}", gold.display()))?;
            }

            let searcher = load_searcher(index, cli.dim, *n_returns)?;
            let config = MinerConfig {
                n_matching: *n_matching,
                n_returns: *n_returns,
                split_ratio: *split_ratio,
                split_seed: *seed,
            };
            let artifacts = mine(&searcher, &relation_set, &config)?;
            let dir = save_artifacts(&artifacts, output)?;

            println!(
                "train={} test={} positive={} neutral={} negative={} not_found={} dir={}",
                artifacts.metadata.train_size,
                artifacts.metadata.test_size,
                artifacts.metadata.n_positive_samples,
                artifacts.metadata.n_neutral_samples,
                artifacts.metadata.n_negative_samples,
                artifacts.not_found.len(),
                dir.display()
            );
        }
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
