use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bidflow_core::JobSource;
use bidflow_dedup::{Deduplicator, JsonSeenStore};
use bidflow_pipeline::{Collaborators, Pipeline, PipelineConfig};
use bidflow_sources::{ApifyFeed, JobFeed, ManualFeed, MockApifyFeed, MockGmailFeed};

#[derive(Debug, Parser)]
#[command(name = "bidflow")]
#[command(about = "Upwork auto-apply pipeline")]
struct Cli {
    /// Ingestion source: apify, gmail, or manual
    #[arg(long, default_value = "apify")]
    source: JobSource,

    /// Maximum jobs to ingest
    #[arg(long, default_value_t = 10)]
    limit: usize,

    /// Pre-filter score threshold (0-100)
    #[arg(long)]
    min_score: Option<i64>,

    /// Concurrent job pipelines
    #[arg(long)]
    parallel: Option<usize>,

    /// Replace all collaborators with deterministic fakes
    #[arg(long)]
    mock: bool,

    /// JSON file with raw job records (manual source)
    #[arg(long)]
    jobs: Option<PathBuf>,

    /// Write the run result JSON here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Path of the processed-ids store
    #[arg(long, default_value = ".tmp/processed_ids.json")]
    dedup_file: PathBuf,
}

fn build_feed(cli: &Cli) -> Result<Box<dyn JobFeed>> {
    match cli.source {
        JobSource::Apify => {
            if cli.mock {
                return Ok(Box::new(MockApifyFeed));
            }
            match std::env::var("APIFY_TOKEN") {
                Ok(token) if !token.is_empty() => {
                    let actor_id = std::env::var("APIFY_ACTOR_ID")
                        .context("APIFY_ACTOR_ID must be set alongside APIFY_TOKEN")?;
                    let keywords = std::env::var("APIFY_SEARCH_KEYWORDS")
                        .unwrap_or_default()
                        .split(',')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(str::to_string)
                        .collect();
                    Ok(Box::new(ApifyFeed::new(token, actor_id, keywords)))
                }
                _ => {
                    warn!("APIFY_TOKEN not set, falling back to the mock apify feed");
                    Ok(Box::new(MockApifyFeed))
                }
            }
        }
        JobSource::Gmail => {
            if !cli.mock {
                warn!("gmail ingestion runs against the mock feed in this build");
            }
            Ok(Box::new(MockGmailFeed))
        }
        JobSource::Manual => {
            let path = cli
                .jobs
                .as_ref()
                .context("--jobs <file> is required for the manual source")?;
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let jobs: Vec<serde_json::Value> = serde_json::from_str(&text)
                .with_context(|| format!("parsing job records in {}", path.display()))?;
            Ok(Box::new(ManualFeed::new(jobs)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = PipelineConfig::from_env();
    if let Some(min_score) = cli.min_score {
        config.min_score = min_score;
    }
    if let Some(parallel) = cli.parallel {
        config.parallel = parallel;
    }

    if let Some(parent) = cli.dedup_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let dedup = Deduplicator::new(Box::new(JsonSeenStore::new(&cli.dedup_file)));

    if !cli.mock {
        // Live scorer/extractor/deliverable credentials are wired per
        // deployment; the binary ships with the deterministic set.
        warn!("live collaborators not configured, using deterministic mocks");
    }
    let collaborators = Collaborators::mock();

    let feed = build_feed(&cli)?;
    let pipeline = Pipeline::new(config, dedup, collaborators);
    let result = pipeline.run(feed.as_ref(), cli.limit).await;

    let rendered = serde_json::to_string_pretty(&result).context("serializing run result")?;
    match &cli.output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("writing {}", path.display()))?;
        }
        None => println!("{rendered}"),
    }

    if !result.errors.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
