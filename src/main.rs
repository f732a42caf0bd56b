use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};

use api_crawler::config::Settings;
use api_crawler::fetcher::{HttpFetcher, PageFetcher};
use api_crawler::llm::{ChatClassifier, Classifier};
use api_crawler::pipeline::stages::{self, StageContext};
use api_crawler::pipeline::{format_duration, CancelFlag};
use api_crawler::sitemap;

#[derive(Parser)]
#[command(name = "api_crawler", about = "Crawl API docs into deprecation and change records")]
struct Cli {
    /// Config file (default: api_crawler.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Disable progress bars
    #[arg(long, global = true)]
    no_progress: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an input CSV from a documentation sitemap
    Seed {
        /// Sitemap or sitemap index URL
        sitemap: String,
        /// Keep only URLs matching this regex
        #[arg(short, long)]
        pattern: Option<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Fetch input URLs and extract change records heuristically
    Crawl {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Keep records with a version or replacement signal
    Filter {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Fill record gaps with the model-backed extractor
    Enrich {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Attach code examples to each record
    Examples {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Select blocks by keyword only, never call the model
        #[arg(long)]
        no_llm: bool,
    },
    /// crawl → filter → enrich → examples
    Run {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(long)]
        skip_enrich: bool,
        #[arg(long)]
        skip_examples: bool,
    },
    /// Show checkpoint progress for every stage
    Stats,
    /// Give permanently failed rows a fresh attempt budget
    Reset {
        /// Stage key as shown by `stats` (default: all)
        stage: Option<String>,
    },
}

/// Default file locations under `pipeline.data_dir`.
struct Paths {
    input: PathBuf,
    crawled: PathBuf,
    filtered: PathBuf,
    enriched: PathBuf,
    examples: PathBuf,
}

impl Paths {
    fn new(data_dir: &Path) -> Self {
        Paths {
            input: data_dir.join("input.csv"),
            crawled: data_dir.join("records_crawled.csv"),
            filtered: data_dir.join("records_filtered.csv"),
            enriched: data_dir.join("records_enriched.csv"),
            examples: data_dir.join("examples.json"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let paths = Paths::new(&settings.pipeline.data_dir);

    let cancel = CancelFlag::new();
    let ctx = StageContext {
        settings: &settings,
        cancel: cancel.clone(),
        show_progress: !cli.no_progress,
    };

    match cli.command {
        Commands::Seed { sitemap: url, pattern, output } => {
            let output = output.unwrap_or(paths.input);
            let fetcher = HttpFetcher::new(settings.fetch.clone())?;
            let urls = sitemap::collect_urls(&fetcher, &url, pattern.as_deref()).await?;
            sitemap::write_input_csv(&output, &urls)?;
            println!("Wrote {} URLs to {:?}", urls.len(), output);
        }
        Commands::Crawl { input, output } => {
            cancel.watch_ctrl_c();
            let report = stages::crawl(
                &ctx,
                http_fetcher(&settings)?,
                &input.unwrap_or(paths.input),
                &output.unwrap_or(paths.crawled),
            )
            .await?;
            report.print();
        }
        Commands::Filter { input, output } => {
            let report = stages::filter(
                &input.unwrap_or(paths.crawled),
                &output.unwrap_or(paths.filtered),
            )?;
            report.print();
        }
        Commands::Enrich { input, output } => {
            cancel.watch_ctrl_c();
            let classifier = chat_classifier(&settings)?;
            let report = stages::enrich(
                &ctx,
                http_fetcher(&settings)?,
                classifier,
                &input.unwrap_or(paths.filtered),
                &output.unwrap_or(paths.enriched),
            )
            .await?;
            report.print();
        }
        Commands::Examples { input, output, no_llm } => {
            cancel.watch_ctrl_c();
            let classifier = optional_classifier(&settings, no_llm)?;
            let (report, summary) = stages::examples(
                &ctx,
                http_fetcher(&settings)?,
                classifier,
                &input.unwrap_or(paths.enriched),
                &output.unwrap_or(paths.examples),
            )
            .await?;
            report.print();
            summary.print();
        }
        Commands::Run { input, skip_enrich, skip_examples } => {
            cancel.watch_ctrl_c();
            let fetcher = http_fetcher(&settings)?;
            // Fail before crawling if a later stage cannot run
            let classifier = if skip_enrich { None } else { Some(chat_classifier(&settings)?) };

            let t = Instant::now();
            let report = stages::crawl(
                &ctx,
                Arc::clone(&fetcher),
                &input.unwrap_or(paths.input),
                &paths.crawled,
            )
            .await?;
            report.print();
            if report.cancelled {
                return Ok(());
            }

            let filtered = stages::filter(&paths.crawled, &paths.filtered)?;
            filtered.print();

            let mut last = paths.filtered.clone();
            if let Some(classifier) = &classifier {
                let report = stages::enrich(
                    &ctx,
                    Arc::clone(&fetcher),
                    Arc::clone(classifier),
                    &paths.filtered,
                    &paths.enriched,
                )
                .await?;
                report.print();
                if report.cancelled {
                    return Ok(());
                }
                last = paths.enriched.clone();
            }

            if !skip_examples {
                let classifier = match classifier {
                    Some(c) => Some(c),
                    None => optional_classifier(&settings, false)?,
                };
                let (report, summary) = stages::examples(
                    &ctx,
                    fetcher,
                    classifier,
                    &last,
                    &paths.examples,
                )
                .await?;
                report.print();
                summary.print();
            }
            println!("\nPipeline finished in {}", format_duration(t.elapsed()));
        }
        Commands::Stats => stages::print_stats(&settings)?,
        Commands::Reset { stage } => {
            let n = stages::reset_failed(&settings, stage.as_deref())?;
            println!("Reset {} failed rows", n);
        }
    }

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }
    Ok(())
}

fn http_fetcher(settings: &Settings) -> Result<Arc<dyn PageFetcher>> {
    Ok(Arc::new(HttpFetcher::new(settings.fetch.clone())?))
}

fn chat_classifier(settings: &Settings) -> Result<Arc<dyn Classifier>> {
    Ok(Arc::new(ChatClassifier::new(settings.require_llm()?)?))
}

/// The examples stage uses the model when credentials exist, keywords otherwise.
fn optional_classifier(settings: &Settings, no_llm: bool) -> Result<Option<Arc<dyn Classifier>>> {
    if no_llm || !settings.llm.has_credentials() {
        return Ok(None);
    }
    chat_classifier(settings).map(Some)
}
