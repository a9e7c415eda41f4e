use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use verb_scraper::config::Settings;
use verb_scraper::executor::ScrapeExecutor;
use verb_scraper::fetcher::HttpFetcher;
use verb_scraper::{janitor, BatchEngine, Janitor, Store, TaskRequest, VerbManager};

#[derive(Parser)]
#[command(name = "verb_scraper", about = "Portuguese verb conjugation scraper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the schema and seed modes, tenses and persons
    Init,
    /// Scrape one (verb, mode, tense) and store its six forms
    Scrape {
        verb: String,
        #[arg(short, long)]
        mode: String,
        #[arg(short, long)]
        tense: String,
    },
    /// Run a batch job and wait for it to finish
    Batch {
        /// Task as verb:mode:tense (repeatable)
        #[arg(short, long = "task")]
        tasks: Vec<String>,
        /// JSON file holding a list of {verb, mode, tense} objects
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Show stored conjugations for a verb
    Show {
        verb: String,
        /// Print rows as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove finished jobs older than the retention window
    Sweep,
    /// Sweep on the configured interval until interrupted
    Janitor,
    /// Show database statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load().context("loading settings")?;
    let store = Store::open(&settings.db_path)
        .with_context(|| format!("opening {}", settings.db_path.display()))?;

    let result = match cli.command {
        Commands::Init => {
            println!("Database ready at {}", store.path().display());
            Ok(())
        }
        Commands::Scrape { verb, mode, tense } => {
            let manager = build_manager(&settings, store)?;
            let summary = manager.scrape_one(&verb, &mode, &tense).await?;
            println!("Stored {} rows for {}", summary.rows_written, summary.task);
            let rows = manager
                .store()
                .conjugations(summary.task.verb(), summary.task.mode(), summary.task.tense())
                .await?;
            for r in rows {
                println!("  {:<5} {}", r.person, r.value);
            }
            Ok(())
        }
        Commands::Batch { tasks, file } => {
            let requests = collect_requests(&tasks, file.as_deref())?;
            let manager = Arc::new(build_manager(&settings, store)?);
            let engine = BatchEngine::start(manager, settings.engine_config());
            let outcome = run_batch(&engine, &requests, settings.batch_timeout()).await;
            // A timed-out batch may have workers that never return.
            if outcome.is_ok() {
                engine.shutdown().await;
            }
            outcome
        }
        Commands::Show { verb, json } => {
            let rows = store.verb_conjugations(&verb).await?;
            if rows.is_empty() {
                println!("No conjugations stored for '{}'. Run 'scrape' first.", verb);
                return Ok(());
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
                return Ok(());
            }
            let mut heading = None;
            for r in &rows {
                let current = (r.mode.as_str(), r.tense.as_str());
                if heading != Some(current) {
                    println!("\n{} / {}", r.mode, r.tense);
                    heading = Some(current);
                }
                println!("  {:<5} {}", r.person, r.value);
            }
            Ok(())
        }
        Commands::Sweep => {
            let report = janitor::sweep(&store, settings.retention(), Utc::now()).await?;
            println!("Removed {} jobs ({} failed)", report.removed, report.failed);
            Ok(())
        }
        Commands::Janitor => {
            let handle = Janitor::start(store, settings.janitor_interval(), settings.retention());
            println!("Janitor running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            handle.stop().await;
            Ok(())
        }
        Commands::Stats => {
            let s = store.stats().await?;
            println!("Verbs:          {}", s.verbs);
            println!("Conjugations:   {}", s.conjugations);
            println!("Active jobs:    {}", s.jobs_active);
            println!("Finished jobs:  {}", s.jobs_completed);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn build_manager(settings: &Settings, store: Store) -> anyhow::Result<VerbManager> {
    let fetcher = HttpFetcher::new(&settings.base_url, settings.request_timeout())?;
    let executor = ScrapeExecutor::new(Arc::new(fetcher), settings.retry_policy());
    Ok(VerbManager::new(executor, store))
}

fn collect_requests(
    raw_tasks: &[String],
    file: Option<&std::path::Path>,
) -> anyhow::Result<Vec<TaskRequest>> {
    let mut requests = Vec::new();
    if let Some(path) = file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let parsed: Vec<TaskRequest> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        requests.extend(parsed);
    }
    for raw in raw_tasks {
        let mut parts = raw.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(verb), Some(mode), Some(tense)) => {
                requests.push(TaskRequest::new(verb, mode, tense))
            }
            _ => bail!("task '{}' is not in verb:mode:tense form", raw),
        }
    }
    Ok(requests)
}

async fn run_batch(
    engine: &BatchEngine,
    requests: &[TaskRequest],
    timeout: Duration,
) -> anyhow::Result<()> {
    let job_id = engine.submit(requests).await?;
    println!("Submitted job {} ({} tasks)", job_id, requests.len());

    let pb = ProgressBar::new(requests.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let started = Instant::now();
    let snapshot = loop {
        let snapshot = engine.status(&job_id).await?;
        pb.set_position(snapshot.progress.done() as u64);
        pb.set_message(format!("{} failed", snapshot.progress.failed));
        if snapshot.status.is_terminal() {
            break snapshot;
        }
        if started.elapsed() >= timeout {
            pb.abandon();
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            bail!(
                "job {} did not finish within {}",
                job_id,
                format_duration(timeout)
            );
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    };
    pb.finish_and_clear();

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
