use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use link_harvest::config::RunConfig;
use link_harvest::runner::{reports, run};

/// Discover and record the URLs published by a configured fleet of sites.
#[derive(Parser, Debug)]
#[command(name = "link-harvest", version, about)]
struct Cli {
    /// YAML file with a top-level `sites:` list
    #[arg(long)]
    sites: PathBuf,

    /// Output directory for run artifacts
    #[arg(long, default_value = "data/runs")]
    out: PathBuf,

    /// Override the run window to `[now-since, now]`, in seconds
    #[arg(long)]
    since: Option<u64>,

    /// Maximum number of sites harvested concurrently
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = RunConfig::new(cli.sites, cli.out.clone(), cli.since, cli.concurrency);
    let run_dir = cli
        .out
        .join(chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
    tokio::fs::create_dir_all(&run_dir)
        .await
        .context("failed to create run output directory")?;

    let summary = run(config).await?;

    let (start, end) = match cli.since {
        Some(secs) => (summary.run_end - secs as i64, summary.run_end),
        None => (summary.run_start, summary.run_end),
    };

    let db_path = cli.out.join("urls.db");
    let store = link_harvest::store::Store::open(&db_path).await?;

    reports::write_new_url_reports(&store, &run_dir, start, end).await?;
    reports::write_per_site_counts(&store, &run_dir, &summary).await?;
    if let Some(secs) = cli.since {
        reports::write_latest_all(&store, &run_dir, summary.run_end - secs as i64).await?;
    }
    reports::write_run_log(&run_dir, &summary)?;

    let new_total: i64 = {
        let rows = store.query_new_urls(start, end).await?;
        rows.len() as i64
    };
    store.close().await;

    println!(
        "Run {}: new={new_total}, sites={}, out={}",
        run_dir.file_name().and_then(|n| n.to_str()).unwrap_or("?"),
        summary.outcomes.len(),
        run_dir.display()
    );

    Ok(())
}
