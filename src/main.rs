mod config;
mod dates;
mod diarias;
mod download;
mod error;
mod html;
mod schemas;
mod table;
#[cfg(test)]
mod test_support;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use config::{Settings, DEFAULT_DELAY_SECS, DEFAULT_STALL_SECS};
use diarias::{DiariasScraper, PageKey, RunOutcome};
use download::{Download, DryRun, FileDownloader};
use html::HttpFetcher;
use schemas::SchemaWalker;

#[derive(Parser)]
#[command(
    name = "transparencia_scraper",
    about = "Public-spending scraper for the Portal da Transparência"
)]
struct Cli {
    /// Where CSV pages and dataset archives are written
    #[arg(long, global = true, env = "TRANSPARENCIA_OUT_DIR", default_value = ".")]
    out_dir: PathBuf,
    /// Seconds to wait after every search page
    #[arg(long, global = true, env = "TRANSPARENCIA_DELAY_SECS", default_value_t = DEFAULT_DELAY_SECS)]
    delay_secs: u64,
    /// Abort a download after this many seconds without data
    #[arg(long, global = true, env = "TRANSPARENCIA_STALL_SECS", default_value_t = DEFAULT_STALL_SECS)]
    stall_secs: u64,
    /// Decode pages as UTF-8 instead of the declared charset
    #[arg(long, global = true)]
    utf8: bool,
    /// Fetch again even when the output file already exists
    #[arg(long, global = true)]
    force: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape daily-allowance payments month by month, one CSV per page
    Diarias {
        /// First month (YYYY-MM-DD; default: last month)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// End of the range, exclusive (default and maximum: this month)
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Organization code to query (repeatable; default: all)
        #[arg(long = "org")]
        orgs: Vec<String>,
        /// Process only the first month, like the legacy scraper
        #[arg(long)]
        first_window_only: bool,
    },
    /// List the superior-organization codes
    Orgs {
        /// Print as a JSON array
        #[arg(long)]
        json: bool,
    },
    /// Download every dataset archive from the downloads page
    Downloads {
        /// Also fetch the frozen Copa dataset
        #[arg(long)]
        include_copa: bool,
        /// Print the planned downloads as JSON lines instead
        #[arg(long)]
        dry_run: bool,
    },
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
    let settings = Settings {
        out_dir: cli.out_dir,
        delay: Duration::from_secs(cli.delay_secs),
        stall_timeout: Duration::from_secs(cli.stall_secs),
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        wait_for_interrupt().await;
        on_interrupt.cancel();
    });

    let client = reqwest::Client::builder()
        .user_agent(concat!("transparencia_scraper/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let mut fetcher = HttpFetcher::new(client.clone());
    if cli.utf8 {
        fetcher = fetcher.decoding_utf8();
    }

    let result = match cli.command {
        Commands::Diarias { from, to, orgs, first_window_only } => {
            std::fs::create_dir_all(&settings.out_dir)
                .with_context(|| format!("creating {}", settings.out_dir.display()))?;
            let mut scraper = DiariasScraper::new(fetcher, &settings.out_dir, settings.delay, cancel.clone())
                .first_window_only(first_window_only);
            if cli.force {
                scraper = scraper.with_downloaded_check(Box::new(|_: &PageKey| false));
            }

            let orgs = if orgs.is_empty() {
                match scraper.fetch_organizations().await? {
                    Some(orgs) => orgs,
                    None if cancel.is_cancelled() => interrupted(),
                    None => anyhow::bail!("Organization list unavailable (CAPTCHA?); try again later"),
                }
            } else {
                orgs
            };
            let windows = dates::compute_windows(from, to);
            info!("{} months x {} organizations", windows.len(), orgs.len());

            match scraper.run(&orgs, &windows).await? {
                RunOutcome::Completed => {
                    println!("Done: {} months, {} organizations.", windows.len(), orgs.len());
                    Ok(())
                }
                RunOutcome::Blocked => {
                    anyhow::bail!("Blocked by a CAPTCHA; re-run later to resume where it stopped")
                }
                RunOutcome::Cancelled => interrupted(),
            }
        }
        Commands::Orgs { json } => {
            let scraper = DiariasScraper::new(fetcher, &settings.out_dir, settings.delay, cancel.clone());
            let Some(orgs) = scraper.fetch_organizations().await? else {
                if cancel.is_cancelled() {
                    interrupted();
                }
                anyhow::bail!("Organization list unavailable (CAPTCHA?); try again later");
            };
            if json {
                println!("{}", serde_json::to_string(&orgs)?);
            } else {
                for org in &orgs {
                    println!("{}", org);
                }
            }
            Ok(())
        }
        Commands::Downloads { include_copa, dry_run } => {
            let stats = if dry_run {
                walker(fetcher, DryRun, &settings, cli.force, &cancel)
                    .process_schemas(include_copa)
                    .await
            } else {
                let downloader = FileDownloader::new(client, settings.stall_timeout, cancel.clone());
                walker(fetcher, downloader, &settings, cli.force, &cancel)
                    .process_schemas(include_copa)
                    .await
            };
            if cancel.is_cancelled() {
                interrupted()
            } else {
                let stats = stats?;
                println!(
                    "Done: {} datasets, {} files downloaded, {} already present.",
                    stats.datasets, stats.downloaded, stats.skipped
                );
                Ok(())
            }
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn walker<D: Download>(
    fetcher: HttpFetcher,
    downloader: D,
    settings: &Settings,
    force: bool,
    cancel: &CancellationToken,
) -> SchemaWalker<HttpFetcher, D> {
    let walker = SchemaWalker::new(fetcher, downloader, &settings.out_dir).with_cancel(cancel.clone());
    if force {
        walker.with_downloaded_check(Box::new(|_: &Path| false))
    } else {
        walker
    }
}

/// Resolves on Ctrl+Z (SIGTSTP) or Ctrl+C.
#[cfg(unix)]
async fn wait_for_interrupt() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::from_raw(libc::SIGTSTP)) {
        Ok(mut suspend) => tokio::select! {
            _ = suspend.recv() => debug!("SIGTSTP received"),
            Ok(()) = tokio::signal::ctrl_c() => debug!("SIGINT received"),
        },
        Err(e) => {
            warn!("Cannot listen for Ctrl+Z: {}", e);
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => debug!("Ctrl+C received"),
        Err(e) => {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await
        }
    }
}

fn interrupted() -> ! {
    println!("Operation interrupted by the user");
    std::process::exit(0)
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
