use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{ALL_ORGS_SENTINEL, DIARIAS_URL, ORGS_PROBE_QUERY, PAGE_COUNT_PATTERN};
use crate::dates::DateWindow;
use crate::html::{get_html_until, scrape_from_pattern, PageSource};
use crate::table::{normalize_rows, output_name, parse_results_page, save_results};

static PAGE_COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(PAGE_COUNT_PATTERN).unwrap());
static ORG_OPTIONS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("select#rapidaOS option").unwrap());
static ORG_SELECT: LazyLock<Selector> = LazyLock::new(|| Selector::parse("select#rapidaOS").unwrap());

/// Identifies one output page: organization, window month, page number.
#[derive(Debug, Clone, Copy)]
pub struct PageKey<'a> {
    pub org: &'a str,
    pub year: i32,
    pub month: u32,
    pub page: u32,
}

/// Decides whether a page was already scraped by an earlier run.
pub type DownloadedCheck = Box<dyn Fn(&PageKey) -> bool>;

/// Default resume ledger: the page's CSV exists in `dir`.
pub fn csv_exists_in(dir: PathBuf) -> DownloadedCheck {
    Box::new(move |key: &PageKey| {
        dir.join(output_name(key.org, key.year, key.month, key.page)).is_file()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// An empty results table showed up before the last page.
    Blocked,
    Cancelled,
}

/// Walks the daily-allowance search for every window x organization.
pub struct DiariasScraper<S> {
    source: S,
    base_url: String,
    out_dir: PathBuf,
    delay: Duration,
    /// Stop after the first window, as the legacy scraper did.
    first_window_only: bool,
    already_downloaded: DownloadedCheck,
    cancel: CancellationToken,
}

impl<S: PageSource> DiariasScraper<S> {
    pub fn new(source: S, out_dir: &Path, delay: Duration, cancel: CancellationToken) -> Self {
        Self {
            source,
            base_url: DIARIAS_URL.to_string(),
            out_dir: out_dir.to_path_buf(),
            delay,
            first_window_only: false,
            already_downloaded: csv_exists_in(out_dir.to_path_buf()),
            cancel,
        }
    }

    pub fn first_window_only(mut self, yes: bool) -> Self {
        self.first_window_only = yes;
        self
    }

    pub fn with_downloaded_check(mut self, check: DownloadedCheck) -> Self {
        self.already_downloaded = check;
        self
    }

    /// Organization codes offered by the search form, reversed, without
    /// the "all" entry. `None` when the form is missing (usually a CAPTCHA)
    /// or the run was cancelled mid-request.
    pub async fn fetch_organizations(&self) -> Result<Option<Vec<String>>> {
        let form_url = format!("{}{}", self.base_url, ORGS_PROBE_QUERY);
        let Some(html) = get_html_until(&self.source, &form_url, &self.cancel).await? else {
            return Ok(None);
        };

        match organizations_from(&html) {
            Some(orgs) => {
                debug!("Found {} organizations: {}", orgs.len(), orgs.join(", "));
                Ok(Some(orgs))
            }
            None => {
                error!("CAPTCHA");
                self.pause().await;
                Ok(None)
            }
        }
    }

    pub fn query_url(&self, window: &DateWindow, org: &str) -> String {
        format!(
            "{}resultado?consulta=rapida&periodoInicio={}&periodoFim={}&fase=PAG&codigoOS={}&codigoFavorecido=",
            self.base_url,
            window.start.format("%d/%m/%Y"),
            window.end.format("%d/%m/%Y"),
            org
        )
    }

    pub async fn run(&self, orgs: &[String], windows: &[DateWindow]) -> Result<RunOutcome> {
        for window in windows {
            info!("Processing window {}", window.start.format("%Y%m"));
            for (index, org) in orgs.iter().enumerate() {
                info!("Processing organization #{} - {}", index, org);
                let outcome = self.run_query(org, window).await?;
                if outcome != RunOutcome::Completed {
                    return Ok(outcome);
                }
            }
            if self.first_window_only {
                break;
            }
        }
        Ok(RunOutcome::Completed)
    }

    /// All pages of one (organization, window) search.
    async fn run_query(&self, org: &str, window: &DateWindow) -> Result<RunOutcome> {
        let url = self.query_url(window, org);
        debug!("{}", url);
        let Some(first_page) = get_html_until(&self.source, &url, &self.cancel).await? else {
            return Ok(RunOutcome::Cancelled);
        };

        let num_pages = scrape_from_pattern(&first_page, &PAGE_COUNT)
            .first()
            .and_then(|groups| groups.first())
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(1);

        let mut header: Option<Vec<String>> = None;
        for page in 1..=num_pages {
            let key = PageKey { org, year: window.year(), month: window.month(), page };
            if (self.already_downloaded)(&key) {
                debug!("Page {} of {} already saved, skipping", page, num_pages);
                continue;
            }

            let html = if page == 1 {
                first_page.clone()
            } else {
                let page_url = format!("{}&pagina={}", url, page);
                match get_html_until(&self.source, &page_url, &self.cancel).await? {
                    Some(html) => html,
                    None => return Ok(RunOutcome::Cancelled),
                }
            };

            let parsed = parse_results_page(&html, header.as_deref());
            self.pause().await;
            if self.cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            let Some((page_header, rows)) = parsed else {
                if page == num_pages {
                    continue;
                }
                error!("CAPTCHA on page {} of {} ({} {})", page, num_pages, org, window.start);
                return Ok(RunOutcome::Blocked);
            };

            let records = normalize_rows(&page_header, &rows, org, &self.base_url)?;
            debug!("PAGE = {} of {} - {} items", page, num_pages, records.len());

            save_results(&self.out_dir, org, key.year, key.month, page, &page_header, &records)?;
            header = Some(page_header);
        }
        Ok(RunOutcome::Completed)
    }

    async fn pause(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}

fn organizations_from(html: &str) -> Option<Vec<String>> {
    let doc = Html::parse_document(html);
    doc.select(&ORG_SELECT).next()?;

    let mut orgs: Vec<String> = doc
        .select(&ORG_OPTIONS)
        .filter_map(|o| o.value().attr("value"))
        .filter(|v| *v != ALL_ORGS_SENTINEL)
        .map(str::to_string)
        .collect();
    orgs.reverse();
    Some(orgs)
}
