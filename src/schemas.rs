use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{
    DATASET_NAME_PATTERN, DOWNLOADS_URL, DOWNLOAD_ENDPOINT, FILE_VARIANT_PATTERN, FINAL_MONTH,
    SPECIAL_DATASET,
};
use crate::download::Download;
use crate::error::ScrapeError;
use crate::html::{get_html_until, links_under, scrape_from_pattern, PageSource};

static DATASET_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(DATASET_NAME_PATTERN).unwrap());
static FILE_VARIANT: LazyLock<Regex> = LazyLock::new(|| Regex::new(FILE_VARIANT_PATTERN).unwrap());

/// A downloadable dataset as advertised on the listing page.
#[derive(Debug, Clone)]
pub struct DatasetDescriptor {
    pub name: String,
    pub link: String,
    pub params: Vec<(String, String)>,
    /// The dataset page itself, when it is not a direct archive link.
    pub content: Option<String>,
}

/// One archive of a dataset: a year, a month (or the yearly file), and
/// optionally a day, a type and an origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVariant {
    pub year: String,
    pub month: String,
    pub day: Option<String>,
    pub kind: Option<String>,
    pub origin: Option<String>,
}

impl FileVariant {
    /// Build from the capture groups of the file-variant pattern.
    fn from_groups(groups: &[String]) -> Option<Self> {
        let field = |i: usize| groups.get(i).filter(|s| !s.is_empty()).cloned();
        Some(Self {
            year: field(0)?,
            month: field(1)?,
            day: field(3),
            kind: field(5),
            origin: field(7),
        })
    }

    pub fn is_yearly(&self) -> bool {
        self.month == FINAL_MONTH
    }

    /// Query parameters for the download endpoint. A type, when present,
    /// travels in `d` and replaces the day.
    pub fn params(&self, dataset: &str) -> Vec<(String, String)> {
        let mut params = vec![
            ("a".to_string(), self.year.clone()),
            ("consulta".to_string(), dataset.to_string()),
        ];
        if !self.is_yearly() {
            params.push(("m".to_string(), self.month.clone()));
        }
        if let Some(d) = self.kind.as_ref().or(self.day.as_ref()) {
            params.push(("d".to_string(), d.clone()));
        }
        if let Some(o) = &self.origin {
            params.push(("o".to_string(), o.clone()));
        }
        params
    }

    /// `<dataset>[_<type>][_<origin>]/<year>[_<month>][_<day>].zip`
    pub fn relative_path(&self, dataset: &str) -> PathBuf {
        let mut folder = dataset.to_string();
        for part in [&self.kind, &self.origin].into_iter().flatten() {
            folder.push('_');
            folder.push_str(part);
        }

        let mut file = self.year.clone();
        if !self.is_yearly() {
            file.push('_');
            file.push_str(&self.month);
        }
        if let Some(day) = &self.day {
            file.push('_');
            file.push_str(day);
        }
        Path::new(&folder).join(format!("{}.zip", file))
    }
}

/// Every file variant advertised in a dataset page.
pub fn file_variants(content: &str) -> Vec<FileVariant> {
    scrape_from_pattern(content, &FILE_VARIANT)
        .iter()
        .filter_map(|groups| FileVariant::from_groups(groups))
        .collect()
}

#[derive(Debug, Default)]
pub struct WalkStats {
    pub datasets: usize,
    pub downloaded: usize,
    pub skipped: usize,
}

/// Walks the downloads listing and fetches every dataset archive.
pub struct SchemaWalker<S, D> {
    source: S,
    downloader: D,
    listing_url: String,
    download_url: String,
    out_dir: PathBuf,
    already_downloaded: Box<dyn Fn(&Path) -> bool>,
    cancel: CancellationToken,
}

impl<S: PageSource, D: Download> SchemaWalker<S, D> {
    pub fn new(source: S, downloader: D, out_dir: &Path) -> Self {
        Self {
            source,
            downloader,
            listing_url: DOWNLOADS_URL.to_string(),
            download_url: DOWNLOAD_ENDPOINT.to_string(),
            out_dir: out_dir.to_path_buf(),
            already_downloaded: Box::new(Path::is_file),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_downloaded_check(mut self, check: Box<dyn Fn(&Path) -> bool>) -> Self {
        self.already_downloaded = check;
        self
    }

    /// Identify the dataset behind a listing link.
    ///
    /// The name comes from the `c` or `consulta` query parameter, or else
    /// from the `'&consulta=...'` snippet in the linked page.
    pub async fn resolve_dataset(&self, link: &Url) -> Result<Option<DatasetDescriptor>> {
        let params: Vec<(String, String)> = link.query_pairs().into_owned().collect();
        let from_query = ["c", "consulta"]
            .iter()
            .find_map(|key| params.iter().find(|(k, _)| k.as_str() == *key))
            .map(|(_, v)| v.clone());

        let is_archive = link.path().to_ascii_lowercase().ends_with(".zip");
        let content = if is_archive || from_query.as_deref() == Some(SPECIAL_DATASET) {
            None
        } else {
            Some(self.fetch(link.as_str()).await?)
        };

        let name = match from_query {
            Some(name) => name,
            None => {
                let found = content
                    .as_deref()
                    .and_then(|c| DATASET_NAME.captures(c))
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string());
                match found {
                    Some(name) if !name.is_empty() => name,
                    _ => return Ok(None),
                }
            }
        };

        Ok(Some(DatasetDescriptor {
            name,
            link: link.to_string(),
            params,
            content,
        }))
    }

    pub async fn process_schemas(&self, include_special: bool) -> Result<WalkStats> {
        let base = Url::parse(&self.listing_url).context("Invalid listing URL")?;
        let index = self.fetch(&self.listing_url).await?;
        let links = links_under(&index, "div", "class", "colunas");
        debug!("{} dataset links", links.len());

        let mut stats = WalkStats::default();
        for href in links {
            if self.cancel.is_cancelled() {
                return Err(ScrapeError::Interrupted { url: href }.into());
            }
            let link = match base.join(&href) {
                Ok(link) => link,
                Err(e) => {
                    error!("Bad dataset link {}: {}", href, e);
                    continue;
                }
            };
            let Some(dataset) = self.resolve_dataset(&link).await? else {
                error!("Dataset not identified in URL {}", link);
                continue;
            };
            if dataset.name == SPECIAL_DATASET && !include_special {
                continue;
            }

            info!("Processing dataset {}", dataset.name);
            debug!("{} query parameters: {:?}", dataset.link, dataset.params);
            stats.datasets += 1;
            let mut folders = BTreeSet::new();

            if dataset.name == SPECIAL_DATASET {
                let dest = self.out_dir.join(&dataset.name).join(format!("{}.zip", dataset.name));
                folders.extend(dest.parent().map(Path::to_path_buf));
                self.process_file(&dataset.link, &[], &dest, &mut stats).await?;
            } else {
                let variants = file_variants(dataset.content.as_deref().unwrap_or_default());
                info!("Found {} files", variants.len());
                for variant in &variants {
                    let dest = self.out_dir.join(variant.relative_path(&dataset.name));
                    folders.extend(dest.parent().map(Path::to_path_buf));
                    let params = variant.params(&dataset.name);
                    self.process_file(&self.download_url, &params, &dest, &mut stats).await?;
                }
            }

            for folder in folders {
                remove_if_empty(&folder)?;
            }
        }
        Ok(stats)
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let html = get_html_until(&self.source, url, &self.cancel).await?;
        Ok(html.ok_or_else(|| ScrapeError::Interrupted { url: url.to_string() })?)
    }

    async fn process_file(
        &self,
        url: &str,
        params: &[(String, String)],
        dest: &Path,
        stats: &mut WalkStats,
    ) -> Result<()> {
        if (self.already_downloaded)(dest) {
            debug!("{} already downloaded", dest.display());
            stats.skipped += 1;
            return Ok(());
        }
        self.downloader
            .download(url, params, dest)
            .await
            .with_context(|| format!("Downloading {}", dest.display()))?;
        stats.downloaded += 1;
        Ok(())
    }
}

fn remove_if_empty(folder: &Path) -> std::io::Result<()> {
    if folder.is_dir() && std::fs::read_dir(folder)?.next().is_none() {
        debug!("Removing empty folder {}", folder.display());
        std::fs::remove_dir(folder)?;
    }
    Ok(())
}
