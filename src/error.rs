use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("column '{column}': '{value}' is not a currency amount")]
    Currency { column: String, value: String },

    #[error("no response from {url} for {}", .path.display())]
    NoResponse {
        url: String,
        path: PathBuf,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered {status}")]
    BadStatus { url: String, status: reqwest::StatusCode },

    #[error("download of {} stalled: no data for {}s", .path.display(), .after.as_secs())]
    Stalled { path: PathBuf, after: Duration },

    #[error("download of {} cancelled", .path.display())]
    Cancelled { path: PathBuf },

    #[error("request to {url} interrupted")]
    Interrupted { url: String },
}

pub type Result<T> = std::result::Result<T, ScrapeError>;
