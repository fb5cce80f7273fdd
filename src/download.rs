use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CHUNK_SIZE;
use crate::error::{Result, ScrapeError};

/// Fetches one remote file into local storage.
#[allow(async_fn_in_trait)]
pub trait Download {
    async fn download(&self, url: &str, params: &[(String, String)], dest: &Path) -> Result<()>;
}

/// Prints what would be downloaded, one JSON object per line.
pub struct DryRun;

#[derive(Serialize)]
struct PlannedDownload<'a> {
    url: &'a str,
    params: BTreeMap<&'a str, &'a str>,
    dest: &'a Path,
}

impl Download for DryRun {
    async fn download(&self, url: &str, params: &[(String, String)], dest: &Path) -> Result<()> {
        let plan = PlannedDownload {
            url,
            params: params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
            dest,
        };
        match serde_json::to_string(&plan) {
            Ok(line) => println!("{}", line),
            Err(e) => debug!("Could not serialize plan for {}: {}", dest.display(), e),
        }
        Ok(())
    }
}

pub struct FileDownloader {
    client: reqwest::Client,
    stall_timeout: Duration,
    cancel: CancellationToken,
}

impl FileDownloader {
    pub fn new(client: reqwest::Client, stall_timeout: Duration, cancel: CancellationToken) -> Self {
        Self { client, stall_timeout, cancel }
    }
}

impl Download for FileDownloader {
    async fn download(&self, url: &str, params: &[(String, String)], dest: &Path) -> Result<()> {
        let url = url.trim();
        if let Some(folder) = dest.parent() {
            create_private_dir(folder)?;
        }
        debug!("File URL: {}", url);

        let request = self.client.get(url).query(params).send();
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(ScrapeError::Cancelled { path: dest.to_path_buf() });
            }
            response = request => response.map_err(|source| ScrapeError::NoResponse {
                url: url.to_string(),
                path: dest.to_path_buf(),
                source,
            })?,
        };
        if !response.status().is_success() {
            return Err(ScrapeError::BadStatus {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let total = response.content_length().unwrap_or(0);
        info!(
            "Downloading {} [{}]: url {} params {:?}",
            dest.display(),
            readable_size(total, 2),
            url,
            params
        );

        write_stream(response.bytes_stream(), total, dest, self.stall_timeout, &self.cancel).await?;
        Ok(())
    }
}

/// Drain `stream` into `dest`, syncing every chunk to disk.
///
/// Bytes land in `<dest>.part` and are renamed into place once the stream
/// ends, so `dest` only ever exists complete. The watchdog re-arms on every
/// chunk; if `stall_timeout` passes without one the download is dropped.
pub async fn write_stream<St, E>(
    stream: St,
    total: u64,
    dest: &Path,
    stall_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<u64>
where
    St: Stream<Item = std::result::Result<Bytes, E>>,
    ScrapeError: From<E>,
{
    tokio::pin!(stream);
    let part = part_path(dest);
    let mut file = tokio::fs::File::create(&part).await?;
    let progress = progress_bar(total);
    let mut received = 0u64;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                progress.abandon();
                discard(file, &part).await;
                return Err(ScrapeError::Cancelled { path: dest.to_path_buf() });
            }
            next = tokio::time::timeout(stall_timeout, stream.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                progress.abandon();
                discard(file, &part).await;
                return Err(ScrapeError::Stalled {
                    path: dest.to_path_buf(),
                    after: stall_timeout,
                });
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                progress.abandon();
                discard(file, &part).await;
                return Err(e.into());
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        if chunk.is_empty() {
            debug!("Empty chunk");
            continue;
        }
        for piece in chunk.chunks(CHUNK_SIZE) {
            file.write_all(piece).await?;
            file.flush().await?;
            file.sync_data().await?;
            received += piece.len() as u64;
            progress.set_position(received);
        }
    }

    progress.finish();
    drop(file);
    tokio::fs::rename(&part, dest).await?;
    Ok(received)
}

async fn discard(file: tokio::fs::File, part: &Path) {
    drop(file);
    if let Err(e) = tokio::fs::remove_file(part).await {
        debug!("Could not remove {}: {}", part.display(), e);
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Fifty `=` segments; nothing is drawn when the size is unknown.
fn progress_bar(total: u64) -> ProgressBar {
    if total == 0 {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:50}] {bytes}/{total_bytes}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("= "),
    );
    pb
}

/// Create `dir` (and parents) readable only by the owner.
pub fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

/// Human size with a binary suffix, e.g. `2048` -> `2.00KB`. Empty for 0.
pub fn readable_size(size: u64, precision: usize) -> String {
    if size == 0 {
        return String::new();
    }
    const SUFFIXES: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = size as f64;
    let mut index = 0;
    while value > 1024.0 && index < SUFFIXES.len() - 1 {
        index += 1;
        value /= 1024.0;
    }
    format!("{:.*}{}", precision, value, SUFFIXES[index])
}

#[cfg(test)]
mod tests {
    use std::io;

    use futures_util::stream;
    use tokio::net::TcpListener;

    use super::*;
    use crate::test_support::{http_response, local_client, serve_once};

    fn downloader(cancel: CancellationToken) -> FileDownloader {
        FileDownloader::new(local_client(), Duration::from_secs(5), cancel)
    }

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn ok(data: &'static [u8]) -> io::Result<Bytes> {
        Ok(Bytes::from_static(data))
    }

    #[test]
    fn readable_sizes() {
        assert_eq!(readable_size(2048, 2), "2.00KB");
        assert_eq!(readable_size(0, 2), "");
        assert_eq!(readable_size(512, 1), "512.0B");
        assert_eq!(readable_size(1024, 2), "1024.00B");
        assert_eq!(readable_size(5 * 1024 * 1024, 0), "5MB");
    }

    #[tokio::test]
    async fn writes_all_chunks_and_skips_empty_ones() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("2017_01.zip");
        let chunks = stream::iter(vec![ok(b"PK\x03\x04"), ok(b""), ok(b"rest")]);

        let n = write_stream(chunks, 8, &dest, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(n, 8);
        assert_eq!(std::fs::read(&dest).unwrap(), b"PK\x03\x04rest");
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn large_chunks_are_split() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("big.zip");
        let big = Bytes::from(vec![7u8; CHUNK_SIZE * 2 + 10]);
        let chunks = stream::iter(vec![Ok::<_, io::Error>(big)]);

        let n = write_stream(chunks, 0, &dest, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n as usize, CHUNK_SIZE * 2 + 10);
    }

    #[tokio::test]
    async fn stalled_source_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("stalled.zip");
        let chunks = stream::iter(vec![ok(b"first")]).chain(stream::pending());

        let err = write_stream(chunks, 100, &dest, Duration::from_millis(50), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ScrapeError::Stalled { .. }));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn stream_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("broken.zip");
        let chunks = stream::iter(vec![ok(b"x"), Err(io::Error::other("reset"))]);

        let err = write_stream(chunks, 0, &dest, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Io(_)));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn cancelled_download_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("cancelled.zip");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let chunks = stream::pending::<io::Result<Bytes>>();

        let err = write_stream(chunks, 0, &dest, Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Cancelled { .. }));
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn fetches_archive_with_query() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("GastosDiretos").join("2017_01.zip");
        let (url, request) =
            serve_once(http_response("200 OK", &[("Content-Type", "application/zip")], b"PK\x03\x04")).await;

        downloader(CancellationToken::new())
            .download(&url, &params(&[("a", "2017"), ("consulta", "GastosDiretos"), ("m", "01")]), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"PK\x03\x04");
        let request = request.await.unwrap();
        assert!(request.starts_with("GET /?a=2017&consulta=GastosDiretos&m=01 HTTP/1.1"));
    }

    #[tokio::test]
    async fn refused_connection_is_no_response() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/downloads.asp", listener.local_addr().unwrap());
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Convenios").join("2017_01.zip");
        let err = downloader(CancellationToken::new())
            .download(&url, &params(&[("a", "2017")]), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, ScrapeError::NoResponse { .. }));
        assert!(dest.parent().unwrap().is_dir());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn error_status_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Copa").join("Copa.zip");
        let (url, _) = serve_once(http_response("404 Not Found", &[], b"not here")).await;

        let err = downloader(CancellationToken::new())
            .download(&url, &[], &dest)
            .await
            .unwrap_err();

        match err {
            ScrapeError::BadStatus { status, .. } => assert_eq!(status.as_u16(), 404),
            other => panic!("unexpected error: {}", other),
        }
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/downloads.asp", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("2017_01.zip");
        let err = tokio::time::timeout(Duration::from_secs(5), downloader(cancel).download(&url, &[], &dest))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Cancelled { .. }));
        assert!(!dest.exists());
    }

    #[cfg(unix)]
    #[test]
    fn private_dirs_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("GastosDiretos_Pagamentos");
        create_private_dir(&nested).unwrap();
        let mode = std::fs::metadata(&nested).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }
}
