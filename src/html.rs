use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;
use tracing::debug;

static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// Anything that can turn a URL into page markup.
#[allow(async_fn_in_trait)]
pub trait PageSource {
    async fn get_html(&self, url: &str) -> Result<String>;
}

/// Plain reqwest-backed page fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
    /// Force UTF-8 (lossy) instead of trusting the declared charset.
    decode_utf8: bool,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client, decode_utf8: false }
    }

    pub fn decoding_utf8(mut self) -> Self {
        self.decode_utf8 = true;
        self
    }
}

impl PageSource for HttpFetcher {
    async fn get_html(&self, url: &str) -> Result<String> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        if self.decode_utf8 {
            let bytes = response
                .bytes()
                .await
                .with_context(|| format!("Reading body from {}", url))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            response
                .text()
                .await
                .with_context(|| format!("Reading body from {}", url))
        }
    }
}

/// `get_html` that gives up as soon as `cancel` fires. `None` when cancelled.
pub async fn get_html_until<S: PageSource>(
    source: &S,
    url: &str,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("GET {} abandoned", url);
            Ok(None)
        }
        html = source.get_html(url) => html.map(Some),
    }
}

/// All capture groups of every match of `pattern`, in order.
/// Optional groups that did not participate come back as empty strings.
pub fn scrape_from_pattern(html: &str, pattern: &Regex) -> Vec<Vec<String>> {
    pattern
        .captures_iter(html)
        .map(|caps| {
            caps.iter()
                .skip(1)
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect()
        })
        .collect()
}

/// `href`s of every anchor below `root_tag[attr=value]` elements.
pub fn links_under(html: &str, root_tag: &str, attr: &str, value: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let Ok(roots) = Selector::parse(&format!("{}[{}~=\"{}\"]", root_tag, attr, value)) else {
        return Vec::new();
    };

    doc.select(&roots)
        .flat_map(|root| root.select(&ANCHOR))
        .filter_map(|a| a.value().attr("href"))
        .map(|href| href.trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_COUNT_PATTERN;
    use crate::test_support::{http_response, local_client, serve_once};

    const LATIN1_HEADERS: &[(&str, &str)] = &[("Content-Type", "text/html; charset=iso-8859-1")];

    #[tokio::test]
    async fn declared_charset_is_trusted_by_default() {
        let (url, _) = serve_once(http_response("200 OK", LATIN1_HEADERS, "Página".as_bytes())).await;
        let html = HttpFetcher::new(local_client()).get_html(&url).await.unwrap();
        assert_eq!(html, "PÃ¡gina");
    }

    #[tokio::test]
    async fn utf8_mode_ignores_declared_charset() {
        let (url, request) =
            serve_once(http_response("200 OK", LATIN1_HEADERS, "Página".as_bytes())).await;
        let html = HttpFetcher::new(local_client())
            .decoding_utf8()
            .get_html(&url)
            .await
            .unwrap();
        assert_eq!(html, "Página");
        assert!(request.await.unwrap().starts_with("GET / HTTP/1.1"));
    }

    struct Hanging;

    impl PageSource for Hanging {
        async fn get_html(&self, _url: &str) -> Result<String> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn cancelled_fetch_returns_none() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let html = get_html_until(&Hanging, "http://localhost/", &cancel).await.unwrap();
        assert!(html.is_none());
    }

    #[test]
    fn pattern_returns_groups_per_match() {
        let re = Regex::new(r"(\d{4})-(\d{2})(-x)?").unwrap();
        let found = scrape_from_pattern("2016-01 and 2017-02-x", &re);
        assert_eq!(
            found,
            vec![
                vec!["2016".to_string(), "01".to_string(), String::new()],
                vec!["2017".to_string(), "02".to_string(), "-x".to_string()],
            ]
        );
    }

    #[test]
    fn page_count_marker() {
        let re = Regex::new(PAGE_COUNT_PATTERN).unwrap();
        let html = r#"<div><span class="paginaXdeN">Página 1 de 12</span></div>"#;
        assert_eq!(scrape_from_pattern(html, &re), vec![vec!["12".to_string()]]);
    }

    #[test]
    fn links_only_inside_matching_containers() {
        let html = r#"
            <div class="colunas"><a href="mensal.asp?c=GastosDiretos">a</a></div>
            <div class="outra"><a href="ignored.asp">b</a></div>
            <div class="colunas extra"><ul><li><a href=" snapshot.asp?c=Convenios ">c</a></li></ul></div>
        "#;
        let links = links_under(html, "div", "class", "colunas");
        assert_eq!(links, vec!["mensal.asp?c=GastosDiretos", "snapshot.asp?c=Convenios"]);
    }
}
