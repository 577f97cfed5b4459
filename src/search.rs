//! Search and content-extraction boundary. The orchestrator only sees the
//! [`SearchBackend`] trait; the default backend scrapes the Brave results
//! page and converts fetched pages with html2text.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use url::Url;

use crate::config::browser_headers;
use crate::error::{Error, Result};

/// Pages fetched per search; capped at the first success to bound latency
/// and token cost.
pub const MAX_PAGES_FETCHED: usize = 1;

const SEARCH_ENDPOINT: &str = "https://search.brave.com/search";
const TEXT_WIDTH: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub favicon: String,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Ordered results for `query`; an empty result set is an error.
    async fn search_results(&self, query: &str) -> Result<Vec<SearchResult>>;

    /// Extracted text of one result's page.
    async fn fetch_page(&self, result: &SearchResult) -> Result<String>;
}

/// Fetch page text for `results`, stopping after `MAX_PAGES_FETCHED`
/// successes; individual failures are logged and skipped.
pub async fn fetch_pages(backend: &dyn SearchBackend, results: &[SearchResult]) -> Vec<String> {
    let mut pages = Vec::new();
    for result in results {
        if pages.len() == MAX_PAGES_FETCHED {
            break;
        }
        match backend.fetch_page(result).await {
            Ok(text) => pages.push(text),
            Err(err) => tracing::warn!(url = %result.url, %err, "skipping unfetchable page"),
        }
    }
    pages
}

pub struct BraveSearch {
    client: reqwest::Client,
}

impl BraveSearch {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SearchBackend for BraveSearch {
    async fn search_results(&self, query: &str) -> Result<Vec<SearchResult>> {
        let url = format!("{}?q={}", SEARCH_ENDPOINT, urlencoding::encode(query));
        let html = self
            .client
            .get(&url)
            .headers(browser_headers())
            .send()
            .await?
            .text()
            .await?;

        let results = parse_search_results(&html);
        if results.is_empty() {
            return Err(Error::NoResults {
                query: query.to_string(),
            });
        }
        tracing::debug!(query, count = results.len(), "search results parsed");
        Ok(results)
    }

    async fn fetch_page(&self, result: &SearchResult) -> Result<String> {
        let response = self
            .client
            .get(&result.url)
            .headers(browser_headers())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Fetch(format!(
                "{} returned {}",
                result.url,
                response.status()
            )));
        }
        let html = response.text().await?;
        Ok(format!(
            "### Source URL: {}\n\n{}\n\n---\n\n",
            result.url,
            html_to_text(&html)
        ))
    }
}

/// Pull `{url, title, favicon}` triples out of a Brave results page,
/// skipping news-widget and wikipedia entries and non-absolute hrefs.
fn parse_search_results(html: &str) -> Vec<SearchResult> {
    let snippet = Selector::parse(r#"div[data-type="web"]"#).unwrap();
    let anchor = Selector::parse("a[href]").unwrap();
    let favicon = Selector::parse(r#"img[class*="favicon"]"#).unwrap();
    let title = Selector::parse(r#"div[class*="title"]"#).unwrap();

    let document = Html::parse_document(html);
    let mut results = Vec::new();
    for element in document.select(&snippet) {
        let Some(href) = element
            .select(&anchor)
            .next()
            .and_then(|a| a.value().attr("href"))
        else {
            continue;
        };
        let Ok(url) = Url::parse(href) else { continue };
        let url = url.to_string();
        if url.contains("brave.com/brave-news") || url.contains("wikipedia.org") {
            continue;
        }

        let favicon = element
            .select(&favicon)
            .next()
            .and_then(|img| img.value().attr("src"))
            .unwrap_or_default()
            .to_string();
        let title = element
            .select(&title)
            .next()
            .map(|t| t.text().collect::<String>().trim().to_string())
            .unwrap_or_default();

        results.push(SearchResult {
            url,
            title,
            favicon,
        });
    }
    results
}

// Best-effort: html2text, then whitespace runs collapsed and dash rules
// stripped.
fn html_to_text(html: &str) -> String {
    let text = html2text::from_read(Cursor::new(html.as_bytes()), TEXT_WIDTH)
        .unwrap_or_else(|_| html.to_string());
    strip_dash_rules(&squeeze_whitespace(&text))
}

fn squeeze_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run: Option<char> = None;
    let mut run_len = 0usize;
    for c in text.chars() {
        if c.is_whitespace() {
            if run.is_none() {
                run = Some(c);
            }
            run_len += 1;
        } else {
            match (run.take(), run_len) {
                (Some(first), 1) => out.push(first),
                (Some(_), _) => out.push('\n'),
                (None, _) => {}
            }
            run_len = 0;
            out.push(c);
        }
    }
    match (run, run_len) {
        (Some(first), 1) => out.push(first),
        (Some(_), _) => out.push('\n'),
        (None, _) => {}
    }
    out
}

fn strip_dash_rules(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut dashes = 0usize;
    for c in text.chars() {
        if c == '-' {
            dashes += 1;
            continue;
        }
        if dashes > 0 && dashes < 4 {
            out.extend(std::iter::repeat('-').take(dashes));
        }
        dashes = 0;
        out.push(c);
    }
    if dashes > 0 && dashes < 4 {
        out.extend(std::iter::repeat('-').take(dashes));
    }
    out
}
