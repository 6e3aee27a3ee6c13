//! Sitemap index and url-set fetching.
use std::io::Read;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, instrument};

/// One `<sitemap>` entry of a sitemap index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRef {
    pub url: String,
    pub last_modified: String,
}

#[async_trait]
pub trait SitemapSource: Send + Sync {
    async fn fetch_index(&self, index_url: &str) -> Result<Vec<SegmentRef>>;

    /// `<loc>` values of a (possibly gzip-compressed) url-set document.
    async fn fetch_segment(&self, segment_url: &str) -> Result<Vec<String>>;
}

static SITEMAP_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<sitemap\b[^>]*>(.*?)</sitemap>").expect("valid sitemap regex"));
static URL_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<url\b[^>]*>(.*?)</url>").expect("valid url regex"));
static LOC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<loc>\s*(.*?)\s*</loc>").expect("valid loc regex"));
static LASTMOD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<lastmod>\s*(.*?)\s*</lastmod>").expect("valid lastmod regex"));

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn capture(re: &Regex, block: &str) -> Option<String> {
    re.captures(block)
        .and_then(|c| c.get(1))
        .map(|m| unescape(m.as_str()))
        .filter(|s| !s.is_empty())
}

pub fn parse_sitemap_index(xml: &str) -> Vec<SegmentRef> {
    SITEMAP_BLOCK
        .captures_iter(xml)
        .filter_map(|c| {
            let block = c.get(1)?.as_str();
            Some(SegmentRef {
                url: capture(&LOC, block)?,
                last_modified: capture(&LASTMOD, block).unwrap_or_default(),
            })
        })
        .collect()
}

pub fn parse_url_set(xml: &str) -> Vec<String> {
    URL_BLOCK
        .captures_iter(xml)
        .filter_map(|c| capture(&LOC, c.get(1)?.as_str()))
        .collect()
}

/// Gunzip `bytes` when they carry the gzip magic, otherwise read them as text.
pub fn inflate(bytes: &[u8]) -> Result<String> {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(bytes);
        let mut raw = String::new();
        decoder
            .read_to_string(&mut raw)
            .map_err(|e| anyhow!("failed to decode gzip sitemap: {e}"))?;
        Ok(raw)
    } else {
        String::from_utf8(bytes.to_vec()).context("sitemap is not valid UTF-8")
    }
}

pub struct HttpSitemapSource {
    http: Client,
}

impl HttpSitemapSource {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("autotagger/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build sitemap http client")?;
        Ok(Self { http })
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("GET {url} returned {status}"));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl SitemapSource for HttpSitemapSource {
    #[instrument(skip(self))]
    async fn fetch_index(&self, index_url: &str) -> Result<Vec<SegmentRef>> {
        let body = inflate(&self.get_bytes(index_url).await?)?;
        let segments = parse_sitemap_index(&body);
        debug!(count = segments.len(), "sitemap index parsed");
        Ok(segments)
    }

    #[instrument(skip(self))]
    async fn fetch_segment(&self, segment_url: &str) -> Result<Vec<String>> {
        let body = inflate(&self.get_bytes(segment_url).await?)?;
        let urls = parse_url_set(&body);
        debug!(count = urls.len(), "url set parsed");
        Ok(urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const INDEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap>
    <loc>https://www.bmo.de/sitemaps/sitemap-2024-01.xml.gz</loc>
    <lastmod>2024-01-31T23:00:00+01:00</lastmod>
  </sitemap>
  <sitemap><loc>https://www.bmo.de/sitemaps/sitemap-section-politik.xml</loc></sitemap>
</sitemapindex>"#;

    const URLSET: &str = r#"<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://www.bmo.de/politik/article-1.html?a=1&amp;b=2</loc><lastmod>2024-01-02</lastmod></url>
  <url>
    <loc>
      https://www.bmo.de/sport/
    </loc>
  </url>
</urlset>"#;

    #[test]
    fn index_entries_keep_lastmod() {
        let segments = parse_sitemap_index(INDEX);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].url, "https://www.bmo.de/sitemaps/sitemap-2024-01.xml.gz");
        assert_eq!(segments[0].last_modified, "2024-01-31T23:00:00+01:00");
        assert_eq!(segments[1].last_modified, "");
    }

    #[test]
    fn url_set_unescapes_and_trims() {
        let urls = parse_url_set(URLSET);
        assert_eq!(
            urls,
            vec![
                "https://www.bmo.de/politik/article-1.html?a=1&b=2".to_string(),
                "https://www.bmo.de/sport/".to_string(),
            ]
        );
    }

    #[test]
    fn inflate_handles_gzip_and_plain() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(URLSET.as_bytes()).unwrap();
        let gz = enc.finish().unwrap();
        assert_eq!(inflate(&gz).unwrap(), URLSET);
        assert_eq!(inflate(URLSET.as_bytes()).unwrap(), URLSET);
    }

    #[test]
    fn truncated_gzip_is_an_error() {
        assert!(inflate(&[0x1f, 0x8b, 0x08, 0x00]).is_err());
    }
}
