//! HTTP implementations of the analyzer, tagger and publisher.
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{ACCEPT, CONTENT_TYPE, ETAG, IF_MATCH};
use reqwest::{Client, Request, Response};
use tracing::{debug, info, instrument, warn};

use super::model::{AnalyzeRequest, AnalyzeResponse, KeywordSet, TagResponse};
use super::{Analyzer, Publisher, Tagger};
use crate::config::{AnalyzerService, Credentials, HostRewrite};

const ATOM_XML: &str = "application/atom+xml";
const KEYWORD_FIELD_NAME: &str = "auto_Keywords";

fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("autotagger/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(60))
        .build()
        .context("failed to build http client")
}

async fn check_status(res: Response, what: &str) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    warn!(%status, what, "service returned an error");
    Err(anyhow!("{what} error {status}: {body}"))
}

#[derive(Clone)]
pub struct AnalyzerClient {
    http: Client,
    url: String,
    user: String,
    home: String,
    host_rewrite: Option<HostRewrite>,
}

impl std::fmt::Debug for AnalyzerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzerClient")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl AnalyzerClient {
    pub fn from_config(cfg: &AnalyzerService) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            url: cfg.url.clone(),
            user: cfg.user.clone(),
            home: cfg.home.clone(),
            host_rewrite: cfg.host_rewrite.clone(),
        })
    }

    /// Apply the configured host rewrite (e.g. staging host to production host).
    pub fn rewrite_url(&self, url: &str) -> String {
        match &self.host_rewrite {
            Some(rw) if url.contains(&rw.from) => url.replace(&rw.from, &rw.to),
            _ => url.to_string(),
        }
    }

    pub fn build_request(&self, article_url: &str) -> Result<Request> {
        let target = self.rewrite_url(article_url);
        self.http
            .post(&self.url)
            .header("Esc-User", &self.user)
            .header("Esc-Home", &self.home)
            .json(&AnalyzeRequest { url: &target })
            .build()
            .context("failed to build analyzer request")
    }
}

#[async_trait]
impl Analyzer for AnalyzerClient {
    #[instrument(skip(self))]
    async fn analyze(&self, url: &str) -> Result<String> {
        let request = self.build_request(url)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach analyzer")?;
        let res = check_status(res, "analyzer").await?;
        let payload: AnalyzeResponse = res.json().await.context("invalid analyzer response JSON")?;
        let asset_id = payload
            .assetid
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| anyhow!("analyzer returned no asset id for {url}"))?;
        debug!(%asset_id, "article analyzed");
        Ok(asset_id)
    }
}

#[derive(Clone)]
pub struct TaggerClient {
    http: Client,
    creds: Credentials,
}

impl std::fmt::Debug for TaggerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggerClient")
            .field("url", &self.creds.url)
            .finish_non_exhaustive()
    }
}

impl TaggerClient {
    pub fn from_config(creds: &Credentials) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            creds: creds.clone(),
        })
    }

    pub fn build_request(&self, asset_id: &str) -> Result<Request> {
        self.http
            .get(format!("{}{}", self.creds.url, asset_id))
            .basic_auth(&self.creds.login, Some(&self.creds.password))
            .header(ACCEPT, "application/json")
            .build()
            .context("failed to build tagger request")
    }
}

#[async_trait]
impl Tagger for TaggerClient {
    #[instrument(skip(self))]
    async fn tag(&self, asset_id: &str) -> Result<KeywordSet> {
        let request = self.build_request(asset_id)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach tagger")?;
        let res = check_status(res, "tagger").await?;
        let payload: Vec<TagResponse> = res.json().await.context("invalid tagger response JSON")?;
        let first = payload
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("tagger returned nothing for {asset_id}"))?;
        Ok(KeywordSet::from(first))
    }
}

#[derive(Clone)]
pub struct PublisherClient {
    http: Client,
    creds: Credentials,
}

impl std::fmt::Debug for PublisherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherClient")
            .field("url", &self.creds.url)
            .finish_non_exhaustive()
    }
}

impl PublisherClient {
    pub fn from_config(creds: &Credentials) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            creds: creds.clone(),
        })
    }

    fn content_url(&self, article_id: &str) -> String {
        format!("{}{}", self.creds.url, article_id)
    }

    pub fn build_get(&self, article_id: &str) -> Result<Request> {
        self.http
            .get(self.content_url(article_id))
            .basic_auth(&self.creds.login, Some(&self.creds.password))
            .header(ACCEPT, ATOM_XML)
            .build()
            .context("failed to build publisher GET")
    }

    pub fn build_put(&self, article_id: &str, etag: Option<&str>, document: String) -> Result<Request> {
        let mut builder = self
            .http
            .put(self.content_url(article_id))
            .basic_auth(&self.creds.login, Some(&self.creds.password))
            .header(CONTENT_TYPE, ATOM_XML);
        if let Some(etag) = etag {
            builder = builder.header(IF_MATCH, etag);
        }
        builder
            .body(document)
            .build()
            .context("failed to build publisher PUT")
    }
}

#[async_trait]
impl Publisher for PublisherClient {
    #[instrument(skip(self, keywords))]
    async fn push(&self, article_id: &str, keywords: &str) -> Result<()> {
        let res = self
            .http
            .execute(self.build_get(article_id)?)
            .await
            .context("failed to reach publisher")?;
        let res = check_status(res, "publisher GET").await?;
        let etag = res
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let document = res.text().await.context("failed to read article document")?;

        let Some(updated) = apply_keywords(&document, keywords)? else {
            info!(article_id, "article has no {KEYWORD_FIELD_NAME} field; nothing to write");
            return Ok(());
        };

        let res = self
            .http
            .execute(self.build_put(article_id, etag.as_deref(), updated)?)
            .await
            .context("failed to reach publisher")?;
        check_status(res, "publisher PUT").await?;
        debug!(article_id, "keywords pushed");
        Ok(())
    }
}

static KEYWORD_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<vdf:field\b[^>]*\bname\s*=\s*"auto_Keywords"[^>]*>"#).expect("valid field regex")
});
static VALUE_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<vdf:value\s*/>|<vdf:value\b[^>]*>.*?</vdf:value>").expect("valid value regex")
});
static APP_CONTROL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<app:control\b[^>]*>").expect("valid control regex"));
static KEEP_LAST_MODIFIED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"keep-last-modified\s*=\s*"[^"]*""#).expect("valid attribute regex")
});

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Write `keywords` into the `auto_Keywords` field of an Atom entry and mark
/// the update as silent.
///
/// Returns `Ok(None)` when the document has no such field; fails when the
/// document has no `app:control` element since the update could not be silent.
pub fn apply_keywords(document: &str, keywords: &str) -> Result<Option<String>> {
    let Some(open) = KEYWORD_FIELD.find(document) else {
        return Ok(None);
    };
    let value = format!("<vdf:value>{}</vdf:value>", escape_xml(keywords));
    let open_tag = open.as_str();

    let mut out = String::with_capacity(document.len() + value.len() + 32);
    out.push_str(&document[..open.start()]);
    if let Some(stripped) = open_tag.strip_suffix("/>") {
        out.push_str(stripped.trim_end());
        out.push('>');
        out.push_str(&value);
        out.push_str("</vdf:field>");
        out.push_str(&document[open.end()..]);
    } else {
        let body_start = open.end();
        let close = document[body_start..]
            .find("</vdf:field>")
            .map(|i| body_start + i)
            .ok_or_else(|| anyhow!("unterminated {KEYWORD_FIELD_NAME} field"))?;
        let body = &document[body_start..close];
        out.push_str(open_tag);
        match VALUE_ELEMENT.find(body) {
            Some(m) => {
                out.push_str(&body[..m.start()]);
                out.push_str(&value);
                out.push_str(&body[m.end()..]);
            }
            None => {
                out.push_str(body);
                out.push_str(&value);
            }
        }
        out.push_str(&document[close..]);
    }

    mark_silent(&out).map(Some)
}

fn mark_silent(document: &str) -> Result<String> {
    let control = APP_CONTROL
        .find(document)
        .ok_or_else(|| anyhow!("document has no app:control element; refusing a non-silent update"))?;
    let tag = control.as_str();
    let new_tag = if KEEP_LAST_MODIFIED.is_match(tag) {
        KEEP_LAST_MODIFIED
            .replace(tag, r#"keep-last-modified="true""#)
            .into_owned()
    } else {
        let name_end = "<app:control".len();
        format!(r#"{} keep-last-modified="true"{}"#, &tag[..name_end], &tag[name_end..])
    };
    Ok(format!(
        "{}{}{}",
        &document[..control.start()],
        new_tag,
        &document[control.end()..]
    ))
}
