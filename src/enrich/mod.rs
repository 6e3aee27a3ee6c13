use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument};

pub mod client;
pub mod model;

pub use model::KeywordSet;

/// Resolves an article URL to the asset id known by the tagger.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, url: &str) -> Result<String>;
}

#[async_trait]
pub trait Tagger: Send + Sync {
    async fn tag(&self, asset_id: &str) -> Result<KeywordSet>;
}

/// Writes a keyword string back to the article. Pushing the same string twice
/// must be harmless.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn push(&self, article_id: &str, keywords: &str) -> Result<()>;
}

/// `escenic-123` -> `123`. Anything that is not exactly two dash-separated
/// parts is rejected.
pub fn article_id_from_asset(asset_id: &str) -> Result<&str> {
    let mut parts = asset_id.split('-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(prefix), Some(id), None) if !prefix.is_empty() && !id.is_empty() => Ok(id),
        _ => Err(anyhow!("asset id '{asset_id}' is not of the form <source>-<article id>")),
    }
}

/// Analyzer, tagger and publisher called in sequence for one article.
#[derive(Clone)]
pub struct EnrichmentChain {
    analyzer: Arc<dyn Analyzer>,
    tagger: Arc<dyn Tagger>,
    publisher: Arc<dyn Publisher>,
}

impl EnrichmentChain {
    pub fn new(analyzer: Arc<dyn Analyzer>, tagger: Arc<dyn Tagger>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            analyzer,
            tagger,
            publisher,
        }
    }

    /// Run the whole chain; returns the asset id on success.
    #[instrument(skip(self))]
    pub async fn enrich(&self, url: &str) -> Result<String> {
        let asset_id = self
            .analyzer
            .analyze(url)
            .await
            .context("analyzer call failed")?;
        let keywords = self
            .tagger
            .tag(&asset_id)
            .await
            .with_context(|| format!("tagger call failed for {asset_id}"))?;
        let article_id = article_id_from_asset(&asset_id)?;
        let keyword_string = keywords.to_keyword_string();
        debug!(%asset_id, article_id, keywords = %keyword_string, "pushing keywords");
        self.publisher
            .push(article_id, &keyword_string)
            .await
            .with_context(|| format!("publisher call failed for article {article_id}"))?;
        Ok(asset_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn article_id_parsing() {
        assert_eq!(article_id_from_asset("escenic-123").unwrap(), "123");
        assert!(article_id_from_asset("escenic").is_err());
        assert!(article_id_from_asset("escenic-1-2").is_err());
        assert!(article_id_from_asset("-1").is_err());
    }

    struct FixedAnalyzer(&'static str);

    #[async_trait]
    impl Analyzer for FixedAnalyzer {
        async fn analyze(&self, _url: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FixedTagger;

    #[async_trait]
    impl Tagger for FixedTagger {
        async fn tag(&self, _asset_id: &str) -> Result<KeywordSet> {
            let mut set = KeywordSet::default();
            set.keywords.insert("x".into());
            Ok(set)
        }
    }

    #[derive(Default)]
    struct CapturingPublisher(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl Publisher for CapturingPublisher {
        async fn push(&self, article_id: &str, keywords: &str) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .push((article_id.to_string(), keywords.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn chain_pushes_to_article_id() {
        let publisher = Arc::new(CapturingPublisher::default());
        let chain = EnrichmentChain::new(
            Arc::new(FixedAnalyzer("escenic-42")),
            Arc::new(FixedTagger),
            publisher.clone(),
        );
        assert_eq!(chain.enrich("/a/1").await.unwrap(), "escenic-42");
        assert_eq!(
            publisher.0.lock().unwrap().clone(),
            vec![("42".to_string(), "x".to_string())]
        );
    }

    #[tokio::test]
    async fn malformed_asset_id_fails_before_push() {
        let publisher = Arc::new(CapturingPublisher::default());
        let chain = EnrichmentChain::new(
            Arc::new(FixedAnalyzer("asset1")),
            Arc::new(FixedTagger),
            publisher.clone(),
        );
        assert!(chain.enrich("/a/1").await.is_err());
        assert!(publisher.0.lock().unwrap().is_empty());
    }
}
