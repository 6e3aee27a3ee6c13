use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{DiscoverySettings, StageRun};
use crate::failsafe::{FailSafeLog, DISCOVERY_DRAIN};
use crate::model::{Entry, Item, NewSegment, Queue, SitemapSegment};
use crate::sitemap::SitemapSource;
use crate::store::{ItemStore, SitemapStore};

/// Expands one sitemap segment per run into Pending items.
pub struct DiscoveryStage {
    publication: String,
    sitemap_index: String,
    items: Arc<dyn ItemStore>,
    sitemaps: Arc<dyn SitemapStore>,
    journal: Arc<FailSafeLog>,
    source: Arc<dyn SitemapSource>,
    settings: DiscoverySettings,
}

impl DiscoveryStage {
    pub fn new(
        publication: impl Into<String>,
        sitemap_index: impl Into<String>,
        items: Arc<dyn ItemStore>,
        sitemaps: Arc<dyn SitemapStore>,
        journal: Arc<FailSafeLog>,
        source: Arc<dyn SitemapSource>,
        mut settings: DiscoverySettings,
    ) -> Self {
        settings.excluded_marker = settings.excluded_marker.to_lowercase();
        Self {
            publication: publication.into(),
            sitemap_index: sitemap_index.into(),
            items,
            sitemaps,
            journal,
            source,
            settings,
        }
    }

    /// Fetch the index and store its eligible segments. Returns how many
    /// eligible segments the index listed.
    async fn load_index(&self) -> Result<usize> {
        let refs = self
            .source
            .fetch_index(&self.sitemap_index)
            .await
            .with_context(|| format!("failed to fetch sitemap index {}", self.sitemap_index))?;
        let listed = refs.len();
        let eligible: Vec<NewSegment> = refs
            .into_iter()
            .filter(|r| !r.url.to_lowercase().contains(&self.settings.excluded_marker))
            .map(|r| NewSegment {
                publication: self.publication.clone(),
                url: r.url,
                last_modified: r.last_modified,
            })
            .collect();
        if !eligible.is_empty() {
            let inserted = self
                .sitemaps
                .insert_segments(&eligible)
                .await
                .context("failed to store sitemap segments")?;
            info!(listed, eligible = eligible.len(), inserted, "sitemap index loaded");
        }
        Ok(eligible.len())
    }

    /// Nothing has ever been crawled: keep trying until the index yields segments.
    async fn cold_start(&self) {
        loop {
            match self.load_index().await {
                Ok(n) if n > 0 => return,
                Ok(_) => warn!(backoff = ?self.settings.backoff, "sitemap index has no eligible segments"),
                Err(err) => warn!(backoff = ?self.settings.backoff, error = ?err, "sitemap index unavailable"),
            }
            tokio::time::sleep(self.settings.backoff).await;
        }
    }

    async fn next_segment(&self) -> Result<Option<SitemapSegment>> {
        if let Some(segment) = self
            .sitemaps
            .top_unexecuted(&self.publication)
            .await
            .context("failed to read sitemap segments")?
        {
            return Ok(Some(segment));
        }

        let known = self
            .sitemaps
            .segment_count(&self.publication)
            .await
            .context("failed to count sitemap segments")?;
        if known == 0 {
            self.cold_start().await;
        } else if let Err(err) = self.load_index().await {
            warn!(error = ?err, "sitemap index refresh failed");
        }

        self.sitemaps
            .top_unexecuted(&self.publication)
            .await
            .context("failed to read sitemap segments")
    }

    async fn is_known(&self, url: &str) -> Result<bool> {
        for queue in Queue::ALL {
            if self
                .items
                .contains(queue, &self.publication, url)
                .await
                .with_context(|| format!("failed to check {queue} for {url}"))?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn expand(&self, segment: &SitemapSegment) -> Result<()> {
        let urls = match self.source.fetch_segment(&segment.url).await {
            Ok(urls) => urls,
            Err(err) => {
                warn!(segment = %segment.url, error = ?err, "failed to fetch segment; retrying next run");
                return Ok(());
            }
        };

        let listed = urls.len();
        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        for url in urls {
            if !self.settings.content_pattern.is_match(&url) || !seen.insert(url.clone()) {
                continue;
            }
            if self.is_known(&url).await? {
                continue;
            }
            accepted.push(Entry::Pending(Item::new(self.publication.clone(), url)));
        }

        match self.items.insert_all(&accepted).await {
            Ok(inserted) => {
                self.sitemaps
                    .mark_executed(&self.publication, &segment.url)
                    .await
                    .with_context(|| format!("failed to mark segment {} executed", segment.url))?;
                info!(segment = %segment.url, listed, accepted = accepted.len(), inserted, "segment executed");
            }
            Err(err) => {
                warn!(segment = %segment.url, %err, "failed to queue segment urls; retrying next run");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StageRun for DiscoveryStage {
    #[instrument(skip_all, fields(publication = %self.publication))]
    async fn run(&self) -> Result<()> {
        let Some(segment) = self.next_segment().await? else {
            debug!("no unexecuted sitemap segment");
            return Ok(());
        };

        self.journal
            .drain(self.items.as_ref(), &self.publication, &DISCOVERY_DRAIN)
            .await;

        self.expand(&segment).await
    }
}
