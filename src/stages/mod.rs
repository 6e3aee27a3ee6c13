//! The three recurring pipeline stages.
//!
//! - `discovery`: sitemap index -> segments -> Pending.
//! - `processing`: Pending head -> enrichment -> Executed | Failed.
//! - `retry`: Failed head -> enrichment -> Executed | Failed tail.
//!
//! Stages receive their stores and collaborators at construction and keep no
//! state between runs.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use crate::enrich::EnrichmentChain;
use crate::failsafe::FailSafeLog;
use crate::model::Stage;
use crate::sitemap::SitemapSource;
use crate::store::{ItemStore, SitemapStore};

pub mod discovery;
pub mod processing;
pub mod retry;

pub use discovery::DiscoveryStage;
pub use processing::ProcessingStage;
pub use retry::RetryStage;

/// One invocation of a stage. Errors are logged by the caller and never stop
/// future runs.
#[async_trait]
pub trait StageRun: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// Discovery knobs shared by every publication.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub content_pattern: Regex,
    pub excluded_marker: String,
    pub backoff: Duration,
}

/// Everything a stage may need; cheap to clone.
#[derive(Clone)]
pub struct StageDeps {
    pub items: Arc<dyn ItemStore>,
    pub sitemaps: Arc<dyn SitemapStore>,
    pub journal: Arc<FailSafeLog>,
    pub source: Arc<dyn SitemapSource>,
    pub chain: EnrichmentChain,
    pub discovery: DiscoverySettings,
}

/// Build the runner for one (publication, stage) job.
pub fn build_stage(stage: Stage, publication: &str, sitemap_index: &str, deps: &StageDeps) -> Arc<dyn StageRun> {
    match stage {
        Stage::Discovery => Arc::new(DiscoveryStage::new(
            publication,
            sitemap_index,
            deps.items.clone(),
            deps.sitemaps.clone(),
            deps.journal.clone(),
            deps.source.clone(),
            deps.discovery.clone(),
        )),
        Stage::Processing => Arc::new(ProcessingStage::new(
            publication,
            deps.items.clone(),
            deps.journal.clone(),
            deps.chain.clone(),
        )),
        Stage::Retry => Arc::new(RetryStage::new(
            publication,
            deps.items.clone(),
            deps.journal.clone(),
            deps.chain.clone(),
        )),
    }
}
