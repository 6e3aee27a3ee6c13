use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error, info, instrument};

use super::StageRun;
use crate::enrich::EnrichmentChain;
use crate::failsafe::{FailSafeLog, PROCESSING_DRAIN};
use crate::model::{Entry, Item, Queue};
use crate::store::ItemStore;

/// Takes the head of Pending through the enrichment chain.
pub struct ProcessingStage {
    publication: String,
    items: Arc<dyn ItemStore>,
    journal: Arc<FailSafeLog>,
    chain: EnrichmentChain,
}

impl ProcessingStage {
    pub fn new(
        publication: impl Into<String>,
        items: Arc<dyn ItemStore>,
        journal: Arc<FailSafeLog>,
        chain: EnrichmentChain,
    ) -> Self {
        Self {
            publication: publication.into(),
            items,
            journal,
            chain,
        }
    }

    async fn process(&self, item: Item) {
        let entry = match self.chain.enrich(&item.url).await {
            Ok(asset_id) => {
                info!(url = %item.url, %asset_id, "item executed");
                Entry::Executed {
                    item: item.clone(),
                    asset_id,
                }
            }
            Err(err) => {
                error!(url = %item.url, error = ?err, "enrichment failed; moving item to failed");
                Entry::Failed(item.clone())
            }
        };
        self.journal.save(self.items.as_ref(), &entry).await;
        // Always leave Pending, whatever happened above.
        self.journal
            .remove(self.items.as_ref(), Queue::Pending, &item)
            .await;
    }
}

#[async_trait]
impl StageRun for ProcessingStage {
    #[instrument(skip_all, fields(publication = %self.publication))]
    async fn run(&self) -> Result<()> {
        self.journal
            .drain(self.items.as_ref(), &self.publication, &PROCESSING_DRAIN)
            .await;

        let next = self
            .items
            .top(Queue::Pending, &self.publication)
            .await
            .context("failed to read the pending queue")?;
        let Some(item) = next else {
            debug!("pending queue is empty");
            return Ok(());
        };
        self.process(item).await;
        Ok(())
    }
}
