use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error, info, instrument};

use super::StageRun;
use crate::enrich::EnrichmentChain;
use crate::failsafe::{FailSafeLog, WriteOutcome, RETRY_DRAIN};
use crate::model::{Entry, Item, Queue};
use crate::store::ItemStore;

/// Re-attempts the head of Failed. A repeated failure rotates the item to the
/// tail of Failed; only the head is ever read, so one item that keeps failing
/// is retried on every run.
pub struct RetryStage {
    publication: String,
    items: Arc<dyn ItemStore>,
    journal: Arc<FailSafeLog>,
    chain: EnrichmentChain,
}

impl RetryStage {
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

    async fn retry(&self, item: Item) {
        let store = self.items.as_ref();
        match self.chain.enrich(&item.url).await {
            Ok(asset_id) => {
                info!(url = %item.url, %asset_id, "retried item executed");
                let entry = Entry::Executed {
                    item: item.clone(),
                    asset_id,
                };
                self.journal.save(store, &entry).await;
                self.journal.remove(store, Queue::Failed, &item).await;
            }
            Err(err) => {
                error!(url = %item.url, error = ?err, "retry failed; rotating item");
                let requeue = Entry::Failed(item.clone());
                match self.journal.remove(store, Queue::Failed, &item).await {
                    // The delete will be replayed before the saves; keep the
                    // re-insert behind it.
                    WriteOutcome::Journaled => {
                        self.journal.defer_save(&requeue).await;
                    }
                    _ => {
                        self.journal.save(store, &requeue).await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl StageRun for RetryStage {
    #[instrument(skip_all, fields(publication = %self.publication))]
    async fn run(&self) -> Result<()> {
        self.journal
            .drain(self.items.as_ref(), &self.publication, &RETRY_DRAIN)
            .await;

        let next = self
            .items
            .top(Queue::Failed, &self.publication)
            .await
            .context("failed to read the failed queue")?;
        let Some(item) = next else {
            debug!("failed queue is empty");
            return Ok(());
        };
        self.retry(item).await;
        Ok(())
    }
}
