//! Published cache facade over the document and media partitions.

use std::sync::Arc;

use futures::future::join;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::application::repos::ContentRepository;
use crate::domain::content::{ContentNode, NodeId, TreeKind};

use super::config::CacheConfig;
use super::error::CacheError;
use super::events::{CacheWarning, EventSender, WarningReporter};
use super::generation::GenId;
use super::partition::{Partition, PartitionStatus, StartSource};
use super::snapshot::Snapshot;

pub struct PublishedCache {
    documents: Partition,
    media: Partition,
    warnings: WarningReporter,
}

impl PublishedCache {
    pub fn new(config: &CacheConfig, repository: Arc<dyn ContentRepository>) -> Self {
        let warnings = WarningReporter::new(config.warning_channel_capacity);
        Self {
            documents: Partition::new(
                TreeKind::Document,
                config,
                Arc::clone(&repository),
                warnings.clone(),
            ),
            media: Partition::new(TreeKind::Media, config, repository, warnings.clone()),
            warnings,
        }
    }

    pub fn partition(&self, tree: TreeKind) -> &Partition {
        match tree {
            TreeKind::Document => &self.documents,
            TreeKind::Media => &self.media,
        }
    }

    /// Brings both trees up, from local files where possible.
    ///
    /// Both starts run to completion even when one fails, so neither tree is
    /// left `Rebuilding`. The documents error wins when both fail.
    #[instrument(skip(self, cancel))]
    pub async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<(StartSource, StartSource), CacheError> {
        let (documents, media) = join(
            self.documents.start(cancel.clone()),
            self.media.start(cancel),
        )
        .await;
        let started = (documents?, media?);
        info!(documents = ?started.0, media = ?started.1, "Published cache started");
        Ok(started)
    }

    /// Starts the invalidation pipelines. Trees whose pipeline is already
    /// running are skipped.
    pub fn spawn_pipelines(&self, cancel: &CancellationToken) -> Vec<JoinHandle<usize>> {
        TreeKind::ALL
            .iter()
            .filter_map(|tree| self.partition(*tree).spawn_pipeline(cancel.child_token()))
            .collect()
    }

    pub fn acquire_snapshot(&self, tree: TreeKind) -> Snapshot {
        self.partition(tree).acquire_snapshot()
    }

    pub fn documents(&self) -> Snapshot {
        self.documents.acquire_snapshot()
    }

    pub fn media(&self) -> Snapshot {
        self.media.acquire_snapshot()
    }

    pub fn status(&self, tree: TreeKind) -> PartitionStatus {
        self.partition(tree).status()
    }

    pub async fn get_node(
        &self,
        tree: TreeKind,
        id: NodeId,
    ) -> Result<Option<Arc<ContentNode>>, CacheError> {
        self.partition(tree).get_node(id).await
    }

    /// Drops both in-memory trees and their local files, then rebuilds.
    #[instrument(skip(self, cancel))]
    pub async fn clear_memory_cache(
        &self,
        cancel: CancellationToken,
    ) -> Result<(GenId, GenId), CacheError> {
        let documents = self.documents.clear_memory_cache(cancel.clone()).await?;
        let media = self.media.clear_memory_cache(cancel).await?;
        Ok((documents, media))
    }

    pub fn event_sender(&self, tree: TreeKind) -> EventSender {
        self.partition(tree).sender()
    }

    pub fn subscribe_warnings(&self) -> broadcast::Receiver<CacheWarning> {
        self.warnings.subscribe()
    }

    /// Stops background persistence, flushing pending saves.
    pub async fn shutdown(&self) {
        join(self.documents.shutdown(), self.media.shutdown()).await;
    }
}
