//! One content tree: store, pipeline, persistence and lifecycle status.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use metrics::histogram;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::application::repos::ContentRepository;
use crate::domain::content::{ContentNode, NodeId, SourceVersion, TreeKind};

use super::config::CacheConfig;
use super::error::CacheError;
use super::events::{self, CacheWarning, EventReceiver, EventSender, WarningKind, WarningReporter};
use super::generation::{GenId, GenerationStore, TreeChange};
use super::lock::mutex_lock;
use super::navigation::OutlineEntry;
use super::persistence::{LoadedGeneration, LocalPersistence, Persister};
use super::pipeline::InvalidationPipeline;
use super::seed::{RepositoryRoots, SeedKey, load_outline, seed_keys};
use super::snapshot::Snapshot;

const SOURCE: &str = "cache::partition";

const METRIC_REBUILD_MS: &str = "canopy_rebuild_ms";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionStatus {
    Uninitialized,
    Rebuilding,
    Ready { generation: GenId },
    Failed { reason: String },
}

impl PartitionStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, PartitionStatus::Ready { .. })
    }
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionStatus::Uninitialized => f.write_str("uninitialized"),
            PartitionStatus::Rebuilding => f.write_str("rebuilding"),
            PartitionStatus::Ready { generation } => write!(f, "ready (generation {generation})"),
            PartitionStatus::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// How [`Partition::start`] brought the tree up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartSource {
    LocalFile { replayed: usize },
    Rebuilt,
}

pub struct Partition {
    tree: TreeKind,
    config: CacheConfig,
    store: Arc<GenerationStore>,
    repository: Arc<dyn ContentRepository>,
    pipeline: Arc<InvalidationPipeline>,
    warnings: WarningReporter,
    persistence: Option<Arc<LocalPersistence>>,
    persister: Option<Persister>,
    persister_task: Mutex<Option<JoinHandle<()>>>,
    status: watch::Sender<PartitionStatus>,
    complete: AtomicBool,
    sender: EventSender,
    receiver: Mutex<Option<EventReceiver>>,
    shutdown: CancellationToken,
}

impl Partition {
    /// Builds an idle partition. With persistence enabled this spawns the
    /// background persister, so it must run inside a tokio runtime.
    pub fn new(
        tree: TreeKind,
        config: &CacheConfig,
        repository: Arc<dyn ContentRepository>,
        warnings: WarningReporter,
    ) -> Self {
        let store = Arc::new(GenerationStore::new(tree));
        let shutdown = CancellationToken::new();

        let persistence = config
            .persistence_enabled
            .then(|| Arc::new(LocalPersistence::new(tree, config.local_file(tree))));
        let (persister, persister_task) = match &persistence {
            Some(persistence) => {
                let (persister, task) =
                    Persister::spawn(Arc::clone(persistence), shutdown.child_token());
                (Some(persister), Some(task))
            }
            None => (None, None),
        };

        let mut pipeline = InvalidationPipeline::new(
            Arc::clone(&store),
            Arc::clone(&repository),
            warnings.clone(),
            config.max_commit_retries,
        )
        .with_page_size(config.children_page_size_non_zero().get());
        if let Some(persister) = &persister {
            pipeline = pipeline.with_persister(persister.clone());
        }

        let (sender, receiver) = events::channel(tree, config.event_channel_capacity);
        let (status, _) = watch::channel(PartitionStatus::Uninitialized);

        Self {
            tree,
            config: config.clone(),
            store,
            repository,
            pipeline: Arc::new(pipeline),
            warnings,
            persistence,
            persister,
            persister_task: Mutex::new(persister_task),
            status,
            complete: AtomicBool::new(false),
            sender,
            receiver: Mutex::new(Some(receiver)),
            shutdown,
        }
    }

    pub fn tree(&self) -> TreeKind {
        self.tree
    }

    pub fn store(&self) -> &Arc<GenerationStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &Arc<InvalidationPipeline> {
        &self.pipeline
    }

    pub fn acquire_snapshot(&self) -> Snapshot {
        self.store.acquire_snapshot()
    }

    pub fn status(&self) -> PartitionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PartitionStatus> {
        self.status.subscribe()
    }

    /// Whether every placed node has its content loaded, so a cache miss is
    /// authoritative.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    fn set_status(&self, status: PartitionStatus) {
        info!(tree = %self.tree, status = %status, "Partition status changed");
        self.status.send_replace(status);
    }

    /// Loads the local file and replays the change log since its watermark,
    /// or rebuilds from the repository when there is no usable file.
    #[instrument(skip(self, cancel), fields(tree = %self.tree))]
    pub async fn start(&self, cancel: CancellationToken) -> Result<StartSource, CacheError> {
        if let Some(persistence) = &self.persistence
            && let Some(loaded) = persistence.load().await
        {
            match self.restore(loaded).await {
                Ok(generation) => {
                    let replayed = match self.pipeline.replay(self.pipeline.watermark()).await {
                        Ok(replayed) => replayed,
                        Err(err) => {
                            warn!(
                                tree = %self.tree,
                                error = %err,
                                "Change log replay failed; serving the loaded generation"
                            );
                            0
                        }
                    };
                    let head = self.store.head().max(generation);
                    self.set_status(PartitionStatus::Ready { generation: head });
                    return Ok(StartSource::LocalFile { replayed });
                }
                Err(err) => {
                    warn!(
                        tree = %self.tree,
                        error = %err,
                        "Local cache file could not be installed; rebuilding"
                    );
                }
            }
        }

        self.rebuild(cancel).await?;
        Ok(StartSource::Rebuilt)
    }

    async fn restore(&self, loaded: LoadedGeneration) -> Result<GenId, CacheError> {
        let record_count = loaded.record_count();
        let complete = loaded.outline.is_empty();
        let changes = self.replacement_changes(loaded.outline, loaded.nodes);

        let generation = self.store.install(loaded.generation, changes)?;
        self.pipeline.rebase(loaded.watermark).await;
        self.complete.store(complete, Ordering::Release);
        info!(
            tree = %self.tree,
            generation,
            watermark = loaded.watermark,
            records = record_count,
            complete,
            "Restored generation from local cache file"
        );
        Ok(generation)
    }

    /// Tombstones for the current roots followed by the new outline and
    /// nodes, so the commit replaces the whole tree in one generation.
    fn replacement_changes(
        &self,
        outline: Vec<OutlineEntry>,
        nodes: Vec<ContentNode>,
    ) -> Vec<TreeChange> {
        let head = self.store.head();
        let mut changes: Vec<TreeChange> = super::navigation::roots(&self.store, head)
            .iter()
            .map(|id| TreeChange::Node(id, None))
            .collect();
        changes.extend(outline.into_iter().map(TreeChange::Outline));
        changes.extend(
            nodes
                .into_iter()
                .map(|node| TreeChange::Node(node.id(), Some(node))),
        );
        changes
    }

    /// Reads the tree from the repository and replaces it in one commit.
    ///
    /// The whole outline is placed while content is loaded only for the
    /// seed set. A cancelled rebuild leaves the partition `Uninitialized` and the store
    /// untouched. A commit conflict with a concurrent writer restarts the
    /// rebuild, at most `max_commit_retries` times.
    #[instrument(skip(self, cancel), fields(tree = %self.tree))]
    pub async fn rebuild(&self, cancel: CancellationToken) -> Result<GenId, CacheError> {
        let started_at = Instant::now();
        let previous = self.status();
        self.set_status(PartitionStatus::Rebuilding);

        let mut attempt = 0;
        let result = loop {
            let base = self.store.head();
            let hydrated = match self.hydrate(&cancel).await {
                Ok(hydrated) => hydrated,
                Err(err) => break Err(err),
            };
            let node_count = hydrated.nodes.len();
            let placed = hydrated.outline.len();
            let changes = self.replacement_changes(hydrated.outline, hydrated.nodes);

            match self.store.commit_tree(base, changes) {
                Ok(generation) => {
                    self.complete.store(hydrated.complete, Ordering::Release);
                    self.pipeline.rebase(hydrated.watermark).await;
                    info!(
                        tree = %self.tree,
                        generation,
                        nodes = node_count,
                        placed,
                        complete = hydrated.complete,
                        watermark = hydrated.watermark,
                        "Rebuilt partition"
                    );
                    break Ok(generation);
                }
                Err(err) if err.is_conflict() && attempt < self.config.max_commit_retries => {
                    attempt += 1;
                    warn!(tree = %self.tree, attempt, error = %err, "Rebuild conflicted; retrying");
                }
                Err(err) => break Err(err),
            }
        };

        histogram!(METRIC_REBUILD_MS, "tree" => self.tree.as_str())
            .record(started_at.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(generation) => {
                self.set_status(PartitionStatus::Ready { generation });
                if let Some(persister) = &self.persister {
                    persister.request(self.store.acquire_snapshot(), self.pipeline.watermark());
                }
                Ok(generation)
            }
            Err(CacheError::Cancelled) => {
                let status = match previous {
                    PartitionStatus::Ready { .. } => PartitionStatus::Ready {
                        generation: self.store.head(),
                    },
                    _ => PartitionStatus::Uninitialized,
                };
                info!(tree = %self.tree, "Rebuild cancelled");
                self.set_status(status);
                Err(CacheError::Cancelled)
            }
            Err(err) => {
                self.warnings.report(CacheWarning {
                    tree: self.tree,
                    node_id: None,
                    source_version: None,
                    kind: WarningKind::RepositoryFailure,
                    message: format!("rebuild failed: {err}"),
                });
                self.set_status(PartitionStatus::Failed {
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn hydrate(&self, cancel: &CancellationToken) -> Result<Hydrated, CacheError> {
        let seed_count = self.config.seed_count(self.tree);
        let watermark = self.repository.log_version(self.tree).await?;
        let provider = RepositoryRoots::new(
            Arc::clone(&self.repository),
            self.tree,
            self.config.children_page_size_non_zero().get(),
        );
        let outline = load_outline(&provider, None, cancel).await?;
        let keys: Vec<SeedKey> = seed_keys(&outline, seed_count, cancel.clone()).await?;

        let mut accepted: HashSet<NodeId> = HashSet::with_capacity(keys.len());
        let mut nodes = Vec::with_capacity(keys.len());
        let batch_size = self.config.kit_batch_size_non_zero().get();

        for batch in keys.chunks(batch_size) {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            let ids: Vec<NodeId> = batch.iter().map(|key| key.id).collect();
            let sources = self.repository.load_nodes(self.tree, &ids).await?;

            for source in sources {
                let id = source.id;
                let node = match ContentNode::from_source(source) {
                    Ok(node) => node,
                    Err(err) => {
                        warn!(tree = %self.tree, node_id = %id, error = %err, "Skipping invalid node");
                        continue;
                    }
                };
                if let Some(parent) = node.parent_id()
                    && !outline.contains(parent)
                {
                    warn!(
                        tree = %self.tree,
                        node_id = %id,
                        parent_id = %parent,
                        "Skipping node whose parent is not in the tree"
                    );
                    continue;
                }
                accepted.insert(id);
                nodes.push(node);
            }
        }

        let complete = outline
            .entries()
            .iter()
            .all(|entry| accepted.contains(&entry.id));
        Ok(Hydrated {
            outline: outline.entries().to_vec(),
            nodes,
            complete,
            watermark,
        })
    }

    /// Discards the local file and rebuilds from the repository.
    ///
    /// Readers keep the old tree until the rebuilt one is published. If the
    /// rebuild does not complete the store is emptied.
    pub async fn clear_memory_cache(&self, cancel: CancellationToken) -> Result<GenId, CacheError> {
        if let Some(persistence) = &self.persistence
            && let Err(err) = persistence.discard().await
        {
            warn!(tree = %self.tree, error = %err, "Could not discard local cache file");
        }
        self.pipeline.reset().await;

        match self.rebuild(cancel).await {
            Ok(generation) => Ok(generation),
            Err(err) => {
                if let Err(reset_err) = self.store.reset() {
                    warn!(tree = %self.tree, error = %reset_err, "Could not empty the store");
                }
                self.complete.store(false, Ordering::Release);
                if matches!(err, CacheError::Cancelled) {
                    self.set_status(PartitionStatus::Uninitialized);
                }
                Err(err)
            }
        }
    }

    /// Reads one node, going to the repository while the partition is not
    /// ready or when the node is placed but its content was never loaded.
    /// A node missing from the tree outline is not in the published tree.
    pub async fn get_node(&self, id: NodeId) -> Result<Option<Arc<ContentNode>>, CacheError> {
        if self.status().is_ready() {
            let snapshot = self.store.acquire_snapshot();
            if let Some(node) = snapshot.get(id) {
                return Ok(Some(node));
            }
            if self.is_complete() || snapshot.entry(id).is_none() {
                return Ok(None);
            }
        }

        let Some(source) = self.repository.load_node(self.tree, id).await? else {
            return Ok(None);
        };
        Ok(Some(Arc::new(ContentNode::from_source(source)?)))
    }

    /// Starts consuming the notification channel. Returns `None` when the
    /// pipeline is already running.
    pub fn spawn_pipeline(&self, cancel: CancellationToken) -> Option<JoinHandle<usize>> {
        let receiver = mutex_lock(&self.receiver, SOURCE, "spawn_pipeline").take()?;
        let pipeline = Arc::clone(&self.pipeline);
        Some(tokio::spawn(
            async move { pipeline.run(receiver, cancel).await },
        ))
    }

    /// Stops the background persister and waits for its last save.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = mutex_lock(&self.persister_task, SOURCE, "shutdown").take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!(tree = %self.tree, error = %err, "Persister task did not stop cleanly");
        }
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Hydrated {
    outline: Vec<OutlineEntry>,
    nodes: Vec<ContentNode>,
    complete: bool,
    watermark: SourceVersion,
}
