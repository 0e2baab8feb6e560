//! Breadth-first seed key selection.
//!
//! A rebuild reads the whole tree shape into a [`TreeOutline`] but eagerly
//! loads content only for the first `seed_count` nodes in breadth-first
//! order; everything else is read through on demand. The traversal is written
//! once against [`RootProvider`] and works the same over the repository, an
//! outline and a cached snapshot.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use metrics::counter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::repos::{ChildEntry, ContentRepository};
use crate::domain::content::{NodeId, TreeKind};

use super::error::CacheError;
use super::navigation::OutlineEntry;
use super::snapshot::Snapshot;

const METRIC_SEED_KEYS_TOTAL: &str = "canopy_seed_keys_total";

/// A node selected for eager loading and its distance from the roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SeedKey {
    pub id: NodeId,
    pub depth: u32,
}

/// Tree shape needed by the seeding traversal.
#[async_trait]
pub trait RootProvider: Send + Sync {
    fn tree(&self) -> TreeKind;

    async fn roots(&self) -> Result<Vec<NodeId>, CacheError>;

    async fn children(&self, parent: NodeId) -> Result<Vec<NodeId>, CacheError>;
}

/// Repository-backed tree shape, paging through child listings.
pub struct RepositoryRoots {
    repository: Arc<dyn ContentRepository>,
    tree: TreeKind,
    page_size: usize,
}

impl RepositoryRoots {
    pub fn new(repository: Arc<dyn ContentRepository>, tree: TreeKind, page_size: usize) -> Self {
        Self {
            repository,
            tree,
            page_size: page_size.max(1),
        }
    }

    /// Every child of `parent` in tree order, paging through the listing.
    pub async fn child_entries(
        &self,
        parent: Option<NodeId>,
    ) -> Result<Vec<ChildEntry>, CacheError> {
        let mut out = Vec::new();
        loop {
            let page = self
                .repository
                .load_children_page(self.tree, parent, out.len(), self.page_size)
                .await?;
            let received = page.items.len();
            out.extend(page.items);
            if !page.has_more || received == 0 {
                return Ok(out);
            }
        }
    }
}

#[async_trait]
impl RootProvider for RepositoryRoots {
    fn tree(&self) -> TreeKind {
        self.tree
    }

    async fn roots(&self) -> Result<Vec<NodeId>, CacheError> {
        let entries = self.child_entries(None).await?;
        Ok(entries.into_iter().map(|child| child.id).collect())
    }

    async fn children(&self, parent: NodeId) -> Result<Vec<NodeId>, CacheError> {
        let entries = self.child_entries(Some(parent)).await?;
        Ok(entries.into_iter().map(|child| child.id).collect())
    }
}

/// Tree shape read from the repository, parents before children.
#[derive(Debug)]
pub struct TreeOutline {
    tree: TreeKind,
    entries: Vec<OutlineEntry>,
    children: HashMap<Option<NodeId>, Vec<NodeId>>,
}

impl TreeOutline {
    pub fn entries(&self) -> &[OutlineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the walk reached `id`, the node it started below included.
    pub fn contains(&self, id: NodeId) -> bool {
        self.children.contains_key(&Some(id))
    }

    fn listed(&self, parent: Option<NodeId>) -> Vec<NodeId> {
        self.children.get(&parent).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl RootProvider for TreeOutline {
    fn tree(&self) -> TreeKind {
        self.tree
    }

    async fn roots(&self) -> Result<Vec<NodeId>, CacheError> {
        Ok(self.listed(None))
    }

    async fn children(&self, parent: NodeId) -> Result<Vec<NodeId>, CacheError> {
        Ok(self.listed(Some(parent)))
    }
}

/// Walks the repository breadth first below `below` (`None` for the whole
/// tree) and records every node's position.
///
/// A node listed twice keeps its first position. Returns
/// [`CacheError::Cancelled`] once `cancel` fires.
pub async fn load_outline(
    provider: &RepositoryRoots,
    below: Option<NodeId>,
    cancel: &CancellationToken,
) -> Result<TreeOutline, CacheError> {
    let mut outline = TreeOutline {
        tree: provider.tree,
        entries: Vec::new(),
        children: HashMap::new(),
    };
    let mut seen: HashSet<NodeId> = below.into_iter().collect();
    let mut queue = VecDeque::from([below]);

    while let Some(parent) = queue.pop_front() {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let mut listed = Vec::new();
        for child in provider.child_entries(parent).await? {
            if !seen.insert(child.id) {
                continue;
            }
            outline.entries.push(OutlineEntry {
                id: child.id,
                parent_id: parent,
                sort_order: child.sort_order,
            });
            listed.push(child.id);
            queue.push_back(Some(child.id));
        }
        outline.children.insert(parent, listed);
    }

    debug!(
        tree = %provider.tree,
        below = ?below,
        nodes = outline.entries.len(),
        "Tree outline loaded"
    );
    Ok(outline)
}

#[async_trait]
impl RootProvider for Snapshot {
    fn tree(&self) -> TreeKind {
        Snapshot::tree(self)
    }

    async fn roots(&self) -> Result<Vec<NodeId>, CacheError> {
        Ok(Snapshot::roots(self).iter().collect())
    }

    async fn children(&self, parent: NodeId) -> Result<Vec<NodeId>, CacheError> {
        Ok(Snapshot::children(self, parent).iter().collect())
    }
}

/// Streams up to `seed_count` keys breadth first from the roots.
///
/// Ids are emitted at most once, in visitation order. The stream ends after
/// `seed_count` keys or when the tree is exhausted, and yields
/// [`CacheError::Cancelled`] once `cancel` fires.
pub fn seed_stream<'a, P>(
    provider: &'a P,
    seed_count: usize,
    cancel: CancellationToken,
) -> BoxStream<'a, Result<SeedKey, CacheError>>
where
    P: RootProvider + ?Sized,
{
    let stream = stream! {
        if seed_count == 0 {
            return;
        }

        let mut queue: VecDeque<SeedKey> = VecDeque::new();
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut emitted = 0_usize;

        match provider.roots().await {
            Ok(roots) => {
                for id in roots {
                    if seen.insert(id) {
                        queue.push_back(SeedKey { id, depth: 0 });
                    }
                }
            }
            Err(err) => {
                yield Err(err);
                return;
            }
        }

        while let Some(key) = queue.pop_front() {
            if cancel.is_cancelled() {
                yield Err(CacheError::Cancelled);
                return;
            }

            emitted += 1;
            yield Ok(key);
            if emitted >= seed_count {
                return;
            }

            // Keys already queued are emitted before any child of this node.
            if emitted + queue.len() >= seed_count {
                continue;
            }

            match provider.children(key.id).await {
                Ok(children) => {
                    for id in children {
                        if seen.insert(id) {
                            queue.push_back(SeedKey { id, depth: key.depth + 1 });
                        }
                    }
                }
                Err(err) => {
                    yield Err(err);
                    return;
                }
            }
        }
    };

    Box::pin(stream)
}

/// Collects [`seed_stream`] into a vector.
pub async fn seed_keys<P>(
    provider: &P,
    seed_count: usize,
    cancel: CancellationToken,
) -> Result<Vec<SeedKey>, CacheError>
where
    P: RootProvider + ?Sized,
{
    let tree = provider.tree();
    let mut stream = seed_stream(provider, seed_count, cancel);
    let mut keys = Vec::with_capacity(seed_count.min(4096));

    while let Some(key) = stream.next().await {
        match key {
            Ok(key) => keys.push(key),
            Err(err) => {
                debug!(tree = %tree, emitted = keys.len(), error = %err, "Seeding stopped");
                return Err(err);
            }
        }
    }

    counter!(METRIC_SEED_KEYS_TOTAL, "tree" => tree.as_str()).increment(keys.len() as u64);
    info!(tree = %tree, seed_count, emitted = keys.len(), "Seed keys selected");
    Ok(keys)
}
