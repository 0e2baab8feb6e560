//! Generational node store.
//!
//! A [`GenerationStore`] holds every live generation of one content tree at
//! once. Values are kept in per-key version chains ([`VersionedMap`]); a
//! generation is just a number plus a pin count, so publishing a commit costs
//! one link per changed key and a pointer swap.
//!
//! Readers pin a generation through [`GenerationStore::acquire_snapshot`] and
//! never wait on writers beyond the brief shared read of the head pointer.
//! Writers are serialised by the commit mutex. At the end of every commit the
//! collector drops generations that are neither the head nor pinned and trims
//! the chains of the keys those generations touched.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::content::{ContentNode, NodeId, TreeKind};

use super::error::CacheError;
use super::lock::{mutex_lock, rw_read, rw_write};
use super::navigation::{NavigationEntry, OutlineEntry};
use super::planner::{CommitPlan, CommitPlanner};
use super::snapshot::Snapshot;
use super::versioned::VersionedMap;

const SOURCE: &str = "cache::generation";

const METRIC_COMMIT_TOTAL: &str = "canopy_commit_total";
const METRIC_COMMIT_CONFLICT_TOTAL: &str = "canopy_commit_conflict_total";
const METRIC_COMMIT_MS: &str = "canopy_commit_ms";
const METRIC_GC_COLLECTED_TOTAL: &str = "canopy_gc_collected_total";
const METRIC_GENERATIONS_LIVE: &str = "canopy_generations_live";

/// Monotonic generation number. Generation 0 is the empty initial tree.
pub type GenId = u64;

/// One staged node change; `None` removes the node and its subtree.
pub type NodeChange = (NodeId, Option<ContentNode>);

/// One staged write of a commit.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeChange {
    /// Upserts or removes a node, as a [`NodeChange`] does.
    Node(NodeId, Option<ContentNode>),
    /// Places a node in the tree without its content. An existing node whose
    /// position disagrees with the entry is dropped to the outline.
    Outline(OutlineEntry),
}

impl From<NodeChange> for TreeChange {
    fn from((id, node): NodeChange) -> Self {
        TreeChange::Node(id, node)
    }
}

/// Published generation plus the number of snapshots pinning it.
#[derive(Debug)]
pub(crate) struct GenerationRecord {
    generation: GenId,
    pins: AtomicUsize,
}

impl GenerationRecord {
    fn new(generation: GenId) -> Self {
        Self {
            generation,
            pins: AtomicUsize::new(0),
        }
    }

    pub(crate) fn generation(&self) -> GenId {
        self.generation
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }

    fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }
}

/// Key of any versioned map, recorded per generation for trimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TouchedKey {
    Node(NodeId),
    Navigation(NodeId),
    Roots,
    Key(Uuid),
}

#[derive(Debug, Default)]
struct WriterState {
    /// Generations still observable, oldest first. The head is always last.
    live: VecDeque<Arc<GenerationRecord>>,
    /// Keys written by each published generation, oldest first.
    pending_trim: VecDeque<(GenId, Vec<TouchedKey>)>,
}

/// Outcome of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub collected: usize,
    pub released_links: usize,
    pub floor: GenId,
}

pub struct GenerationStore {
    tree: TreeKind,
    nodes: VersionedMap<NodeId, ContentNode>,
    keys: VersionedMap<Uuid, NodeId>,
    navigation: VersionedMap<NodeId, NavigationEntry>,
    roots: VersionedMap<(), [NodeId]>,
    head: RwLock<Arc<GenerationRecord>>,
    writer: Mutex<WriterState>,
}

impl GenerationStore {
    pub fn new(tree: TreeKind) -> Self {
        let initial = Arc::new(GenerationRecord::new(0));
        Self {
            tree,
            nodes: VersionedMap::new(),
            keys: VersionedMap::new(),
            navigation: VersionedMap::new(),
            roots: VersionedMap::new(),
            head: RwLock::new(Arc::clone(&initial)),
            writer: Mutex::new(WriterState {
                live: VecDeque::from([initial]),
                pending_trim: VecDeque::new(),
            }),
        }
    }

    pub fn tree(&self) -> TreeKind {
        self.tree
    }

    /// Newest published generation.
    pub fn head(&self) -> GenId {
        rw_read(&self.head, SOURCE, "head").generation
    }

    /// Pins the head generation.
    ///
    /// The pin is taken while the head pointer is read-locked, so the
    /// generation cannot be collected between the read and the pin.
    pub fn acquire_snapshot(self: &Arc<Self>) -> Snapshot {
        let record = {
            let head = rw_read(&self.head, SOURCE, "acquire_snapshot");
            head.pin();
            Arc::clone(&head)
        };
        Snapshot::pinned(Arc::clone(self), record)
    }

    pub fn get(&self, generation: GenId, id: NodeId) -> Option<Arc<ContentNode>> {
        self.nodes.get(generation, &id)
    }

    pub fn get_by_key(&self, generation: GenId, key: Uuid) -> Option<Arc<ContentNode>> {
        let id = self.keys.get(generation, &key)?;
        self.nodes.get(generation, &id)
    }

    pub(crate) fn nav_entry(
        &self,
        generation: GenId,
        id: NodeId,
    ) -> Option<Arc<NavigationEntry>> {
        self.navigation.get(generation, &id)
    }

    pub(crate) fn root_ids(&self, generation: GenId) -> Option<Arc<[NodeId]>> {
        self.roots.get(generation, &())
    }

    /// Publishes `changes` as generation `base + 1`.
    ///
    /// Fails with [`CacheError::ConcurrentCommitConflict`] when `base` is no
    /// longer the head. Navigation patches are derived from the changes, and
    /// a rejected batch publishes nothing. An empty batch still advances the
    /// generation.
    pub fn commit(&self, base: GenId, changes: Vec<NodeChange>) -> Result<GenId, CacheError> {
        self.commit_tree(base, changes.into_iter().map(TreeChange::from).collect())
    }

    /// [`commit`](Self::commit) for a batch that may also carry outline
    /// entries.
    #[instrument(skip(self, changes), fields(tree = %self.tree, changes = changes.len()))]
    pub fn commit_tree(&self, base: GenId, changes: Vec<TreeChange>) -> Result<GenId, CacheError> {
        let started_at = Instant::now();
        let mut writer = mutex_lock(&self.writer, SOURCE, "commit");

        let head = self.head();
        if base != head {
            counter!(METRIC_COMMIT_CONFLICT_TOTAL, "tree" => self.tree.as_str()).increment(1);
            debug!(base, head, "Commit rejected: base is not the head");
            return Err(CacheError::ConcurrentCommitConflict { base, head });
        }

        let plan = CommitPlanner::plan(self, head, changes)?;
        let generation = self.publish_locked(&mut writer, head + 1, plan);
        self.collect_locked(&mut writer);

        histogram!(METRIC_COMMIT_MS, "tree" => self.tree.as_str())
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
        Ok(generation)
    }

    /// Publishes `changes` at `generation`, or at `head + 1` when the store
    /// has already moved past it.
    ///
    /// Used to restore a persisted generation so that the store continues
    /// numbering from where the saved tree left off.
    #[instrument(skip(self, changes), fields(tree = %self.tree, changes = changes.len()))]
    pub fn install(
        &self,
        generation: GenId,
        changes: Vec<TreeChange>,
    ) -> Result<GenId, CacheError> {
        let mut writer = mutex_lock(&self.writer, SOURCE, "install");

        let head = self.head();
        let target = generation.max(head + 1);
        let plan = CommitPlanner::plan(self, head, changes)?;
        let published = self.publish_locked(&mut writer, target, plan);
        self.collect_locked(&mut writer);

        info!(requested = generation, generation = published, "Installed generation");
        Ok(published)
    }

    /// Removes every node by committing tombstones for all roots.
    ///
    /// Pinned snapshots keep seeing their trees until released.
    pub fn reset(&self) -> Result<GenId, CacheError> {
        let mut writer = mutex_lock(&self.writer, SOURCE, "reset");

        let head = self.head();
        let changes: Vec<TreeChange> = self
            .root_ids(head)
            .map(|roots| roots.iter().map(|id| TreeChange::Node(*id, None)).collect())
            .unwrap_or_default();
        let removed_roots = changes.len();

        let plan = CommitPlanner::plan(self, head, changes)?;
        let generation = self.publish_locked(&mut writer, head + 1, plan);
        self.collect_locked(&mut writer);

        info!(tree = %self.tree, generation, removed_roots, "Reset generation store");
        Ok(generation)
    }

    /// Runs a collection pass outside of a commit.
    pub fn gc(&self) -> GcReport {
        let mut writer = mutex_lock(&self.writer, SOURCE, "gc");
        self.collect_locked(&mut writer)
    }

    /// Number of generations still observable, head included.
    pub fn generation_count(&self) -> usize {
        mutex_lock(&self.writer, SOURCE, "generation_count").live.len()
    }

    pub fn pinned_count(&self) -> usize {
        mutex_lock(&self.writer, SOURCE, "pinned_count")
            .live
            .iter()
            .filter(|record| record.is_pinned())
            .count()
    }

    /// Nodes present in the head generation.
    pub fn node_count(&self) -> usize {
        self.node_count_at(self.head())
    }

    /// Nodes holding content at `generation`. Outline-only entries are not
    /// counted.
    pub fn node_count_at(&self, generation: GenId) -> usize {
        self.nodes.count_at(generation)
    }

    /// Keys currently holding a version chain, tombstones included.
    pub fn chain_count(&self) -> usize {
        self.nodes.chain_count()
    }

    fn publish_locked(
        &self,
        writer: &mut WriterState,
        generation: GenId,
        plan: CommitPlan,
    ) -> GenId {
        let mut touched = Vec::with_capacity(
            plan.nodes.len() + plan.navigation.len() + plan.keys.len() + 1,
        );
        let node_count = plan.nodes.len();
        let summary = plan.to_string();

        for (id, node) in plan.nodes {
            self.nodes.set(generation, id, node);
            touched.push(TouchedKey::Node(id));
        }
        for (id, entry) in plan.navigation {
            self.navigation.set(generation, id, entry);
            touched.push(TouchedKey::Navigation(id));
        }
        if let Some(roots) = plan.roots {
            self.roots.set(generation, (), Some(roots));
            touched.push(TouchedKey::Roots);
        }
        for (key, id) in plan.keys {
            self.keys.set(generation, key, id);
            touched.push(TouchedKey::Key(key));
        }

        let record = Arc::new(GenerationRecord::new(generation));
        *rw_write(&self.head, SOURCE, "publish") = Arc::clone(&record);
        writer.live.push_back(record);
        writer.pending_trim.push_back((generation, touched));

        counter!(METRIC_COMMIT_TOTAL, "tree" => self.tree.as_str()).increment(1);
        debug!(
            tree = %self.tree,
            generation,
            node_changes = node_count,
            plan = %summary,
            "Published generation"
        );
        generation
    }

    fn collect_locked(&self, writer: &mut WriterState) -> GcReport {
        let head = self.head();
        let before = writer.live.len();
        writer
            .live
            .retain(|record| record.generation == head || record.is_pinned());
        let collected = before - writer.live.len();
        let floor = writer
            .live
            .front()
            .map_or(head, |record| record.generation);

        let mut released_links = 0;
        while writer
            .pending_trim
            .front()
            .is_some_and(|(generation, _)| *generation <= floor)
        {
            let Some((_, touched)) = writer.pending_trim.pop_front() else {
                break;
            };
            for key in touched {
                released_links += match key {
                    TouchedKey::Node(id) => self.nodes.trim(&id, floor),
                    TouchedKey::Navigation(id) => self.navigation.trim(&id, floor),
                    TouchedKey::Roots => self.roots.trim(&(), floor),
                    TouchedKey::Key(key) => self.keys.trim(&key, floor),
                };
            }
        }

        gauge!(METRIC_GENERATIONS_LIVE, "tree" => self.tree.as_str())
            .set(writer.live.len() as f64);
        if collected > 0 {
            counter!(METRIC_GC_COLLECTED_TOTAL, "tree" => self.tree.as_str())
                .increment(collected as u64);
            debug!(
                tree = %self.tree,
                collected,
                released_links,
                floor,
                live = writer.live.len(),
                "Collected generations"
            );
        }

        GcReport {
            collected,
            released_links,
            floor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::content::test_support::node;

    fn tree() -> Arc<GenerationStore> {
        let store = Arc::new(GenerationStore::new(TreeKind::Document));
        store
            .commit(
                0,
                vec![
                    (NodeId(1), Some(node(1, None, 0))),
                    (NodeId(2), Some(node(2, Some(1), 0))),
                    (NodeId(3), Some(node(3, Some(1), 1))),
                ],
            )
            .expect("seed commit");
        store
    }

    #[test]
    fn commit_advances_head_and_exposes_nodes() {
        let store = tree();

        assert_eq!(store.head(), 1);
        assert_eq!(store.node_count(), 3);
        assert!(store.get(0, NodeId(1)).is_none());
        assert_eq!(store.get(1, NodeId(2)).map(|n| n.id()), Some(NodeId(2)));
    }

    #[test]
    fn stale_base_is_a_conflict() {
        let store = tree();
        store.commit(1, Vec::new()).expect("empty commit");

        let err = store
            .commit(1, vec![(NodeId(4), Some(node(4, None, 2)))])
            .unwrap_err();

        assert!(matches!(
            err,
            CacheError::ConcurrentCommitConflict { base: 1, head: 2 }
        ));
        assert!(store.get(store.head(), NodeId(4)).is_none());
    }

    #[test]
    fn empty_commit_advances_generation() {
        let store = tree();
        assert_eq!(store.commit(1, Vec::new()).expect("commit"), 2);
        assert_eq!(store.head(), 2);
    }

    #[test]
    fn failed_commit_publishes_nothing() {
        let store = tree();

        let err = store
            .commit(
                1,
                vec![
                    (NodeId(5), Some(node(5, Some(1), 3))),
                    (NodeId(6), Some(node(6, Some(404), 0))),
                ],
            )
            .unwrap_err();

        assert!(matches!(err, CacheError::MissingParent { .. }));
        assert_eq!(store.head(), 1);
        assert!(store.get(2, NodeId(5)).is_none());
    }

    #[test]
    fn get_by_key_follows_generation() {
        let store = tree();
        let pinned = store.acquire_snapshot();
        let key = store.get(1, NodeId(2)).expect("node").key();

        store.commit(1, vec![(NodeId(2), None)]).expect("delete");

        assert_eq!(pinned.get_by_key(key).map(|n| n.id()), Some(NodeId(2)));
        assert_eq!(store.get_by_key(1, key).map(|n| n.id()), Some(NodeId(2)));
        assert!(store.get_by_key(2, key).is_none());
    }

    #[test]
    fn unpinned_generations_are_collected() {
        let store = tree();
        for base in 1..5 {
            store
                .commit(base, vec![(NodeId(3), Some(node(3, Some(1), base as i32)))])
                .expect("commit");
        }

        assert_eq!(store.generation_count(), 1);
        assert_eq!(store.pinned_count(), 0);
        assert_eq!(store.nodes.link_count(&NodeId(3)), 1);
    }

    #[test]
    fn pinned_generation_survives_collection() {
        let store = tree();
        let snapshot = store.acquire_snapshot();

        store.commit(1, vec![(NodeId(2), None)]).expect("delete");
        store.commit(2, Vec::new()).expect("empty");

        assert_eq!(store.generation_count(), 2);
        assert_eq!(store.pinned_count(), 1);
        assert!(snapshot.get(NodeId(2)).is_some());

        drop(snapshot);
        let report = store.gc();

        assert_eq!(report.collected, 1);
        assert_eq!(report.floor, 3);
        assert_eq!(store.generation_count(), 1);
        assert_eq!(store.nodes.link_count(&NodeId(2)), 0);
    }

    #[test]
    fn install_continues_from_requested_generation() {
        let store = GenerationStore::new(TreeKind::Media);

        let generation = store
            .install(
                41,
                vec![
                    TreeChange::Node(NodeId(1), Some(node(1, None, 0))),
                    TreeChange::Outline(OutlineEntry {
                        id: NodeId(2),
                        parent_id: Some(NodeId(1)),
                        sort_order: 0,
                    }),
                ],
            )
            .expect("install");

        assert_eq!(generation, 41);
        assert_eq!(store.head(), 41);
        assert_eq!(store.node_count(), 1);
        assert!(store.get(41, NodeId(2)).is_none());
        assert_eq!(
            store.nav_entry(41, NodeId(1)).map(|entry| entry.children.len()),
            Some(1)
        );
        assert_eq!(store.commit(41, Vec::new()).expect("commit"), 42);
    }

    #[test]
    fn reset_keeps_pinned_snapshot_readable() {
        let store = tree();
        let snapshot = store.acquire_snapshot();

        let generation = store.reset().expect("reset");

        assert_eq!(generation, 2);
        assert_eq!(store.node_count(), 0);
        assert_eq!(snapshot.children(NodeId(1)).len(), 2);
    }
}
