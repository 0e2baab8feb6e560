//! Pinned, read-only views of one generation.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::domain::content::{ContentNode, NodeId, TreeKind};

use super::generation::{GenId, GenerationRecord, GenerationStore};
use super::navigation::{self, Children, NavigationEntry, OutlineEntry};

/// A consistent view of the tree as of one generation.
///
/// Every read through a snapshot observes the same generation regardless of
/// commits published after it was acquired. The generation stays pinned until
/// the snapshot (and every clone of it) is dropped.
pub struct Snapshot {
    store: Arc<GenerationStore>,
    record: Arc<GenerationRecord>,
}

impl Snapshot {
    /// Wraps a record whose pin the caller has already taken.
    pub(crate) fn pinned(store: Arc<GenerationStore>, record: Arc<GenerationRecord>) -> Self {
        Self { store, record }
    }

    pub fn generation(&self) -> GenId {
        self.record.generation()
    }

    pub fn tree(&self) -> TreeKind {
        self.store.tree()
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<ContentNode>> {
        self.store.get(self.generation(), id)
    }

    pub fn get_by_key(&self, key: Uuid) -> Option<Arc<ContentNode>> {
        self.store.get_by_key(self.generation(), key)
    }

    pub fn children(&self, parent: NodeId) -> Children {
        navigation::children(&self.store, self.generation(), parent)
    }

    pub fn roots(&self) -> Children {
        navigation::roots(&self.store, self.generation())
    }

    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        navigation::ancestors(&self.store, self.generation(), id)
    }

    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        navigation::descendants(&self.store, self.generation(), id)
    }

    pub fn entry(&self, id: NodeId) -> Option<NavigationEntry> {
        navigation::entry(&self.store, self.generation(), id)
    }

    /// Every loaded node of the generation, parents before children.
    pub fn iter_all(&self) -> impl Iterator<Item = Arc<ContentNode>> + '_ {
        navigation::breadth_first(&self.store, self.generation())
            .into_iter()
            .filter_map(|id| self.get(id))
    }

    /// Every placed node, parents before children, with its content when it
    /// has been loaded.
    pub fn iter_outline(
        &self,
    ) -> impl Iterator<Item = (OutlineEntry, Option<Arc<ContentNode>>)> + '_ {
        navigation::breadth_first(&self.store, self.generation())
            .into_iter()
            .filter_map(|id| {
                let entry = self.store.nav_entry(self.generation(), id)?;
                let outline = OutlineEntry {
                    id,
                    parent_id: entry.parent_id,
                    sort_order: entry.sort_order,
                };
                Some((outline, self.get(id)))
            })
    }

    /// Nodes with loaded content. Outline-only nodes are not counted.
    pub fn node_count(&self) -> usize {
        self.store.node_count_at(self.generation())
    }

    pub fn store(&self) -> &Arc<GenerationStore> {
        &self.store
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        self.record.pin();
        Self {
            store: Arc::clone(&self.store),
            record: Arc::clone(&self.record),
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.record.unpin();
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("tree", &self.tree())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::generation::TreeChange;
    use crate::domain::content::test_support::node;

    fn seeded() -> Arc<GenerationStore> {
        let store = Arc::new(GenerationStore::new(TreeKind::Document));
        store
            .commit(
                0,
                vec![
                    (NodeId(1), Some(node(1, None, 0))),
                    (NodeId(2), Some(node(2, Some(1), 0))),
                    (NodeId(3), Some(node(3, Some(2), 0))),
                ],
            )
            .expect("seed");
        store
    }

    #[test]
    fn snapshot_ignores_later_commits() {
        let store = seeded();
        let before = store.acquire_snapshot();

        store
            .commit(1, vec![(NodeId(4), Some(node(4, Some(1), 1)))])
            .expect("add");
        let after = store.acquire_snapshot();

        assert_eq!(before.generation(), 1);
        assert!(before.get(NodeId(4)).is_none());
        assert_eq!(before.children(NodeId(1)).len(), 1);
        assert_eq!(after.children(NodeId(1)).len(), 2);
    }

    #[test]
    fn clones_share_one_generation_and_keep_it_pinned() {
        let store = seeded();
        let first = store.acquire_snapshot();
        let second = first.clone();
        drop(first);

        store.commit(1, vec![(NodeId(3), None)]).expect("delete");

        assert_eq!(store.pinned_count(), 1);
        assert!(second.get(NodeId(3)).is_some());
        drop(second);
        assert_eq!(store.pinned_count(), 0);
    }

    #[test]
    fn iter_all_visits_parents_first() {
        let store = seeded();
        let snapshot = store.acquire_snapshot();

        let order: Vec<u64> = snapshot.iter_all().map(|node| node.id().0).collect();

        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(snapshot.node_count(), 3);
        assert_eq!(snapshot.ancestors(NodeId(3)), vec![NodeId(1), NodeId(2)]);
        assert_eq!(format!("{snapshot:?}"), "Snapshot { tree: Document, generation: 1 }");
    }

    #[test]
    fn outline_only_nodes_are_navigable_but_not_counted() {
        let store = seeded();
        store
            .commit_tree(
                1,
                vec![TreeChange::Outline(OutlineEntry {
                    id: NodeId(4),
                    parent_id: Some(NodeId(1)),
                    sort_order: 1,
                })],
            )
            .expect("outline");
        let snapshot = store.acquire_snapshot();

        assert_eq!(snapshot.children(NodeId(1)).as_slice(), &[NodeId(2), NodeId(4)]);
        assert!(snapshot.get(NodeId(4)).is_none());
        assert_eq!(snapshot.node_count(), 3);
        assert_eq!(snapshot.iter_all().count(), 3);
        let placed: Vec<(u64, bool)> = snapshot
            .iter_outline()
            .map(|(entry, node)| (entry.id.0, node.is_some()))
            .collect();
        assert_eq!(placed, vec![(1, true), (2, true), (4, false), (3, true)]);
    }
}
