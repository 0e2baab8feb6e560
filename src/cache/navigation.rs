//! Tree navigation over a pinned generation.
//!
//! Navigation entries are versioned in the same store as the nodes and are
//! derived from node `parent_id`s inside every commit, so the tree shape of a
//! generation always agrees with the nodes it holds. Nodes whose content was
//! never loaded still have an entry, placed from an [`OutlineEntry`].
//! Children are ordered by `(sort_order, id)`.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::domain::content::NodeId;

use super::error::CacheError;
use super::generation::{GenId, GenerationStore, TreeChange};

/// Position of a node in the tree, known without its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutlineEntry {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub sort_order: i32,
}

/// Tree position of one node within a generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationEntry {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub sort_order: i32,
    pub children: Children,
}

/// Ordered child ids of a node.
///
/// Cheap to clone and restartable: `iter()` can be called any number of times
/// and always yields the same finite sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Children {
    ids: Arc<[NodeId]>,
}

impl Children {
    pub(crate) fn from_shared(ids: Arc<[NodeId]>) -> Self {
        Self { ids }
    }

    pub fn iter(&self) -> std::iter::Copied<std::slice::Iter<'_, NodeId>> {
        self.ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn as_slice(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.ids.iter().position(|child| *child == id)
    }
}

impl<'a> IntoIterator for &'a Children {
    type Item = NodeId;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, NodeId>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl From<Vec<NodeId>> for Children {
    fn from(ids: Vec<NodeId>) -> Self {
        Self { ids: ids.into() }
    }
}

pub fn entry(store: &GenerationStore, generation: GenId, id: NodeId) -> Option<NavigationEntry> {
    store
        .nav_entry(generation, id)
        .map(|entry| entry.as_ref().clone())
}

pub fn children(store: &GenerationStore, generation: GenId, parent: NodeId) -> Children {
    store
        .nav_entry(generation, parent)
        .map(|entry| entry.children.clone())
        .unwrap_or_default()
}

pub fn roots(store: &GenerationStore, generation: GenId) -> Children {
    store
        .root_ids(generation)
        .map(Children::from_shared)
        .unwrap_or_default()
}

/// Ancestor ids of `id`, root first. Empty for roots and unknown nodes.
pub fn ancestors(store: &GenerationStore, generation: GenId, id: NodeId) -> Vec<NodeId> {
    let mut chain = Vec::new();
    let mut seen = HashSet::from([id]);
    let mut cursor = store
        .nav_entry(generation, id)
        .and_then(|entry| entry.parent_id);

    while let Some(parent) = cursor {
        if !seen.insert(parent) {
            break;
        }
        chain.push(parent);
        cursor = store
            .nav_entry(generation, parent)
            .and_then(|entry| entry.parent_id);
    }

    chain.reverse();
    chain
}

/// Every node below `id`, breadth first. `id` itself is not included.
pub fn descendants(store: &GenerationStore, generation: GenId, id: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut queue = VecDeque::from([id]);
    while let Some(current) = queue.pop_front() {
        for child in &children(store, generation, current) {
            out.push(child);
            queue.push_back(child);
        }
    }
    out
}

/// All nodes of the generation breadth first from the roots, parents before
/// children.
pub fn breadth_first(store: &GenerationStore, generation: GenId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut queue: VecDeque<NodeId> = roots(store, generation).iter().collect();
    while let Some(current) = queue.pop_front() {
        out.push(current);
        queue.extend(children(store, generation, current).iter());
    }
    out
}

/// Moves `id` under `new_parent` at `position` among its new siblings.
///
/// `position` is clamped to the sibling count. Siblings at both the old and
/// the new parent are renumbered to their index, and the node, the renumbered
/// siblings and the navigation changes all land in a single commit based on
/// `base`. Nodes known only by their outline are moved and renumbered the
/// same way.
pub fn move_subtree(
    store: &GenerationStore,
    base: GenId,
    id: NodeId,
    new_parent: Option<NodeId>,
    position: usize,
) -> Result<GenId, CacheError> {
    let placed = store.nav_entry(base, id).ok_or(CacheError::NodeNotFound {
        id,
        generation: base,
    })?;

    if let Some(parent) = new_parent {
        if parent == id || ancestors(store, base, parent).contains(&id) {
            return Err(CacheError::CyclicMove { id, parent });
        }
        if store.nav_entry(base, parent).is_none() {
            return Err(CacheError::MissingParent { id, parent });
        }
    }

    let sibling_ids = |parent: Option<NodeId>| -> Vec<NodeId> {
        let list = match parent {
            Some(parent) => children(store, base, parent),
            None => roots(store, base),
        };
        list.iter().filter(|child| *child != id).collect()
    };

    let mut target = sibling_ids(new_parent);
    let position = position.min(target.len());
    target.insert(position, id);

    let mut changes: Vec<TreeChange> = Vec::with_capacity(target.len() + 1);
    renumber(store, base, &target, Some((id, new_parent)), &mut changes);

    let old_parent = placed.parent_id;
    if old_parent != new_parent {
        let remaining = sibling_ids(old_parent);
        renumber(store, base, &remaining, None, &mut changes);
    }

    debug!(
        tree = %store.tree(),
        node_id = %id,
        old_parent = ?old_parent,
        new_parent = ?new_parent,
        position,
        changes = changes.len(),
        "Moving subtree"
    );
    store.commit_tree(base, changes)
}

/// Stages `ordered` with sort orders matching their index. `moved` names the
/// node being reparented, which is always rewritten.
fn renumber(
    store: &GenerationStore,
    base: GenId,
    ordered: &[NodeId],
    moved: Option<(NodeId, Option<NodeId>)>,
    changes: &mut Vec<TreeChange>,
) {
    for (index, sibling) in ordered.iter().copied().enumerate() {
        let sort_order = i32::try_from(index).unwrap_or(i32::MAX);
        let new_parent = moved
            .filter(|(moved_id, _)| *moved_id == sibling)
            .map(|(_, parent)| parent);

        if let Some(current) = store.get(base, sibling) {
            if new_parent.is_none() && current.sort_order() == sort_order {
                continue;
            }
            let updated = match new_parent {
                Some(parent) => current.with_parent(parent),
                None => current.as_ref().clone(),
            };
            changes.push(TreeChange::Node(
                sibling,
                Some(updated.with_sort_order(sort_order)),
            ));
        } else if let Some(entry) = store.nav_entry(base, sibling) {
            if new_parent.is_none() && entry.sort_order == sort_order {
                continue;
            }
            changes.push(TreeChange::Outline(OutlineEntry {
                id: sibling,
                parent_id: new_parent.unwrap_or(entry.parent_id),
                sort_order,
            }));
        }
    }
}
