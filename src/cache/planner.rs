//! Commit planning.
//!
//! Stages a batch of node changes and outline entries on top of a base
//! generation and derives the navigation patches they imply. Nothing is written until the whole batch has
//! been validated, so a rejected commit publishes nothing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::domain::content::{ContentNode, NodeId};

use super::error::CacheError;
use super::generation::{GenId, GenerationStore, TreeChange};
use super::navigation::{Children, NavigationEntry, OutlineEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    parent: Option<NodeId>,
    sort_order: i32,
}

/// Everything one commit writes, keyed per versioned map.
pub(crate) struct CommitPlan {
    pub(crate) nodes: Vec<(NodeId, Option<Arc<ContentNode>>)>,
    pub(crate) navigation: Vec<(NodeId, Option<Arc<NavigationEntry>>)>,
    pub(crate) roots: Option<Arc<[NodeId]>>,
    pub(crate) keys: Vec<(Uuid, Option<Arc<NodeId>>)>,
}

impl fmt::Display for CommitPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tombstones = self.nodes.iter().filter(|(_, node)| node.is_none()).count();
        write!(
            f,
            "CommitPlan {{ nodes: {}, tombstones: {}, navigation: {}, roots_changed: {}, keys: {} }}",
            self.nodes.len(),
            tombstones,
            self.navigation.len(),
            self.roots.is_some(),
            self.keys.len(),
        )
    }
}

/// Overlay of staged changes on top of `base`.
pub(crate) struct CommitPlanner<'a> {
    store: &'a GenerationStore,
    base: GenId,
    nodes: HashMap<NodeId, Option<Arc<ContentNode>>>,
    placements: HashMap<NodeId, Option<Placement>>,
    lists: HashMap<Option<NodeId>, Vec<NodeId>>,
    keys: HashMap<Uuid, Option<NodeId>>,
    order: Vec<NodeId>,
    outlined: Vec<NodeId>,
}

impl<'a> CommitPlanner<'a> {
    pub(crate) fn new(store: &'a GenerationStore, base: GenId) -> Self {
        Self {
            store,
            base,
            nodes: HashMap::new(),
            placements: HashMap::new(),
            lists: HashMap::new(),
            keys: HashMap::new(),
            order: Vec::new(),
            outlined: Vec::new(),
        }
    }

    /// Stages `changes` in order and validates the resulting tree.
    pub(crate) fn plan(
        store: &'a GenerationStore,
        base: GenId,
        changes: Vec<TreeChange>,
    ) -> Result<CommitPlan, CacheError> {
        let mut planner = Self::new(store, base);
        for change in changes {
            match change {
                TreeChange::Node(id, Some(node)) => planner.stage_upsert(id, node)?,
                TreeChange::Node(id, None) => planner.stage_tombstone(id),
                TreeChange::Outline(entry) => planner.stage_outline(entry)?,
            }
        }
        planner.finish()
    }

    fn current_node(&self, id: NodeId) -> Option<Arc<ContentNode>> {
        match self.nodes.get(&id) {
            Some(staged) => staged.clone(),
            None => self.store.get(self.base, id),
        }
    }

    fn placement(&self, id: NodeId) -> Option<Placement> {
        match self.placements.get(&id) {
            Some(staged) => *staged,
            None => self.store.nav_entry(self.base, id).map(|entry| Placement {
                parent: entry.parent_id,
                sort_order: entry.sort_order,
            }),
        }
    }

    fn list_mut(&mut self, parent: Option<NodeId>) -> &mut Vec<NodeId> {
        let store = self.store;
        let base = self.base;
        self.lists.entry(parent).or_insert_with(|| {
            let current = match parent {
                Some(parent) => super::navigation::children(store, base, parent),
                None => super::navigation::roots(store, base),
            };
            current.iter().collect()
        })
    }

    fn record(&mut self, id: NodeId, node: Option<Arc<ContentNode>>) {
        if !self.nodes.contains_key(&id) {
            self.order.push(id);
        }
        self.nodes.insert(id, node);
    }

    fn place(&mut self, id: NodeId, placement: Placement) -> Result<(), CacheError> {
        if let Some(parent) = placement.parent {
            self.ensure_acyclic(id, parent)?;
        }

        match self.placement(id) {
            Some(old) if old.parent == placement.parent => {
                if old.sort_order != placement.sort_order {
                    self.list_mut(placement.parent);
                }
            }
            Some(old) => {
                self.list_mut(old.parent).retain(|child| *child != id);
                self.list_mut(placement.parent).push(id);
            }
            None => self.list_mut(placement.parent).push(id),
        }
        self.placements.insert(id, Some(placement));
        Ok(())
    }

    fn stage_upsert(&mut self, id: NodeId, node: ContentNode) -> Result<(), CacheError> {
        self.place(
            id,
            Placement {
                parent: node.parent_id(),
                sort_order: node.sort_order(),
            },
        )?;

        let previous_key = self.current_node(id).map(|current| current.key());
        if previous_key != Some(node.key()) {
            if let Some(old_key) = previous_key {
                self.keys.insert(old_key, None);
            }
            self.keys.insert(node.key(), Some(id));
        }

        self.record(id, Some(Arc::new(node)));
        Ok(())
    }

    fn stage_outline(&mut self, entry: OutlineEntry) -> Result<(), CacheError> {
        let placement = Placement {
            parent: entry.parent_id,
            sort_order: entry.sort_order,
        };
        self.place(entry.id, placement)?;

        if let Some(current) = self.current_node(entry.id)
            && (current.parent_id() != placement.parent
                || current.sort_order() != placement.sort_order)
        {
            self.keys.insert(current.key(), None);
            self.record(entry.id, None);
        }
        self.outlined.push(entry.id);
        Ok(())
    }

    fn ensure_acyclic(&self, id: NodeId, parent: NodeId) -> Result<(), CacheError> {
        let mut seen = HashSet::new();
        let mut cursor = Some(parent);
        while let Some(current) = cursor {
            if current == id {
                return Err(CacheError::CyclicMove { id, parent });
            }
            if !seen.insert(current) {
                break;
            }
            cursor = self.placement(current).and_then(|placement| placement.parent);
        }
        Ok(())
    }

    /// Removes `id` and its whole subtree.
    fn stage_tombstone(&mut self, id: NodeId) {
        let Some(placement) = self.placement(id) else {
            if self.current_node(id).is_some() {
                self.record(id, None);
            }
            return;
        };
        self.list_mut(placement.parent).retain(|child| *child != id);

        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let below = std::mem::take(self.list_mut(Some(current)));
            queue.extend(below);

            if let Some(node) = self.current_node(current) {
                self.keys.insert(node.key(), None);
            }
            self.placements.insert(current, None);
            self.record(current, None);
        }
    }

    fn finish(mut self) -> Result<CommitPlan, CacheError> {
        for id in &self.order {
            let Some(Some(node)) = self.nodes.get(id) else {
                continue;
            };
            if let Some(parent) = node.parent_id()
                && self.placement(parent).is_none()
            {
                return Err(CacheError::MissingParent { id: *id, parent });
            }
        }
        for id in &self.outlined {
            if let Some(Placement {
                parent: Some(parent),
                ..
            }) = self.placement(*id)
                && self.placement(parent).is_none()
            {
                return Err(CacheError::MissingParent { id: *id, parent });
            }
        }

        let lists = std::mem::take(&mut self.lists);
        let mut sorted_lists: HashMap<Option<NodeId>, Arc<[NodeId]>> = HashMap::new();
        for (parent, mut list) in lists {
            if let Some(parent) = parent
                && self.placement(parent).is_none()
            {
                continue;
            }
            list.retain(|child| self.placement(*child).is_some());
            list.sort_by_cached_key(|child| {
                let sort_order = self.placement(*child).map_or(0, |p| p.sort_order);
                (sort_order, *child)
            });
            list.dedup();
            self.report_duplicate_sort_orders(parent, &list);
            sorted_lists.insert(parent, list.into());
        }

        let mut seen: HashSet<NodeId> = HashSet::new();
        let touched: Vec<NodeId> = self
            .order
            .iter()
            .chain(self.outlined.iter())
            .copied()
            .chain(sorted_lists.keys().copied().flatten())
            .filter(|id| seen.insert(*id))
            .collect();

        let mut navigation = Vec::with_capacity(touched.len());
        for id in touched {
            let entry = self.placement(id).map(|placement| {
                let children = match sorted_lists.get(&Some(id)) {
                    Some(list) => Children::from_shared(Arc::clone(list)),
                    None => super::navigation::children(self.store, self.base, id),
                };
                Arc::new(NavigationEntry {
                    id,
                    parent_id: placement.parent,
                    sort_order: placement.sort_order,
                    children,
                })
            });
            navigation.push((id, entry));
        }

        let roots = sorted_lists.remove(&None);
        let nodes = self
            .order
            .iter()
            .map(|id| (*id, self.nodes.get(id).cloned().flatten()))
            .collect();
        let keys = self
            .keys
            .into_iter()
            .map(|(key, id)| (key, id.map(Arc::new)))
            .collect();

        Ok(CommitPlan {
            nodes,
            navigation,
            roots,
            keys,
        })
    }

    fn report_duplicate_sort_orders(&self, parent: Option<NodeId>, list: &[NodeId]) {
        for pair in list.windows(2) {
            let left = self.placement(pair[0]).map(|p| p.sort_order);
            let right = self.placement(pair[1]).map(|p| p.sort_order);
            if left.is_some() && left == right {
                warn!(
                    tree = %self.store.tree(),
                    parent = ?parent,
                    first = %pair[0],
                    second = %pair[1],
                    sort_order = left,
                    "Duplicate sibling sort order; falling back to id order"
                );
            }
        }
    }
}
