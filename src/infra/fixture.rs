//! In-memory content repository loaded from a TOML fixture.
//!
//! Backs the `canopy` binary and the integration tests. Every mutation is
//! stamped with the next source version of its tree and appended to a change
//! log, so `changes_since` behaves like a real repository's journal.
//!
//! ```toml
//! [[documents]]
//! id = 1
//! sort_order = 0
//! [documents.properties]
//! title = "Home"
//!
//! [[documents]]
//! id = 2
//! parent = 1
//! published = false
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::application::repos::{ChildEntry, ContentRepository, Page, RepoError};
use crate::cache::lock::{rw_read, rw_write};
use crate::cache::{ChangeKind, ChangeNotification};
use crate::domain::content::{
    ContentData, ContentNodeSource, ContentTypeId, INVARIANT_CULTURE, NodeId, PropertyBag,
    SourceVersion, TreeKind,
};

use super::error::InfraError;

const SOURCE: &str = "infra::fixture";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FixtureFile {
    documents: Vec<FixtureRow>,
    media: Vec<FixtureRow>,
}

#[derive(Debug, Deserialize)]
struct FixtureRow {
    id: u64,
    #[serde(default)]
    parent: Option<u64>,
    #[serde(default)]
    key: Option<Uuid>,
    #[serde(default = "default_content_type")]
    content_type: u32,
    #[serde(default)]
    sort_order: i32,
    #[serde(default = "default_published")]
    published: bool,
    #[serde(default)]
    properties: PropertyBag,
}

fn default_content_type() -> u32 {
    1
}

fn default_published() -> bool {
    true
}

impl FixtureRow {
    fn into_source(self, source_version: SourceVersion) -> ContentNodeSource {
        let data = ContentData {
            cultures: BTreeMap::from([(INVARIANT_CULTURE.to_string(), self.properties)]),
            trashed: false,
            sort_order: self.sort_order,
        };
        let (published, draft) = if self.published {
            (Some(data), None)
        } else {
            (None, Some(data))
        };
        ContentNodeSource {
            id: NodeId(self.id),
            key: self.key.unwrap_or_else(|| Uuid::from_u128(u128::from(self.id))),
            parent_id: self.parent.map(NodeId),
            content_type_id: ContentTypeId(self.content_type),
            source_version,
            published,
            draft,
        }
    }
}

#[derive(Debug, Default)]
struct FixtureTree {
    nodes: BTreeMap<NodeId, ContentNodeSource>,
    log: Vec<ChangeNotification>,
    version: SourceVersion,
}

impl FixtureTree {
    fn next_version(&mut self) -> SourceVersion {
        self.version += 1;
        self.version
    }

    fn children(&self, parent: Option<NodeId>) -> Vec<ChildEntry> {
        let mut children: Vec<ChildEntry> = self
            .nodes
            .values()
            .filter(|source| source.parent_id == parent)
            .map(|source| ChildEntry {
                id: source.id,
                sort_order: sort_order_of(source),
            })
            .collect();
        children.sort_unstable_by_key(|child| (child.sort_order, child.id));
        children
    }

    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = vec![id];
        let mut cursor = 0;
        while cursor < out.len() {
            let parent = out[cursor];
            out.extend(self.children(Some(parent)).into_iter().map(|child| child.id));
            cursor += 1;
        }
        out
    }
}

fn sort_order_of(source: &ContentNodeSource) -> i32 {
    source
        .published
        .as_ref()
        .or(source.draft.as_ref())
        .map(|data| data.sort_order)
        .unwrap_or_default()
}

/// Content repository held entirely in memory.
#[derive(Debug, Default)]
pub struct FixtureRepository {
    documents: RwLock<FixtureTree>,
    media: RwLock<FixtureTree>,
    offline: AtomicBool,
}

impl FixtureRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(input: &str) -> Result<Self, InfraError> {
        let file: FixtureFile = toml::from_str(input)
            .map_err(|err| InfraError::fixture(format!("failed to parse fixture: {err}")))?;

        let repository = Self::new();
        for (tree, rows) in [
            (TreeKind::Document, file.documents),
            (TreeKind::Media, file.media),
        ] {
            for row in rows {
                repository.insert(tree, row.into_source(1));
            }
        }
        Ok(repository)
    }

    pub async fn load(path: &Path) -> Result<Self, InfraError> {
        let input = tokio::fs::read_to_string(path).await?;
        let repository = Self::from_toml_str(&input)?;
        info!(
            path = %path.display(),
            documents = repository.len(TreeKind::Document),
            media = repository.len(TreeKind::Media),
            "Loaded fixture repository"
        );
        Ok(repository)
    }

    fn tree(&self, tree: TreeKind) -> &RwLock<FixtureTree> {
        match tree {
            TreeKind::Document => &self.documents,
            TreeKind::Media => &self.media,
        }
    }

    /// Stores `source` without recording a change.
    pub fn insert(&self, tree: TreeKind, source: ContentNodeSource) {
        let mut state = rw_write(self.tree(tree), SOURCE, "insert");
        state.version = state.version.max(source.source_version);
        state.nodes.insert(source.id, source);
    }

    /// Stores `source` under the next version and logs the change.
    ///
    /// The change is `Moved` when the node already exists under another
    /// parent, `Unpublished` when the new data has no published variant.
    pub fn publish(&self, tree: TreeKind, mut source: ContentNodeSource) -> ChangeNotification {
        let mut state = rw_write(self.tree(tree), SOURCE, "publish");
        let kind = match state.nodes.get(&source.id) {
            _ if source.published.is_none() => ChangeKind::Unpublished,
            Some(existing) if existing.parent_id != source.parent_id => ChangeKind::Moved,
            Some(existing) if sort_order_of(existing) != sort_order_of(&source) => {
                ChangeKind::Sorted
            }
            _ => ChangeKind::Published,
        };
        source.source_version = state.next_version();
        let notification = ChangeNotification::new(source.id, kind, source.source_version);
        debug!(tree = %tree, node_id = %source.id, event_kind = %kind, "Fixture change recorded");
        state.nodes.insert(source.id, source);
        state.log.push(notification.clone());
        notification
    }

    /// Removes a node and its descendants, logging one `Deleted` change.
    pub fn delete(&self, tree: TreeKind, id: NodeId) -> Option<ChangeNotification> {
        let mut state = rw_write(self.tree(tree), SOURCE, "delete");
        if !state.nodes.contains_key(&id) {
            return None;
        }
        for removed in state.subtree(id) {
            state.nodes.remove(&removed);
        }
        let version = state.next_version();
        let notification = ChangeNotification::new(id, ChangeKind::Deleted, version);
        state.log.push(notification.clone());
        Some(notification)
    }

    pub fn get(&self, tree: TreeKind, id: NodeId) -> Option<ContentNodeSource> {
        rw_read(self.tree(tree), SOURCE, "get").nodes.get(&id).cloned()
    }

    pub fn len(&self, tree: TreeKind) -> usize {
        rw_read(self.tree(tree), SOURCE, "len").nodes.len()
    }

    pub fn is_empty(&self, tree: TreeKind) -> bool {
        self.len(tree) == 0
    }

    /// Latest source version handed out for `tree`.
    pub fn version(&self, tree: TreeKind) -> SourceVersion {
        rw_read(self.tree(tree), SOURCE, "version").version
    }

    /// Makes every repository call fail with a timeout until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    fn ensure_online(&self) -> Result<(), RepoError> {
        if self.offline.load(Ordering::Acquire) {
            return Err(RepoError::Timeout);
        }
        Ok(())
    }
}

#[async_trait]
impl ContentRepository for FixtureRepository {
    async fn load_node(
        &self,
        tree: TreeKind,
        id: NodeId,
    ) -> Result<Option<ContentNodeSource>, RepoError> {
        self.ensure_online()?;
        Ok(self.get(tree, id))
    }

    async fn load_children_page(
        &self,
        tree: TreeKind,
        parent: Option<NodeId>,
        skip: usize,
        take: usize,
    ) -> Result<Page<ChildEntry>, RepoError> {
        self.ensure_online()?;
        let children = rw_read(self.tree(tree), SOURCE, "load_children_page").children(parent);
        let items: Vec<ChildEntry> = children.iter().skip(skip).take(take).copied().collect();
        let has_more = skip + items.len() < children.len();
        Ok(Page { items, has_more })
    }

    async fn log_version(&self, tree: TreeKind) -> Result<SourceVersion, RepoError> {
        self.ensure_online()?;
        Ok(self.version(tree))
    }

    async fn changes_since(
        &self,
        tree: TreeKind,
        watermark: SourceVersion,
    ) -> Result<Vec<ChangeNotification>, RepoError> {
        self.ensure_online()?;
        let state = rw_read(self.tree(tree), SOURCE, "changes_since");
        Ok(state
            .log
            .iter()
            .filter(|notification| notification.source_version > watermark)
            .cloned()
            .collect())
    }
}
