//! Repository traits describing the content source behind the cache.

use async_trait::async_trait;
use thiserror::Error;

use crate::cache::ChangeNotification;
use crate::domain::content::{ContentNodeSource, NodeId, SourceVersion, TreeKind};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("repository timeout")]
    Timeout,
}

/// One page of an ordered listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            has_more: false,
        }
    }
}

/// A child listed under its parent, with the sort order it is placed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildEntry {
    pub id: NodeId,
    pub sort_order: i32,
}

/// Read access to the authoritative content store.
///
/// `parent = None` addresses the roots of a tree. Children pages are ordered
/// the way the tree is ordered: by sort order, then id.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    async fn load_node(
        &self,
        tree: TreeKind,
        id: NodeId,
    ) -> Result<Option<ContentNodeSource>, RepoError>;

    async fn load_children_page(
        &self,
        tree: TreeKind,
        parent: Option<NodeId>,
        skip: usize,
        take: usize,
    ) -> Result<Page<ChildEntry>, RepoError>;

    /// Source version of the newest change-log entry.
    ///
    /// Reads taken after this call reflect every change up to that version.
    async fn log_version(&self, tree: TreeKind) -> Result<SourceVersion, RepoError>;

    /// Change-log entries with a source version strictly above `watermark`,
    /// oldest first.
    async fn changes_since(
        &self,
        tree: TreeKind,
        watermark: SourceVersion,
    ) -> Result<Vec<ChangeNotification>, RepoError>;

    /// Loads a batch of nodes, skipping ids the repository no longer holds.
    async fn load_nodes(
        &self,
        tree: TreeKind,
        ids: &[NodeId],
    ) -> Result<Vec<ContentNodeSource>, RepoError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(source) = self.load_node(tree, *id).await? {
                out.push(source);
            }
        }
        Ok(out)
    }
}
