//! Content node values held by the published cache.
//!
//! A [`ContentNode`] is an immutable view of one document or media item at a
//! point in time. Changes never mutate a node: the builder-style helpers
//! (`with_parent`, `with_sort_order`) return a new value and the cache stores
//! it under a new generation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::DomainError;

/// Culture code used for invariant (non culture-variant) properties.
pub const INVARIANT_CULTURE: &str = "";

/// Stable integer identity of a content node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentTypeId(pub u32);

/// Position of a change in the repository's change log.
///
/// Versions increase monotonically across the whole repository, so they order
/// changes both per node and globally.
pub type SourceVersion = u64;

/// The independent content trees served by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeKind {
    Document,
    Media,
}

impl TreeKind {
    pub const ALL: [TreeKind; 2] = [TreeKind::Document, TreeKind::Media];

    pub fn as_str(self) -> &'static str {
        match self {
            TreeKind::Document => "document",
            TreeKind::Media => "media",
        }
    }
}

impl fmt::Display for TreeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Property values of one culture, keyed by property alias.
pub type PropertyBag = BTreeMap<String, serde_json::Value>;

/// One variant (published or draft) of a node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentData {
    #[serde(default)]
    pub cultures: BTreeMap<String, PropertyBag>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub sort_order: i32,
}

impl ContentData {
    /// Looks up a property for `culture`, falling back to the invariant bag.
    pub fn property(&self, culture: &str, alias: &str) -> Option<&serde_json::Value> {
        self.cultures
            .get(culture)
            .and_then(|bag| bag.get(alias))
            .or_else(|| {
                self.cultures
                    .get(INVARIANT_CULTURE)
                    .and_then(|bag| bag.get(alias))
            })
    }

    pub fn cultures(&self) -> impl Iterator<Item = &str> {
        self.cultures.keys().map(String::as_str)
    }
}

/// Raw node data as handed out by the content repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentNodeSource {
    pub id: NodeId,
    pub key: Uuid,
    pub parent_id: Option<NodeId>,
    pub content_type_id: ContentTypeId,
    pub source_version: SourceVersion,
    pub published: Option<ContentData>,
    pub draft: Option<ContentData>,
}

/// Immutable cached state of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentNode {
    id: NodeId,
    key: Uuid,
    parent_id: Option<NodeId>,
    content_type_id: ContentTypeId,
    source_version: SourceVersion,
    published: Option<ContentData>,
    draft: Option<ContentData>,
}

impl ContentNode {
    /// Builds a node from repository data.
    ///
    /// A node must carry at least one of its published and draft variants and
    /// cannot be its own parent.
    pub fn from_source(source: ContentNodeSource) -> Result<Self, DomainError> {
        if source.published.is_none() && source.draft.is_none() {
            return Err(DomainError::validation(format!(
                "node {} has neither published nor draft data",
                source.id
            )));
        }
        if source.parent_id == Some(source.id) {
            return Err(DomainError::invariant(format!(
                "node {} cannot be its own parent",
                source.id
            )));
        }

        Ok(Self {
            id: source.id,
            key: source.key,
            parent_id: source.parent_id,
            content_type_id: source.content_type_id,
            source_version: source.source_version,
            published: source.published,
            draft: source.draft,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn parent_id(&self) -> Option<NodeId> {
        self.parent_id
    }

    pub fn content_type_id(&self) -> ContentTypeId {
        self.content_type_id
    }

    pub fn source_version(&self) -> SourceVersion {
        self.source_version
    }

    pub fn published(&self) -> Option<&ContentData> {
        self.published.as_ref()
    }

    pub fn draft(&self) -> Option<&ContentData> {
        self.draft.as_ref()
    }

    pub fn has_published(&self) -> bool {
        self.published.is_some()
    }

    /// Sort order used for tree ordering: published first, then draft.
    pub fn sort_order(&self) -> i32 {
        self.published
            .as_ref()
            .or(self.draft.as_ref())
            .map_or(0, |data| data.sort_order)
    }

    pub fn is_trashed(&self) -> bool {
        self.published
            .as_ref()
            .or(self.draft.as_ref())
            .is_some_and(|data| data.trashed)
    }

    pub fn with_parent(&self, parent_id: Option<NodeId>) -> Self {
        Self {
            parent_id,
            ..self.clone()
        }
    }

    /// Returns a copy with `sort_order` applied to every present variant.
    pub fn with_sort_order(&self, sort_order: i32) -> Self {
        let mut next = self.clone();
        if let Some(data) = next.published.as_mut() {
            data.sort_order = sort_order;
        }
        if let Some(data) = next.draft.as_mut() {
            data.sort_order = sort_order;
        }
        next
    }

    pub fn to_source(&self) -> ContentNodeSource {
        ContentNodeSource {
            id: self.id,
            key: self.key,
            parent_id: self.parent_id,
            content_type_id: self.content_type_id,
            source_version: self.source_version,
            published: self.published.clone(),
            draft: self.draft.clone(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn rejects_node_without_variants() {
        let mut src = source(7, None, 0, 1);
        src.published = None;
        assert!(matches!(
            ContentNode::from_source(src),
            Err(DomainError::Validation { .. })
        ));
    }

    #[test]
    fn rejects_self_parent() {
        let src = source(7, Some(7), 0, 1);
        assert!(ContentNode::from_source(src).is_err());
    }

    #[test]
    fn sort_order_prefers_published_variant() {
        let mut src = source(3, None, 4, 1);
        src.draft = Some(ContentData {
            sort_order: 9,
            ..Default::default()
        });
        let node = ContentNode::from_source(src).expect("valid node");
        assert_eq!(node.sort_order(), 4);
    }

    #[test]
    fn trashed_flag_follows_published_variant() {
        let mut src = source(3, None, 0, 1);
        src.draft = Some(ContentData {
            trashed: true,
            ..Default::default()
        });
        let node = ContentNode::from_source(src.clone()).expect("valid node");
        assert!(!node.is_trashed());

        src.published = None;
        let draft_only = ContentNode::from_source(src).expect("valid node");
        assert!(draft_only.is_trashed());
    }

    #[test]
    fn with_sort_order_leaves_original_untouched() {
        let original = node(5, Some(1), 2);
        let moved = original.with_sort_order(0).with_parent(Some(NodeId(9)));

        assert_eq!(original.sort_order(), 2);
        assert_eq!(original.parent_id(), Some(NodeId(1)));
        assert_eq!(moved.sort_order(), 0);
        assert_eq!(moved.parent_id(), Some(NodeId(9)));
    }

    #[test]
    fn property_falls_back_to_invariant_culture() {
        let node = node(11, None, 0);
        let data = node.published().expect("published data");
        assert_eq!(
            data.property("en-US", "title"),
            Some(&serde_json::Value::String("Node 11".to_string()))
        );
        assert!(data.property("en-US", "missing").is_none());
    }
}
