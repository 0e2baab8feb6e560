#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use canopy::cache::{CacheConfig, GenId, GenerationStore, Snapshot};
use canopy::domain::content::{
    ContentData, ContentNode, ContentNodeSource, ContentTypeId, INVARIANT_CULTURE, NodeId,
    SourceVersion, TreeKind,
};
use canopy::infra::fixture::FixtureRepository;
use uuid::Uuid;

pub fn source(
    id: u64,
    parent: Option<u64>,
    sort_order: i32,
    version: SourceVersion,
) -> ContentNodeSource {
    let mut properties = BTreeMap::new();
    properties.insert("title".to_string(), serde_json::json!(format!("Node {id}")));
    ContentNodeSource {
        id: NodeId(id),
        key: Uuid::from_u128(u128::from(id)),
        parent_id: parent.map(NodeId),
        content_type_id: ContentTypeId(1),
        source_version: version,
        published: Some(ContentData {
            cultures: BTreeMap::from([(INVARIANT_CULTURE.to_string(), properties)]),
            trashed: false,
            sort_order,
        }),
        draft: None,
    }
}

pub fn node(id: u64, parent: Option<u64>, sort_order: i32) -> ContentNode {
    ContentNode::from_source(source(id, parent, sort_order, 1)).expect("valid node")
}

/// Repository holding `(id, parent, sort_order)` rows in `tree`, all at version 1.
pub fn repository(tree: TreeKind, rows: &[(u64, Option<u64>, i32)]) -> FixtureRepository {
    let repository = FixtureRepository::new();
    for (id, parent, sort_order) in rows {
        repository.insert(tree, source(*id, *parent, *sort_order, 1));
    }
    repository
}

/// `node_count` nodes under `root_count` roots, four children per node.
///
/// Ids are assigned breadth first, so breadth-first order is id order.
pub fn wide_tree(tree: TreeKind, node_count: u64, root_count: u64) -> FixtureRepository {
    let repository = FixtureRepository::new();
    for id in 1..=node_count {
        let parent = (id > root_count).then(|| (id - root_count - 1) / 4 + 1);
        repository.insert(tree, source(id, parent, id as i32, 1));
    }
    repository
}

pub fn memory_config() -> CacheConfig {
    CacheConfig {
        persistence_enabled: false,
        ..Default::default()
    }
}

pub fn persistent_config(dir: &Path) -> CacheConfig {
    CacheConfig {
        persistence_enabled: true,
        local_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

/// `(id, parent, sort_order)` of every node, breadth first.
pub fn shape(snapshot: &Snapshot) -> Vec<(u64, Option<u64>, i32)> {
    snapshot
        .iter_all()
        .map(|node| {
            (
                node.id().0,
                node.parent_id().map(|parent| parent.0),
                node.sort_order(),
            )
        })
        .collect()
}

pub fn ids(list: impl IntoIterator<Item = NodeId>) -> Vec<u64> {
    list.into_iter().map(|id| id.0).collect()
}

/// Waits until the store publishes `generation` or later.
pub async fn wait_for_generation(store: &GenerationStore, generation: GenId) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.head() < generation {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("generation published in time");
}
