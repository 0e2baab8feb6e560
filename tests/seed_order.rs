mod common;

use std::collections::HashSet;
use std::sync::Arc;

use canopy::cache::seed::RepositoryRoots;
use canopy::cache::{ApplyOutcome, CacheConfig, PublishedCache, SeedKey, seed_keys};
use canopy::domain::content::{NodeId, TreeKind};
use tokio_util::sync::CancellationToken;

use common::{ids, repository, source, wide_tree};

fn render(keys: &[SeedKey]) -> String {
    keys.iter()
        .map(|key| format!("{}:{}", key.id, key.depth))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::test]
async fn seed_count_bounds_breadth_first_keys() {
    let repository = Arc::new(wide_tree(TreeKind::Document, 500, 3));
    let provider = RepositoryRoots::new(repository, TreeKind::Document, 7);

    let keys = seed_keys(&provider, 50, CancellationToken::new())
        .await
        .expect("seed");

    assert_eq!(keys.len(), 50);
    let unique: HashSet<_> = keys.iter().map(|key| key.id).collect();
    assert_eq!(unique.len(), 50);
    assert!(keys.windows(2).all(|pair| pair[0].depth <= pair[1].depth));
    assert_eq!(
        keys.iter().map(|key| key.id.0).collect::<Vec<_>>(),
        (1..=50).collect::<Vec<_>>()
    );
    insta::assert_snapshot!(
        render(&keys[..12]),
        @"1:0 2:0 3:0 4:1 5:1 6:1 7:1 8:1 9:1 10:1 11:1 12:1"
    );
}

#[tokio::test]
async fn seeding_is_idempotent_across_sources() {
    let repository = Arc::new(wide_tree(TreeKind::Media, 120, 2));
    let provider = RepositoryRoots::new(repository.clone(), TreeKind::Media, 500);

    let first = seed_keys(&provider, 40, CancellationToken::new())
        .await
        .expect("seed");
    let second = seed_keys(&provider, 40, CancellationToken::new())
        .await
        .expect("seed");
    assert_eq!(first, second);

    let config = CacheConfig {
        persistence_enabled: false,
        seed_count_media: 1_000,
        ..Default::default()
    };
    let cache = PublishedCache::new(&config, repository);
    cache.start(CancellationToken::new()).await.expect("start");
    let partition = cache.partition(TreeKind::Media);
    assert!(partition.is_complete());

    let from_snapshot = seed_keys(&cache.media(), 40, CancellationToken::new())
        .await
        .expect("seed");
    assert_eq!(from_snapshot, first);
}

#[tokio::test]
async fn partial_seed_reads_through_on_miss() {
    let repository = Arc::new(wide_tree(TreeKind::Document, 60, 1));
    let config = CacheConfig {
        persistence_enabled: false,
        seed_count_documents: 10,
        kit_batch_size: 3,
        ..Default::default()
    };
    let cache = PublishedCache::new(&config, repository);
    cache.start(CancellationToken::new()).await.expect("start");

    let partition = cache.partition(TreeKind::Document);
    assert!(!partition.is_complete());
    assert_eq!(cache.documents().node_count(), 10);

    let missing = NodeId(55);
    assert!(cache.documents().get(missing).is_none());
    let node = cache
        .get_node(TreeKind::Document, missing)
        .await
        .expect("read through")
        .expect("present in repository");
    assert_eq!(node.id(), missing);

    assert!(
        cache
            .get_node(TreeKind::Document, NodeId(999))
            .await
            .expect("read through")
            .is_none()
    );
}

#[tokio::test]
async fn unseeded_nodes_keep_their_place_in_navigation() {
    let repository = Arc::new(repository(
        TreeKind::Document,
        &[(1, None, 0), (2, Some(1), 0), (3, Some(1), 1), (4, Some(3), 0)],
    ));
    let config = CacheConfig {
        persistence_enabled: false,
        seed_count_documents: 2,
        ..Default::default()
    };
    let cache = PublishedCache::new(&config, repository.clone());
    cache.start(CancellationToken::new()).await.expect("start");

    let snapshot = cache.documents();
    assert_eq!(snapshot.node_count(), 2);
    assert_eq!(ids(snapshot.children(NodeId(1)).iter()), vec![2, 3]);
    assert_eq!(ids(snapshot.children(NodeId(3)).iter()), vec![4]);
    assert_eq!(ids(snapshot.descendants(NodeId(1))), vec![2, 3, 4]);
    assert!(snapshot.get(NodeId(3)).is_none());
    assert_eq!(
        snapshot.entry(NodeId(3)).expect("placed").parent_id,
        Some(NodeId(1))
    );
    drop(snapshot);

    let node = cache
        .get_node(TreeKind::Document, NodeId(3))
        .await
        .expect("read through")
        .expect("present in repository");
    assert_eq!(node.parent_id(), Some(NodeId(1)));

    let partition = cache.partition(TreeKind::Document);
    let edited = repository.publish(TreeKind::Document, source(4, Some(3), 0, 0));
    assert!(matches!(
        partition.pipeline().apply(edited).await,
        ApplyOutcome::Committed { .. }
    ));

    let snapshot = cache.documents();
    assert_eq!(
        snapshot.get(NodeId(4)).expect("hydrated").parent_id(),
        Some(NodeId(3))
    );
    assert_eq!(ids(snapshot.children(NodeId(3)).iter()), vec![4]);
    assert_eq!(snapshot.node_count(), 3);
    assert!(!partition.is_complete());
}
