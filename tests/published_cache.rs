mod common;

use std::sync::Arc;

use canopy::cache::{CacheError, PartitionStatus, PublishedCache, WarningKind};
use canopy::domain::content::{NodeId, TreeKind};
use tokio_util::sync::CancellationToken;

use common::{memory_config, repository};

fn site() -> Arc<canopy::infra::fixture::FixtureRepository> {
    Arc::new(repository(
        TreeKind::Document,
        &[(1, None, 0), (2, Some(1), 0), (3, Some(1), 1)],
    ))
}

#[tokio::test]
async fn reads_go_to_the_repository_until_ready() {
    let cache = PublishedCache::new(&memory_config(), site());
    assert_eq!(
        cache.status(TreeKind::Document),
        PartitionStatus::Uninitialized
    );
    assert_eq!(cache.documents().node_count(), 0);

    let node = cache
        .get_node(TreeKind::Document, NodeId(2))
        .await
        .expect("read through")
        .expect("present in repository");
    assert_eq!(node.parent_id(), Some(NodeId(1)));

    cache.start(CancellationToken::new()).await.expect("start");
    let generation = cache.documents().generation();
    assert_eq!(
        cache.status(TreeKind::Document),
        PartitionStatus::Ready { generation }
    );
    assert!(cache.partition(TreeKind::Document).is_complete());
    assert!(
        cache
            .get_node(TreeKind::Document, NodeId(99))
            .await
            .expect("authoritative miss")
            .is_none()
    );
}

#[tokio::test]
async fn cancelled_rebuild_leaves_partition_uninitialized() {
    let cache = PublishedCache::new(&memory_config(), site());
    let mut status = cache.partition(TreeKind::Document).subscribe_status();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = cache
        .partition(TreeKind::Document)
        .start(cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Cancelled));
    assert_eq!(*status.borrow_and_update(), PartitionStatus::Uninitialized);
    assert_eq!(cache.documents().node_count(), 0);
}

#[tokio::test]
async fn repository_failure_marks_partition_failed() {
    let repository = site();
    repository.set_offline(true);
    let cache = PublishedCache::new(&memory_config(), repository.clone());
    let mut warnings = cache.subscribe_warnings();

    let err = cache
        .partition(TreeKind::Document)
        .start(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Repository(_)));
    assert!(matches!(
        cache.status(TreeKind::Document),
        PartitionStatus::Failed { .. }
    ));
    let warning = warnings.recv().await.expect("warning");
    assert_eq!(warning.kind, WarningKind::RepositoryFailure);
    assert_eq!(warning.node_id, None);

    repository.set_offline(false);
    cache
        .partition(TreeKind::Document)
        .rebuild(CancellationToken::new())
        .await
        .expect("rebuild after recovery");
    assert!(cache.status(TreeKind::Document).is_ready());
    assert_eq!(cache.documents().node_count(), 3);
}

#[tokio::test]
async fn rebuild_replaces_the_tree_in_one_generation() {
    let repository = site();
    let cache = PublishedCache::new(&memory_config(), repository.clone());
    cache.start(CancellationToken::new()).await.expect("start");
    let before = cache.documents();

    repository.delete(TreeKind::Document, NodeId(3));
    repository.insert(TreeKind::Document, common::source(4, None, 1, 1));
    let generation = cache
        .partition(TreeKind::Document)
        .rebuild(CancellationToken::new())
        .await
        .expect("rebuild");

    let after = cache.documents();
    assert_eq!(generation, before.generation() + 1);
    assert_eq!(common::ids(after.roots().iter()), vec![1, 4]);
    assert!(after.get(NodeId(3)).is_none());
    assert!(before.get(NodeId(3)).is_some());
    assert_eq!(common::ids(before.roots().iter()), vec![1]);
}

#[tokio::test]
async fn failed_start_runs_both_trees_to_completion() {
    let repository = site();
    repository.set_offline(true);
    let cache = PublishedCache::new(&memory_config(), repository);

    let err = cache.start(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, CacheError::Repository(_)));
    for tree in [TreeKind::Document, TreeKind::Media] {
        assert!(matches!(
            cache.status(tree),
            PartitionStatus::Failed { .. }
        ));
    }
}

#[tokio::test]
async fn failed_clear_empties_the_store_and_keeps_old_snapshots() {
    let repository = site();
    let cache = PublishedCache::new(&memory_config(), repository.clone());
    cache.start(CancellationToken::new()).await.expect("start");
    let before = cache.documents();

    repository.set_offline(true);
    let partition = cache.partition(TreeKind::Document);
    let err = partition
        .clear_memory_cache(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Repository(_)));
    let after = cache.documents();
    assert!(after.generation() > before.generation());
    assert_eq!(after.node_count(), 0);
    assert!(after.roots().is_empty());
    assert_eq!(before.node_count(), 3);
    assert!(!partition.is_complete());
    assert!(matches!(partition.status(), PartitionStatus::Failed { .. }));
}
