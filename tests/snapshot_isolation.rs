mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use canopy::cache::navigation::move_subtree;
use canopy::cache::{ApplyOutcome, GenerationStore, PublishedCache, Snapshot};
use canopy::domain::content::{NodeId, TreeKind};
use tokio_util::sync::CancellationToken;

use common::{ids, memory_config, node, repository};

#[test]
fn children_of_root_are_visible_after_commit() {
    let store = Arc::new(GenerationStore::new(TreeKind::Document));

    let generation = store
        .commit(
            store.head(),
            vec![
                (NodeId(1), Some(node(1, None, 0))),
                (NodeId(2), Some(node(2, Some(1), 1))),
                (NodeId(3), Some(node(3, Some(1), 0))),
            ],
        )
        .expect("commit");

    let snapshot = store.acquire_snapshot();
    assert_eq!(snapshot.generation(), generation);
    assert_eq!(ids(snapshot.roots().iter()), vec![1]);
    assert_eq!(ids(snapshot.children(NodeId(1)).iter()), vec![3, 2]);
    assert_eq!(ids(snapshot.ancestors(NodeId(2))), vec![1]);
}

#[tokio::test]
async fn held_snapshot_keeps_seeing_deleted_node() {
    let repository = Arc::new(repository(
        TreeKind::Document,
        &[(1, None, 0), (42, Some(1), 0), (43, Some(42), 0), (44, Some(1), 1)],
    ));
    let cache = PublishedCache::new(&memory_config(), repository.clone());
    cache.start(CancellationToken::new()).await.expect("start");

    let snapshot_a = cache.documents();
    assert!(snapshot_a.get(NodeId(42)).is_some());

    let deleted = repository
        .delete(TreeKind::Document, NodeId(42))
        .expect("node 42 exists");
    let outcome = cache
        .partition(TreeKind::Document)
        .pipeline()
        .apply(deleted)
        .await;
    assert!(matches!(outcome, ApplyOutcome::Committed { .. }));

    let snapshot_b = cache.documents();
    assert!(snapshot_b.generation() > snapshot_a.generation());
    assert!(snapshot_b.get(NodeId(42)).is_none());
    assert!(snapshot_b.get(NodeId(43)).is_none());
    assert_eq!(ids(snapshot_b.children(NodeId(1)).iter()), vec![44]);

    let still_there = snapshot_a.get(NodeId(42)).expect("snapshot A still sees 42");
    assert_eq!(still_there.parent_id(), Some(NodeId(1)));
    assert!(snapshot_a.get(NodeId(43)).is_some());
    assert_eq!(ids(snapshot_a.children(NodeId(1)).iter()), vec![42, 44]);
    assert_eq!(ids(snapshot_a.descendants(NodeId(1))), vec![42, 44, 43]);
}

#[test]
fn snapshots_at_each_generation_stay_consistent_until_released() {
    let store = Arc::new(GenerationStore::new(TreeKind::Document));
    store
        .commit(store.head(), vec![(NodeId(1), Some(node(1, None, 0)))])
        .expect("root");

    let mut held = Vec::new();
    for sort_order in 1..=3 {
        held.push(store.acquire_snapshot());
        store
            .commit(
                store.head(),
                vec![(NodeId(2), Some(node(2, Some(1), sort_order)))],
            )
            .expect("update");
    }

    assert!(held[0].get(NodeId(2)).is_none());
    assert_eq!(held[1].get(NodeId(2)).expect("v1").sort_order(), 1);
    assert_eq!(held[2].get(NodeId(2)).expect("v2").sort_order(), 2);
    assert_eq!(store.pinned_count(), 3);

    // Releasing the middle snapshot must not disturb the others.
    held.remove(1);
    store.gc();
    assert!(held[0].get(NodeId(2)).is_none());
    assert_eq!(held[1].get(NodeId(2)).expect("v2").sort_order(), 2);
    assert_eq!(
        store
            .acquire_snapshot()
            .get(NodeId(2))
            .expect("head")
            .sort_order(),
        3
    );

    held.clear();
    let report = store.gc();
    assert!(report.collected >= 2);
    assert_eq!(store.generation_count(), 1);
    assert_eq!(store.pinned_count(), 0);
}

#[test]
fn cloned_snapshot_pins_the_same_generation() {
    let store = Arc::new(GenerationStore::new(TreeKind::Media));
    store
        .commit(store.head(), vec![(NodeId(7), Some(node(7, None, 0)))])
        .expect("commit");

    let first = store.acquire_snapshot();
    let second = first.clone();
    drop(first);

    store
        .commit(store.head(), vec![(NodeId(7), None)])
        .expect("delete");

    assert!(second.get(NodeId(7)).is_some());
    assert!(store.acquire_snapshot().get(NodeId(7)).is_none());
}

const TREE_SIZE: u64 = 40;

/// Descendants of the root with each node's children, checking on the way
/// that payload parents agree with navigation.
fn view(snapshot: &Snapshot) -> Vec<(u64, Vec<u64>)> {
    snapshot
        .descendants(NodeId(1))
        .into_iter()
        .map(|id| {
            let entry = snapshot.entry(id).expect("navigation entry");
            let node = snapshot.get(id).expect("payload");
            assert_eq!(node.parent_id(), entry.parent_id);
            let children = snapshot.children(id);
            for child in children.iter() {
                let child_entry = snapshot.entry(child).expect("child entry");
                assert_eq!(child_entry.parent_id, Some(id));
            }
            (id.0, ids(children.iter()))
        })
        .collect()
}

#[test]
fn readers_see_stable_trees_while_the_writer_moves_and_deletes() {
    let store = Arc::new(GenerationStore::new(TreeKind::Document));
    let mut seed = vec![(NodeId(1), Some(node(1, None, 0)))];
    for id in 2..=TREE_SIZE {
        let parent = (id - 2) / 3 + 1;
        seed.push((NodeId(id), Some(node(id, Some(parent), id as i32))));
    }
    store.commit(store.head(), seed).expect("seed tree");

    let before = store.acquire_snapshot();
    let before_view = view(&before);
    assert_eq!(before_view.len(), TREE_SIZE as usize - 1);
    let writing = AtomicBool::new(true);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for round in 0..300_u64 {
                let id = NodeId(2 + round % (TREE_SIZE - 1));
                if round % 10 == 9 {
                    let _ = store.commit(store.head(), vec![(id, None)]);
                    let _ = store.commit(
                        store.head(),
                        vec![(id, Some(node(id.0, Some(1), round as i32)))],
                    );
                } else {
                    let parent = NodeId(1 + (round * 7) % TREE_SIZE);
                    let _ = move_subtree(
                        &store,
                        store.head(),
                        id,
                        Some(parent),
                        (round % 5) as usize,
                    );
                }
            }
            writing.store(false, Ordering::Release);
        });

        for _ in 0..4 {
            scope.spawn(|| {
                let mut reads = 0;
                while writing.load(Ordering::Acquire) || reads < 20 {
                    let snapshot = store.acquire_snapshot();
                    let first = view(&snapshot);
                    std::thread::yield_now();
                    assert_eq!(view(&snapshot), first);
                    assert_eq!(view(&before), before_view);
                    reads += 1;
                }
            });
        }
    });

    assert!(store.head() > before.generation());
    assert_eq!(view(&before), before_view);
    drop(before);
    store.gc();
    assert_eq!(store.pinned_count(), 0);
    assert_eq!(store.generation_count(), 1);
}
