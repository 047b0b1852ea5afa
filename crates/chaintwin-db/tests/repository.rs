//! Concurrency tests for `NodeRepository` over the in-memory backends.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::arithmetic_side_effects
)]

use chaintwin_db::{CacheLayer, DbError, InMemoryNodeStore, NodeRepository, NodeStore};
use chaintwin_types::{Node, NodeId, NodeMetrics, NodeType};
use chrono::Utc;

async fn repository_with(id: &NodeId) -> NodeRepository {
    let cache = CacheLayer::in_memory();
    cache.connect().await.unwrap();
    let repo = NodeRepository::new(NodeStore::InMemory(InMemoryNodeStore::new()), cache);
    let node = Node::new(
        id.clone(),
        NodeType::Supplier,
        "Shenzhen",
        5_000,
        NodeMetrics::new(100, 0.02, Utc::now(), "erp"),
    );
    repo.create_node(&node).await.unwrap();
    repo
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_writer_wins_per_version() {
    let id = NodeId::new("sup-1").unwrap();
    let repo = repository_with(&id).await;

    let writers: Vec<_> = (0..8_u64)
        .map(|i| {
            let repo = repo.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let metrics = NodeMetrics::new(i, 0.1, Utc::now(), format!("writer-{i}"));
                repo.update_node_metrics(&id, &metrics, 1).await
            })
        })
        .collect();

    let mut accepted = 0_u32;
    let mut conflicts = 0_u32;
    for writer in writers {
        match writer.await.unwrap() {
            Ok(node) => {
                assert_eq!(node.version, 2);
                accepted += 1;
            }
            Err(DbError::VersionConflict { expected, actual, .. }) => {
                assert_eq!((expected, actual), (1, 2));
                conflicts += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(repo.get_node(&id).await.unwrap().unwrap().version, 2);
}

#[tokio::test]
async fn version_advances_by_one_per_accepted_write() {
    let id = NodeId::new("sup-2").unwrap();
    let repo = repository_with(&id).await;

    for expected in 1..=5_u64 {
        let metrics = NodeMetrics::new(expected, 0.1, Utc::now(), "erp");
        let node = repo.update_node_metrics(&id, &metrics, expected).await.unwrap();
        assert_eq!(Some(node.version), expected.checked_add(1));
    }
}

#[tokio::test]
async fn duplicate_provisioning_is_rejected() {
    let id = NodeId::new("sup-3").unwrap();
    let repo = repository_with(&id).await;
    let again = Node::new(
        id.clone(),
        NodeType::Supplier,
        "Elsewhere",
        1,
        NodeMetrics::new(0, 0.0, Utc::now(), "erp"),
    );
    assert!(matches!(
        repo.create_node(&again).await,
        Err(DbError::DuplicateNode(dup)) if dup == id
    ));
}
