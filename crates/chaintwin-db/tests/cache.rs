//! Cache layer behavior on a simulated clock.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use chaintwin_db::{CacheLayer, DbError, SIMULATION_TTL};
use serde_json::json;

async fn connected() -> CacheLayer {
    let cache = CacheLayer::in_memory();
    cache.connect().await.unwrap();
    cache
}

#[tokio::test(start_paused = true)]
async fn simulation_result_expires_after_an_hour() {
    let cache = connected().await;
    cache
        .cache_simulation_result("s1", "h1", json!({ "cost": 1000 }))
        .await
        .unwrap();

    assert_eq!(
        cache.get_simulation_result("s1", "h1").await.unwrap(),
        Some(json!({ "cost": 1000 }))
    );
    assert_eq!(cache.ttl("simulation:s1:h1").await.unwrap(), Some(SIMULATION_TTL));

    tokio::time::advance(Duration::from_secs(3601)).await;
    assert_eq!(cache.get_simulation_result("s1", "h1").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn recaching_a_simulation_replaces_and_restarts_ttl() {
    let cache = connected().await;
    cache
        .cache_simulation_result("s1", "h1", json!({ "cost": 1000 }))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(3000)).await;
    cache
        .cache_simulation_result("s1", "h1", json!({ "cost": 900 }))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(3000)).await;

    let entry = cache.get_simulation_entry("s1", "h1").await.unwrap().unwrap();
    assert_eq!(entry.result, json!({ "cost": 900 }));
    assert_eq!(entry.scenario_id, "s1");
}

#[tokio::test]
async fn set_get_delete_exists() {
    let cache = connected().await;
    assert_eq!(cache.get("missing").await.unwrap(), None);

    cache.set("k", "v", Some(Duration::from_secs(30))).await.unwrap();
    assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
    assert!(cache.exists("k").await.unwrap());

    cache.delete("k").await.unwrap();
    assert!(!cache.exists("k").await.unwrap());
    assert_eq!(cache.ttl("k").await.unwrap(), None);
}

#[tokio::test]
async fn helpers_fail_while_disconnected() {
    let cache = CacheLayer::in_memory();
    let err = cache
        .cache_simulation_result("s1", "h1", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Disconnected));
    assert_eq!(err.kind(), chaintwin_types::ErrorKind::Connectivity);
    assert!(cache.get_latest_digital_twin_state().await.is_err());
}
