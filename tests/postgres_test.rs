//! Relational store contract tests.
//!
//! These need a reachable PostgreSQL and run only when `DATABASE_DSN` is set,
//! e.g. `DATABASE_DSN="host=localhost user=postgres password=postgres"`.
//! Metric names carry a per-test suffix, so tests can share one database.

use monitor_lib::core::{MetricRecord, MonitorError, RetryConfig, StorageConfig};
use monitor_lib::server::Collector;
use monitor_lib::storage::{MetricStorage, PgStorage, StoreKind};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn dsn() -> Option<String> {
    std::env::var("DATABASE_DSN").ok().filter(|dsn| !dsn.is_empty())
}

async fn connect() -> Option<PgStorage> {
    let Some(dsn) = dsn() else {
        eprintln!("DATABASE_DSN not set, skipping");
        return None;
    };
    Some(
        PgStorage::connect(&dsn, RetryConfig::default(), CancellationToken::new())
            .await
            .expect("DATABASE_DSN should be reachable"),
    )
}

fn unique(name: &str) -> String {
    format!("{}_{:08x}", name, rand::random::<u32>())
}

#[tokio::test]
async fn test_gauge_last_write_wins() {
    let Some(store) = connect().await else { return };
    let apple = unique("Apple");

    store.set_gauge(&apple, 3.0).await.unwrap();
    store.set_gauge(&apple, 2.0).await.unwrap();
    assert_eq!(store.get_gauge(&apple).await.unwrap(), Some(2.0));
    assert_eq!(store.get_gauge(&unique("Banana")).await.unwrap(), None);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_counter_accumulates() {
    let Some(store) = connect().await else { return };
    let river = unique("Mississippi");

    store.add_counter(&river, 3).await.unwrap();
    store.add_counter(&river, 2).await.unwrap();
    assert_eq!(store.get_counter(&river).await.unwrap(), Some(5));
    assert_eq!(store.get_counter(&unique("Nile")).await.unwrap(), None);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_batches_and_kind_check() {
    let Some(store) = connect().await else { return };
    let (alloc, hits) = (unique("Alloc"), unique("Hits"));

    let gauges = vec![MetricRecord::gauge(alloc.as_str(), 1.0), MetricRecord::gauge(alloc.as_str(), 4.0)];
    store.set_gauge_batch(&gauges).await.unwrap();
    assert_eq!(store.get_gauge(&alloc).await.unwrap(), Some(4.0));

    let counters = vec![MetricRecord::counter(hits.as_str(), 2), MetricRecord::counter(hits.as_str(), 5)];
    store.add_counter_batch(&counters).await.unwrap();
    assert_eq!(store.get_counter(&hits).await.unwrap(), Some(7));

    let mixed = vec![MetricRecord::counter(hits.as_str(), 1), MetricRecord::gauge(alloc.as_str(), 9.0)];
    assert!(matches!(
        store.add_counter_batch(&mixed).await,
        Err(MonitorError::InvalidMetric(_))
    ));
    assert_eq!(store.get_counter(&hits).await.unwrap(), Some(7));
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_batch_rolls_back_without_retry() {
    let Some(store) = connect().await else { return };
    let (fresh, full) = (unique("Fresh"), unique("Full"));
    store.add_counter(&full, 1).await.unwrap();

    // Second row overflows BIGINT, which is not a connection error.
    let batch = vec![MetricRecord::counter(fresh.as_str(), 1), MetricRecord::counter(full.as_str(), i64::MAX)];
    let started = Instant::now();
    let result = store.add_counter_batch(&batch).await;

    assert!(matches!(result, Err(MonitorError::Database(_))));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(store.get_counter(&fresh).await.unwrap(), None);
    assert_eq!(store.get_counter(&full).await.unwrap(), Some(1));
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_non_finite_gauge_rejected() {
    let Some(store) = connect().await else { return };
    let weird = unique("Weird");

    assert!(matches!(
        store.set_gauge(&weird, f64::NAN).await,
        Err(MonitorError::InvalidMetric(_))
    ));
    let batch = vec![MetricRecord::gauge(weird.as_str(), f64::INFINITY)];
    assert!(store.set_gauge_batch(&batch).await.is_err());
    assert_eq!(store.get_gauge(&weird).await.unwrap(), None);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_dumps_read_their_own_table() {
    let Some(store) = connect().await else { return };
    let (cherry, poll) = (unique("Cherry"), unique("PollCount"));
    store.set_gauge(&cherry, 79.5).await.unwrap();
    store.add_counter(&poll, 42).await.unwrap();

    let gauges: BTreeMap<String, f64> = serde_json::from_str(&store.dump_gauges().await.unwrap()).unwrap();
    let counters: BTreeMap<String, i64> = serde_json::from_str(&store.dump_counters().await.unwrap()).unwrap();
    assert_eq!(gauges.get(&cherry), Some(&79.5));
    assert!(!gauges.contains_key(&poll));
    assert_eq!(counters.get(&poll), Some(&42));
    assert!(!counters.contains_key(&cherry));

    let dump = store.dump_gauges().await.unwrap();
    assert!(!dump.contains(' '), "dump should be compact: {}", dump);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_render_and_health() {
    let Some(store) = connect().await else { return };
    let cherry = unique("Cherry");
    store.set_gauge(&cherry, 79.0).await.unwrap();
    store.health_check().await.unwrap();

    let mut page = Vec::new();
    store.render_all_gauges(&mut page).await.unwrap();
    let page = String::from_utf8(page).unwrap();
    assert!(page.contains(&format!("<p>{}: 79</p>", cherry)), "{}", page);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let Some(store) = connect().await else { return };
    store.close().await.unwrap();
    store.close().await.unwrap();
    assert!(store.set_gauge("Apple", 1.0).await.is_err());
}

#[tokio::test]
async fn test_store_serves_after_shutdown_starts() {
    let Some(dsn) = dsn() else { return };
    let config = StorageConfig {
        database_dsn: Some(dsn),
        ..StorageConfig::in_memory()
    };
    let shutdown = CancellationToken::new();
    let collector = Collector::open(&config, &RetryConfig::default(), &shutdown)
        .await
        .unwrap();
    let store = collector.storage();
    assert_eq!(store.kind(), StoreKind::Relational);

    shutdown.cancel();
    let alloc = unique("Alloc");
    store.set_gauge(&alloc, 2.5).await.unwrap();
    assert_eq!(store.get_gauge(&alloc).await.unwrap(), Some(2.5));
    collector.close().await.unwrap();
}
