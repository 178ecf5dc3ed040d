//! Agent reporting to a live collector over loopback.

mod common;

use common::ScriptedSource;
use monitor_lib::core::{AgentConfig, RetryConfig, SigningKey, StorageConfig};
use monitor_lib::server::router;
use monitor_lib::storage;
use monitor_lib::telemetry::{HttpReporter, Observer};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_agent_reports_to_collector() {
    let key = SigningKey::new(b"shared secret".to_vec());
    let shutdown = CancellationToken::new();

    let store = storage::open(&StorageConfig::in_memory(), &RetryConfig::none(), shutdown.clone())
        .await
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let app = router(Arc::clone(&store), key.clone());
    let collector = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
    });

    let config = AgentConfig {
        server_address: address.clone(),
        poll_interval: Duration::from_millis(20),
        report_interval: Duration::from_millis(40),
        sign_key: key,
        rate_limit: 2,
        ..AgentConfig::default()
    };
    let (source, _) = ScriptedSource::new();
    let reporter = Arc::new(HttpReporter::new(&address).unwrap());
    let agent = tokio::spawn(
        Observer::new(config, Box::new(source), reporter)
            .unwrap()
            .with_retry(RetryConfig::immediate(1))
            .observe(shutdown.clone()),
    );

    let mut polls = None;
    for _ in 0..100 {
        if let Some(count) = store.get_counter("PollCount").await.unwrap() {
            if count >= 4 {
                polls = Some(count);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.cancel();
    agent.await.unwrap().unwrap();
    collector.await.unwrap().unwrap();

    let polls = polls.expect("collector should receive PollCount");
    assert_eq!(polls % 2, 0);
    assert!(store.get_gauge("TotalMemory").await.unwrap().is_some());
    assert_eq!(store.get_gauge("CPUutilization0").await.unwrap(), Some(12.5));
    store.close().await.unwrap();
}
