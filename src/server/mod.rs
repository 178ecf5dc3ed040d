//! Collector HTTP surface.
//!
//! Accepts metric updates from agents and serves them back, backed by any
//! [`MetricStorage`].

pub mod handlers;
pub mod signing;

use crate::core::{MonitorError, Result, RetryConfig, SigningKey, StorageConfig};
use crate::storage::{self, MetricStorage};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, decompression::RequestDecompressionLayer, trace::TraceLayer,
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn MetricStorage>,
}

/// Build the collector router.
pub fn router(storage: Arc<dyn MetricStorage>, key: SigningKey) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/ping", get(handlers::ping))
        .route("/update/", post(handlers::update))
        .route("/update/:kind/:name/:value", post(handlers::update_legacy))
        .route("/updates/", post(handlers::updates))
        .route("/value/", post(handlers::value))
        .route("/value/:kind/:name", get(handlers::value_legacy))
        .with_state(AppState { storage })
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(key, signing::signature))
                .layer(RequestDecompressionLayer::new())
                .layer(CompressionLayer::new()),
        )
}

/// Serve `storage` on `address` until `cancel` fires.
///
/// In-flight requests are drained before returning. The store is left open;
/// closing it is up to the caller.
pub async fn serve(
    address: &str,
    storage: Arc<dyn MetricStorage>,
    key: SigningKey,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(address).await.map_err(|e| {
        MonitorError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to bind to {}: {}", address, e),
        ))
    })?;
    tracing::info!(
        "Collector listening on http://{} ({} storage)",
        listener.local_addr()?,
        storage.kind().as_str()
    );

    axum::serve(listener, router(storage, key))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    tracing::info!("Collector stopped accepting requests");
    Ok(())
}

/// A collector's metric store and the token that stops its background work.
///
/// The store token is not the shutdown token: requests still draining after
/// shutdown starts must reach a live store. It is cancelled by [`close`].
///
/// [`close`]: Collector::close
pub struct Collector {
    storage: Arc<dyn MetricStorage>,
    store_cancel: CancellationToken,
}

impl Collector {
    /// Open the store. `shutdown` only aborts the open itself.
    pub async fn open(
        config: &StorageConfig,
        retry: &RetryConfig,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let store_cancel = CancellationToken::new();
        let store = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Err(MonitorError::Cancelled),
            opened = storage::open(config, retry, store_cancel.clone()) => opened?,
        };
        Ok(Self {
            storage: store,
            store_cancel,
        })
    }

    pub fn storage(&self) -> Arc<dyn MetricStorage> {
        Arc::clone(&self.storage)
    }

    /// Serve the store on `address` until `shutdown` fires.
    pub async fn serve(&self, address: &str, key: SigningKey, shutdown: CancellationToken) -> Result<()> {
        serve(address, self.storage(), key, shutdown).await
    }

    /// Stop background work and close the store.
    pub async fn close(self) -> Result<()> {
        self.store_cancel.cancel();
        self.storage.close().await
    }
}
