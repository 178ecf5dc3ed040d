//! PostgreSQL metric store.
//!
//! One connection, eight statements prepared up front. Every operation runs
//! through the retry executor; only connection-exception failures (SQLSTATE
//! class `08`, or a closed connection) are retried.

use super::{check_batch, render, MetricStorage, StoreKind};
use crate::core::{
    check_gauge, retry_with_config, Counter, Failure, Gauge, MetricKind, MetricRecord, MetricValue,
    MonitorError, Result, RetryConfig, RetryExt,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;
use tokio::sync::{MappedMutexGuard, MutexGuard};
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Statement};
use tokio_util::sync::CancellationToken;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS gauge (
        name  TEXT PRIMARY KEY,
        value DOUBLE PRECISION NOT NULL
    );
    CREATE TABLE IF NOT EXISTS counter (
        name  TEXT PRIMARY KEY,
        value BIGINT NOT NULL
    );
";

const SET_GAUGE: &str = "INSERT INTO gauge (name, value) VALUES ($1, $2) \
     ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value";
const ADD_COUNTER: &str = "INSERT INTO counter (name, value) VALUES ($1, $2) \
     ON CONFLICT (name) DO UPDATE SET value = counter.value + EXCLUDED.value";
const GET_GAUGE: &str = "SELECT value FROM gauge WHERE name = $1";
const GET_COUNTER: &str = "SELECT value FROM counter WHERE name = $1";
const DUMP_GAUGES: &str = "SELECT COALESCE(json_object_agg(name, value), '{}'::json)::text FROM gauge";
const DUMP_COUNTERS: &str = "SELECT COALESCE(json_object_agg(name, value), '{}'::json)::text FROM counter";
const LIST_GAUGES: &str = "SELECT name, value FROM gauge ORDER BY name";
const LIST_COUNTERS: &str = "SELECT name, value FROM counter ORDER BY name";

struct Statements {
    set_gauge: Statement,
    add_counter: Statement,
    get_gauge: Statement,
    get_counter: Statement,
    dump_gauges: Statement,
    dump_counters: Statement,
    list_gauges: Statement,
    list_counters: Statement,
}

impl Statements {
    async fn prepare(client: &Client) -> std::result::Result<Self, Failure<MonitorError>> {
        Ok(Self {
            set_gauge: client.prepare(SET_GAUGE).await.map_err(classify)?,
            add_counter: client.prepare(ADD_COUNTER).await.map_err(classify)?,
            get_gauge: client.prepare(GET_GAUGE).await.map_err(classify)?,
            get_counter: client.prepare(GET_COUNTER).await.map_err(classify)?,
            dump_gauges: client.prepare(DUMP_GAUGES).await.map_err(classify)?,
            dump_counters: client.prepare(DUMP_COUNTERS).await.map_err(classify)?,
            list_gauges: client.prepare(LIST_GAUGES).await.map_err(classify)?,
            list_counters: client.prepare(LIST_COUNTERS).await.map_err(classify)?,
        })
    }
}

// Field order matters: statements are released before the client.
struct Session {
    statements: Statements,
    client: Client,
}

type SqlResult<T> = std::result::Result<T, Failure<MonitorError>>;

/// Tag a driver error: connection exceptions are retriable, everything else
/// (syntax, constraint violation, type mismatch) is terminal.
fn classify(error: tokio_postgres::Error) -> Failure<MonitorError> {
    let retriable = is_retriable(error.is_closed(), error.code());
    let error = MonitorError::from(error);
    if retriable {
        error.retriable()
    } else {
        error.terminal()
    }
}

fn is_retriable(closed: bool, state: Option<&SqlState>) -> bool {
    closed || state.map_or(false, |state| state.code().starts_with("08"))
}

/// Relational metric store.
pub struct PgStorage {
    session: tokio::sync::Mutex<Option<Session>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl PgStorage {
    /// Connect, create the tables if missing, and prepare all statements.
    pub async fn connect(dsn: &str, retry: RetryConfig, cancel: CancellationToken) -> Result<Self> {
        let mut config: tokio_postgres::Config = dsn.parse()?;
        if config.get_connect_timeout().is_none() {
            config.connect_timeout(DEFAULT_CONNECT_TIMEOUT);
        }

        let config = &config;
        let (client, connection) = retry_with_config(&retry, &cancel, move || async move {
            config
                .connect(NoTls)
                .await
                .map_err(|e| MonitorError::from(e).retriable())
        })
        .await?;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "Database connection terminated");
            }
        });

        let client_ref = &client;
        retry_with_config(&retry, &cancel, move || async move {
            client_ref.batch_execute(SCHEMA).await.map_err(classify)
        })
        .await?;
        let statements =
            retry_with_config(&retry, &cancel, move || Statements::prepare(client_ref)).await?;

        tracing::debug!("Prepared metric statements");

        Ok(Self {
            session: tokio::sync::Mutex::new(Some(Session { statements, client })),
            driver: Mutex::new(Some(driver)),
            retry,
            cancel,
        })
    }

    async fn session(&self) -> SqlResult<MappedMutexGuard<'_, Session>> {
        MutexGuard::try_map(self.session.lock().await, Option::as_mut)
            .map_err(|_| MonitorError::storage("database connection is closed").terminal())
    }

    async fn with_retry<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = SqlResult<T>>,
    {
        Ok(retry_with_config(&self.retry, &self.cancel, operation).await?)
    }

    async fn write_batch(&self, batch: &[MetricRecord], kind: MetricKind) -> Result<()> {
        check_batch(batch, kind)?;

        let this = self;
        self.with_retry(move || async move {
            let mut session = this.session().await?;
            let Session { statements, client } = &mut *session;
            let tx = client.transaction().await.map_err(classify)?;
            for record in batch {
                match record.value {
                    MetricValue::Gauge(value) => {
                        tx.execute(&statements.set_gauge, &[&record.id, &value])
                            .await
                            .map_err(classify)?;
                    },
                    MetricValue::Counter(delta) => {
                        tx.execute(&statements.add_counter, &[&record.id, &delta])
                            .await
                            .map_err(classify)?;
                    },
                }
            }
            tx.commit().await.map_err(classify)
        })
        .await
    }

    async fn dump<V>(&self, pick: fn(&Statements) -> &Statement) -> Result<String>
    where
        V: serde::de::DeserializeOwned + serde::Serialize,
    {
        let this = self;
        let raw: String = self
            .with_retry(move || async move {
                let session = this.session().await?;
                let row = session
                    .client
                    .query_one(pick(&session.statements), &[])
                    .await
                    .map_err(classify)?;
                row.try_get::<_, String>(0).map_err(classify)
            })
            .await?;

        // Re-encode so both backends produce the same compact form.
        let entries: BTreeMap<String, V> = serde_json::from_str(&raw)?;
        Ok(serde_json::to_string(&entries)?)
    }

    async fn list<V>(&self, pick: fn(&Statements) -> &Statement) -> Result<Vec<(String, V)>>
    where
        V: for<'a> tokio_postgres::types::FromSql<'a>,
    {
        let this = self;
        self.with_retry(move || async move {
            let session = this.session().await?;
            let rows = session
                .client
                .query(pick(&session.statements), &[])
                .await
                .map_err(classify)?;
            rows.iter()
                .map(|row| -> SqlResult<(String, V)> {
                    Ok((row.try_get(0).map_err(classify)?, row.try_get(1).map_err(classify)?))
                })
                .collect::<SqlResult<Vec<_>>>()
        })
        .await
    }
}

#[async_trait::async_trait]
impl MetricStorage for PgStorage {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    async fn set_gauge(&self, id: &str, value: Gauge) -> Result<()> {
        check_gauge(id, value)?;
        let this = self;
        self.with_retry(move || async move {
            let session = this.session().await?;
            session
                .client
                .execute(&session.statements.set_gauge, &[&id, &value])
                .await
                .map_err(classify)?;
            Ok::<_, Failure<MonitorError>>(())
        })
        .await
    }

    async fn set_gauge_batch(&self, batch: &[MetricRecord]) -> Result<()> {
        self.write_batch(batch, MetricKind::Gauge).await
    }

    async fn add_counter(&self, id: &str, delta: Counter) -> Result<()> {
        let this = self;
        self.with_retry(move || async move {
            let session = this.session().await?;
            session
                .client
                .execute(&session.statements.add_counter, &[&id, &delta])
                .await
                .map_err(classify)?;
            Ok::<_, Failure<MonitorError>>(())
        })
        .await
    }

    async fn add_counter_batch(&self, batch: &[MetricRecord]) -> Result<()> {
        self.write_batch(batch, MetricKind::Counter).await
    }

    async fn get_gauge(&self, id: &str) -> Result<Option<Gauge>> {
        let this = self;
        self.with_retry(move || async move {
            let session = this.session().await?;
            let row = session
                .client
                .query_opt(&session.statements.get_gauge, &[&id])
                .await
                .map_err(classify)?;
            row.map(|row| row.try_get::<_, Gauge>(0).map_err(classify))
                .transpose()
        })
        .await
    }

    async fn get_counter(&self, id: &str) -> Result<Option<Counter>> {
        let this = self;
        self.with_retry(move || async move {
            let session = this.session().await?;
            let row = session
                .client
                .query_opt(&session.statements.get_counter, &[&id])
                .await
                .map_err(classify)?;
            row.map(|row| row.try_get::<_, Counter>(0).map_err(classify))
                .transpose()
        })
        .await
    }

    async fn dump_gauges(&self) -> Result<String> {
        self.dump::<Gauge>(|s| &s.dump_gauges).await
    }

    async fn dump_counters(&self) -> Result<String> {
        self.dump::<Counter>(|s| &s.dump_counters).await
    }

    async fn render_all_gauges(&self, sink: &mut (dyn Write + Send)) -> Result<()> {
        let rows = self.list::<Gauge>(|s| &s.list_gauges).await?;
        render::render_entries(rows.iter().map(|(name, value)| (name.as_str(), value)), sink)
    }

    async fn render_all_counters(&self, sink: &mut (dyn Write + Send)) -> Result<()> {
        let rows = self.list::<Counter>(|s| &s.list_counters).await?;
        render::render_entries(rows.iter().map(|(name, value)| (name.as_str(), value)), sink)
    }

    async fn health_check(&self) -> Result<()> {
        let this = self;
        self.with_retry(move || async move {
            let session = this.session().await?;
            session.client.batch_execute("SELECT 1").await.map_err(classify)
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        drop(session);

        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            driver.await?;
        }
        tracing::info!("Closed database connection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_exceptions_are_retriable() {
        assert!(is_retriable(true, None));
        assert!(is_retriable(false, Some(&SqlState::CONNECTION_EXCEPTION)));
        assert!(is_retriable(false, Some(&SqlState::CONNECTION_FAILURE)));
        assert!(is_retriable(false, Some(&SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION)));

        assert!(!is_retriable(false, None));
        assert!(!is_retriable(false, Some(&SqlState::UNIQUE_VIOLATION)));
        assert!(!is_retriable(false, Some(&SqlState::NUMERIC_VALUE_OUT_OF_RANGE)));
        assert!(!is_retriable(false, Some(&SqlState::SYNTAX_ERROR)));
    }

    #[tokio::test]
    async fn test_invalid_dsn_is_rejected_without_retry() {
        let result = PgStorage::connect("port=notanumber", RetryConfig::default(), CancellationToken::new()).await;
        assert!(matches!(result, Err(MonitorError::Database(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_exhausts_retries() {
        let started = std::time::Instant::now();
        let result = PgStorage::connect(
            "host=127.0.0.1 port=1 user=nobody connect_timeout=1",
            RetryConfig::immediate(2),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(MonitorError::Database(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_connect_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = PgStorage::connect("host=127.0.0.1 port=1", RetryConfig::default(), cancel).await;
        assert!(matches!(result, Err(MonitorError::Cancelled)));
    }
}
