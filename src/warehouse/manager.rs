use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::Instrument;

use super::{Statement, WarehouseConnection, WarehouseConnector, WarehouseRow};
use crate::error::{DoraError, DoraResult};

type ConnectFuture = Shared<BoxFuture<'static, DoraResult<Arc<dyn WarehouseConnection>>>>;

enum ConnectionState {
    Idle,
    /// A connect attempt in flight; every caller awaits this same future
    Connecting(ConnectFuture),
    Connected(Arc<dyn WarehouseConnection>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub details: serde_json::Value,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Owns the single warehouse connection of the process.
///
/// The connection is opened lazily by the first caller. Concurrent callers share that one
/// attempt and all observe its outcome; a failed attempt leaves the manager idle so the next
/// call starts over.
pub struct ConnectionManager {
    connector: Arc<dyn WarehouseConnector>,
    state: Mutex<ConnectionState>,
    query_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn WarehouseConnector>, query_timeout: Duration) -> Self {
        Self {
            connector,
            state: Mutex::new(ConnectionState::Idle),
            query_timeout,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.lock_state(), ConnectionState::Connected(_))
    }

    /// Return the live connection, joining an in-flight attempt or starting a new one.
    pub async fn get_connection(&self) -> DoraResult<Arc<dyn WarehouseConnection>> {
        let pending = {
            let mut state = self.lock_state();
            let in_flight = match &*state {
                ConnectionState::Connected(conn) => return Ok(Arc::clone(conn)),
                ConnectionState::Connecting(attempt) => Some(attempt.clone()),
                ConnectionState::Idle => None,
            };
            if let Some(attempt) = in_flight {
                attempt
            } else {
                tracing::debug!("opening warehouse connection");
                let connector = Arc::clone(&self.connector);
                let attempt = async move { connector.connect().await }.boxed().shared();
                *state = ConnectionState::Connecting(attempt.clone());
                attempt
            }
        };

        let result = pending.clone().await;

        let mut state = self.lock_state();
        let settles_this_attempt =
            matches!(&*state, ConnectionState::Connecting(current) if current.ptr_eq(&pending));
        if settles_this_attempt {
            *state = match &result {
                Ok(conn) => {
                    tracing::info!("warehouse connection established");
                    ConnectionState::Connected(Arc::clone(conn))
                }
                Err(e) => {
                    tracing::error!(error = %e, "warehouse connection failed");
                    ConnectionState::Idle
                }
            };
        }
        result
    }

    /// Drop the cached connection if it is still `conn`
    fn invalidate(&self, conn: &Arc<dyn WarehouseConnection>) {
        let mut state = self.lock_state();
        let is_current =
            matches!(&*state, ConnectionState::Connected(current) if Arc::ptr_eq(current, conn));
        if is_current {
            tracing::warn!("discarding broken warehouse connection");
            *state = ConnectionState::Idle;
        }
    }

    /// Execute one statement under the configured time budget.
    pub async fn execute(&self, statement: &Statement) -> DoraResult<Vec<WarehouseRow>> {
        let span = tracing::debug_span!(
            "warehouse_query",
            kind = statement.kind,
            organization = statement.organization.as_deref().unwrap_or("-"),
        );

        async {
            let conn = self.get_connection().await?;
            let started = Instant::now();

            match tokio::time::timeout(self.query_timeout, conn.execute(statement)).await {
                Err(_) => {
                    tracing::warn!(
                        timeout_secs = self.query_timeout.as_secs(),
                        "warehouse query timed out"
                    );
                    Err(DoraError::Timeout(format!(
                        "`{}` did not finish within {}s",
                        statement.kind,
                        self.query_timeout.as_secs()
                    )))
                }
                Ok(Err(e)) => {
                    if e.is_connection_failure() {
                        self.invalidate(&conn);
                    }
                    tracing::warn!(error = %e, "warehouse query failed");
                    Err(e)
                }
                Ok(Ok(rows)) => {
                    tracing::debug!(
                        rows = rows.len(),
                        elapsed_ms = started.elapsed().as_millis(),
                        "warehouse query finished"
                    );
                    Ok(rows)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Connect and run a trivial catalog/schema probe. Never fails.
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let probe = Statement::new(
            "health_probe",
            "SELECT current_catalog() AS catalog, current_schema() AS schema",
        );

        match self.execute(&probe).await {
            Ok(rows) => {
                let row = rows.into_iter().next().unwrap_or_default();
                HealthReport {
                    status: HealthStatus::Healthy,
                    details: json!({
                        "catalog": row.get_string("catalog"),
                        "schema": row.get_string("schema"),
                        "latency_ms": started.elapsed().as_millis(),
                    }),
                }
            }
            Err(e) => HealthReport {
                status: HealthStatus::Unhealthy,
                details: json!({
                    "error": e.to_string(),
                    "code": e.code(),
                }),
            },
        }
    }

    /// Release the connection. Safe to call any number of times.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), ConnectionState::Idle);
        if let ConnectionState::Connected(conn) = previous {
            conn.close().await;
            tracing::info!("warehouse connection closed");
        }
    }
}
