//! Scripted in-process warehouse for tests and local demos.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{Statement, WarehouseConnection, WarehouseConnector, WarehouseRow};
use crate::error::{DoraError, DoraResult};

type Responder = dyn Fn(&Statement) -> DoraResult<Vec<WarehouseRow>> + Send + Sync;

struct FakeState {
    responder: Box<Responder>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    failing_connects: AtomicUsize,
    connect_delay_ms: AtomicU64,
    query_delay_ms: AtomicU64,
    executed: Mutex<Vec<Statement>>,
}

/// A warehouse whose answers come from a closure over the executed statement.
///
/// Clones share state, so a test can keep one handle for assertions and hand another to
/// the connection manager.
#[derive(Clone)]
pub struct FakeWarehouse {
    state: Arc<FakeState>,
}

impl FakeWarehouse {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&Statement) -> DoraResult<Vec<WarehouseRow>> + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(FakeState {
                responder: Box::new(responder),
                connects: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                failing_connects: AtomicUsize::new(0),
                connect_delay_ms: AtomicU64::new(0),
                query_delay_ms: AtomicU64::new(0),
                executed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A warehouse that answers every statement with zero rows
    pub fn empty() -> Self {
        Self::new(|_| Ok(Vec::new()))
    }

    #[must_use]
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.state
            .connect_delay_ms
            .store(millis(delay), Ordering::SeqCst);
        self
    }

    #[must_use]
    pub fn with_query_delay(self, delay: Duration) -> Self {
        self.state.query_delay_ms.store(millis(delay), Ordering::SeqCst);
        self
    }

    /// Make the next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: usize) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Every statement executed so far, in order
    pub fn executed(&self) -> Vec<Statement> {
        self.state
            .executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn executed_kinds(&self) -> Vec<&'static str> {
        self.executed().iter().map(|s| s.kind).collect()
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl WarehouseConnector for FakeWarehouse {
    async fn connect(&self) -> DoraResult<Arc<dyn WarehouseConnection>> {
        let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let failing = self.state.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.state
                .failing_connects
                .store(failing - 1, Ordering::SeqCst);
            return Err(DoraError::Connection("fake warehouse refused".to_string()));
        }

        Ok(Arc::new(FakeConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeConnection {
    state: Arc<FakeState>,
}

#[async_trait]
impl WarehouseConnection for FakeConnection {
    async fn execute(&self, statement: &Statement) -> DoraResult<Vec<WarehouseRow>> {
        self.state
            .executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(statement.clone());

        let delay = self.state.query_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        (self.state.responder)(statement)
    }

    async fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}
