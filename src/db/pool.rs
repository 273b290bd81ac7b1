//! The connection pool.
//!
//! A pool binds at most one connection to an execution context — a
//! [`capture_scope`], or the calling thread outside of any scope —
//! for the duration of a capture. Captures nest: re-capturing from the
//! same context yields the same connection. The pool mutex guards only
//! map and list operations, never I/O; liveness probes run with the
//! lock released.

use super::{DbConnection, DbPoolConfig};
use crate::telemetry::{self, Metric};
use crate::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

tokio::task_local! {
    /// Identity of the capturing execution context; see
    /// [`capture_scope`].
    static CAPTURE_KEY: u64;
}

static NEXT_CAPTURE_KEY: AtomicU64 = AtomicU64::new(1);

/// Run `fut` in its own capture scope.
///
/// Every `capture` inside the scope resolves to the same pool
/// connection, the way one coroutine quantum holds one connection.
/// Wrap each request handler (or any other unit that should share a
/// connection) in a scope of its own.
pub async fn capture_scope<F: Future>(fut: F) -> F::Output {
    let key = NEXT_CAPTURE_KEY.fetch_add(1, Ordering::Relaxed);
    CAPTURE_KEY.scope(key, fut).await
}

/// The ambient capture key: the enclosing [`capture_scope`], or a
/// thread-derived key outside of any scope.
fn capture_key() -> u64 {
    CAPTURE_KEY.try_with(|key| *key).unwrap_or_else(|_| {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish()
    })
}

type DbConnector = Arc<dyn Fn(&DbPoolConfig) -> Result<Arc<dyn DbConnection>> + Send + Sync>;

#[derive(Default)]
struct PoolState {
    captured: HashMap<u64, Arc<dyn DbConnection>>,
    idle: Vec<Arc<dyn DbConnection>>,
}

/// A named pool of driver connections with capture affinity.
pub struct DbConnectionPool {
    name: String,
    config: DbPoolConfig,
    connector: DbConnector,
    state: Mutex<PoolState>,

    pub metric_sum_connections: Arc<Metric>,
    pub metric_success_query_count: Arc<Metric>,
    pub metric_fail_query_count: Arc<Metric>,
    pub metric_avg_query_per_sec: Arc<Metric>,
    pub metric_avg_execution_time: Arc<Metric>,
}

impl std::fmt::Debug for DbConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnectionPool")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl DbConnectionPool {
    /// Build a pool whose connections come from `connector`.
    ///
    /// Connectivity is probed lazily: `connector` constructs the
    /// driver object, and only the `alive` checks on the capture path
    /// decide whether it is usable.
    pub fn new(
        config: DbPoolConfig,
        connector: impl Fn(&DbPoolConfig) -> Result<Arc<dyn DbConnection>> + Send + Sync + 'static,
    ) -> Arc<DbConnectionPool> {
        let name = if config.name.is_empty() {
            "_db_pool".to_string()
        } else {
            config.name.clone()
        };

        let pool = Arc::new(DbConnectionPool {
            metric_sum_connections: telemetry::metric_counted(
                &format!("db/{name}/connections/count"),
                1,
            ),
            metric_success_query_count: telemetry::metric_counted(&format!("db/{name}/queries"), 1),
            metric_fail_query_count: telemetry::metric_counted(&format!("db/{name}/errors"), 1),
            metric_avg_query_per_sec: telemetry::metric_windowed(
                &format!("db/{name}/queries_per_second"),
                Duration::from_secs(15),
            ),
            metric_avg_execution_time: telemetry::metric_windowed(
                &format!("db/{name}/queries_exec_time"),
                Duration::from_secs(15),
            ),
            name,
            config,
            connector: Arc::new(connector),
            state: Mutex::new(PoolState::default()),
        });
        debug!(pool = %pool.name, "connection pool created");
        pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ensure at least one idle connection exists.
    pub fn touch(&self) -> Result<()> {
        let needs_one = {
            let state = self.state.lock().unwrap();
            state.captured.is_empty() && state.idle.is_empty()
        };
        if needs_one {
            let conn = self.create()?;
            self.state.lock().unwrap().idle.insert(0, conn);
        }
        Ok(())
    }

    /// Capture a connection for the current execution context.
    ///
    /// Reuses the context's already captured connection when it is
    /// still alive, otherwise pulls idle connections (dropping dead
    /// ones) and finally constructs a fresh one.
    pub async fn capture(&self) -> Result<Arc<dyn DbConnection>> {
        let key = capture_key();

        let already = {
            let state = self.state.lock().unwrap();
            state.captured.get(&key).cloned()
        };
        if let Some(conn) = already {
            trace!(pool = %self.name, id = conn.id(), "re-capture, checking alive");
            if conn.alive().await {
                return Ok(conn);
            }
            let mut state = self.state.lock().unwrap();
            state.captured.remove(&key);
        }

        loop {
            let candidate = {
                let mut state = self.state.lock().unwrap();
                if state.idle.is_empty() {
                    None
                } else {
                    Some(state.idle.remove(0))
                }
            };
            let Some(conn) = candidate else { break };
            if conn.alive().await {
                trace!(pool = %self.name, id = conn.id(), "capture from pool");
                let mut state = self.state.lock().unwrap();
                state.captured.insert(key, conn.clone());
                return Ok(conn);
            }
            debug!(pool = %self.name, id = conn.id(), "dropping dead idle connection");
        }

        let conn = self.create()?;
        trace!(pool = %self.name, id = conn.id(), "capture new");
        let mut state = self.state.lock().unwrap();
        state.captured.insert(key, conn.clone());
        Ok(conn)
    }

    /// Return the current context's connection to the idle list.
    ///
    /// A connection released with a transaction still open is rolled
    /// back first; that is an internal error worth a warning.
    pub async fn release(&self) {
        let key = capture_key();
        let conn = {
            let mut state = self.state.lock().unwrap();
            state.captured.remove(&key)
        };
        let Some(conn) = conn else { return };

        if conn.in_transaction() {
            warn!(
                pool = %self.name,
                id = conn.id(),
                "releasing connection with an open transaction"
            );
            while conn.in_transaction() {
                if conn.rollback().await.is_err() {
                    // The connection is unusable; do not pool it.
                    return;
                }
            }
        }

        trace!(pool = %self.name, id = conn.id(), "released into pool");
        self.state.lock().unwrap().idle.insert(0, conn);
    }

    /// Bind an explicitly handed-over connection to this context.
    pub fn attach(&self, conn: Arc<dyn DbConnection>) -> Result<()> {
        let key = capture_key();
        let mut state = self.state.lock().unwrap();
        if state.captured.contains_key(&key) {
            return Err(Error::Handler(
                "context already has an attached database connection".into(),
            ));
        }
        trace!(pool = %self.name, id = conn.id(), "attached");
        state.captured.insert(key, conn);
        Ok(())
    }

    /// Unbind the context's connection for hand-off, without pooling it.
    pub fn detach(&self) -> Result<Arc<dyn DbConnection>> {
        let key = capture_key();
        let mut state = self.state.lock().unwrap();
        match state.captured.remove(&key) {
            Some(conn) => {
                trace!(pool = %self.name, id = conn.id(), "detached");
                Ok(conn)
            }
            None => Err(Error::Handler(
                "context has no attached database connection".into(),
            )),
        }
    }

    /// Run a statement on a captured connection with telemetry
    /// accounting.
    pub async fn query(&self, conn: &Arc<dyn DbConnection>, statement: &str) -> Result<u64> {
        let started = Instant::now();
        let result = conn.query(statement).await;
        self.metric_avg_query_per_sec.add_value(1.0);
        self.metric_avg_execution_time
            .add_value(started.elapsed().as_secs_f64());
        match &result {
            Ok(_) => self.metric_success_query_count.add_value(1.0),
            Err(_) => self.metric_fail_query_count.add_value(1.0),
        }
        result
    }

    fn create(&self) -> Result<Arc<dyn DbConnection>> {
        let conn = (self.connector)(&self.config)?;
        self.metric_sum_connections.add_value(1.0);
        Ok(conn)
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.state.lock().unwrap().idle.len()
    }
}
