//! A driver that talks to nothing.
//!
//! Used by tests and as a stand-in pool type where a deployment has no
//! database wired up. Statements succeed with zero rows; transactions
//! are counted but touch nothing.

use super::DbConnection;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Connections declared dead through [`NullDbConnection::kill`].
static KILLED: LazyLock<Mutex<HashSet<u64>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

#[derive(Debug)]
pub struct NullDbConnection {
    id: u64,
    transaction_depth: AtomicU32,
}

impl NullDbConnection {
    pub fn create() -> Arc<dyn DbConnection> {
        Arc::new(NullDbConnection {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            transaction_depth: AtomicU32::new(0),
        })
    }

    /// Declare a connection dead; its next `alive` probe fails.
    pub fn kill(id: u64) {
        KILLED.lock().unwrap().insert(id);
    }
}

#[async_trait]
impl DbConnection for NullDbConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn alive(&self) -> bool {
        !KILLED.lock().unwrap().contains(&self.id)
    }

    async fn query(&self, _statement: &str) -> Result<u64> {
        Ok(0)
    }

    async fn begin(&self) -> Result<()> {
        self.transaction_depth.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.transaction_depth.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.transaction_depth.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.transaction_depth.load(Ordering::SeqCst) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transaction_depth() {
        let conn = NullDbConnection::create();
        assert!(!conn.in_transaction());
        conn.begin().await.unwrap();
        conn.begin().await.unwrap();
        assert!(conn.in_transaction());
        conn.commit().await.unwrap();
        assert!(conn.in_transaction());
        conn.rollback().await.unwrap();
        assert!(!conn.in_transaction());
    }

    #[tokio::test]
    async fn test_kill_marks_dead() {
        let conn = NullDbConnection::create();
        assert!(conn.alive().await);
        NullDbConnection::kill(conn.id());
        assert!(!conn.alive().await);
    }
}
