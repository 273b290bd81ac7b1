//! Database access: driver contract, connection pooling, pool registry.

use crate::{Error, Result};
use async_trait::async_trait;

pub mod manager;
pub mod null;
pub mod pool;

pub use manager::DbManager;
pub use null::NullDbConnection;
pub use pool::DbConnectionPool;

/// Contract a database driver implements per connection.
///
/// Transaction state is tracked by the driver; the pool only promises
/// that a released connection has no transaction left open.
#[async_trait]
pub trait DbConnection: Send + Sync {
    fn id(&self) -> u64;

    /// Liveness probe; dead connections are dropped by the pool.
    async fn alive(&self) -> bool;

    /// Execute a statement, returning the affected/fetched row count.
    /// Use [`DbConnectionPool::query`] to get telemetry accounting.
    async fn query(&self, statement: &str) -> Result<u64>;

    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    fn in_transaction(&self) -> bool;
}

/// Where a pool's driver should connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbAddress {
    Socket(String),
    Server { host: String, port: u16 },
}

/// Configuration of a connection pool, dispatched on `kind` through
/// the pool factory.
#[derive(Debug, Clone, Default)]
pub struct DbPoolConfig {
    pub name: String,
    /// The `type` discriminator the factory dispatches on.
    pub kind: String,
    pub dbsocket: Option<String>,
    pub dbserver: Option<String>,
    pub dbport: Option<u16>,
    pub dbname: Option<String>,
    pub dbuser: Option<String>,
    pub dbpass: Option<String>,
    /// Ask the driver for its asynchronous API, when it has one.
    pub async_api: bool,
    pub dbcharset: Option<String>,
    pub dbtimezone: Option<String>,
}

impl DbPoolConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        DbPoolConfig {
            name: name.into(),
            kind: kind.into(),
            ..DbPoolConfig::default()
        }
    }

    /// The configured endpoint: either `dbsocket`, or `dbserver` plus
    /// `dbport`. Drivers that speak to a real server call this.
    pub fn address(&self) -> Result<DbAddress> {
        if let Some(ref socket) = self.dbsocket {
            return Ok(DbAddress::Socket(socket.clone()));
        }
        match (&self.dbserver, self.dbport) {
            (Some(host), Some(port)) => Ok(DbAddress::Server {
                host: host.clone(),
                port,
            }),
            _ => Err(Error::Config(format!(
                "pool `{}` needs dbsocket, or dbserver and dbport",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_resolution() {
        let mut config = DbPoolConfig::new("p", "null");
        assert!(config.address().is_err());

        config.dbserver = Some("db.local".into());
        assert!(config.address().is_err());

        config.dbport = Some(3306);
        assert_eq!(
            config.address().unwrap(),
            DbAddress::Server {
                host: "db.local".into(),
                port: 3306
            }
        );

        config.dbsocket = Some("/run/db.sock".into());
        assert_eq!(
            config.address().unwrap(),
            DbAddress::Socket("/run/db.sock".into())
        );
    }
}
