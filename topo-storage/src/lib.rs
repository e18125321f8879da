//! Versioned topology datastore, connection pool, and fatal-failure escalation.

pub mod datastore;
pub mod fatal;
pub mod pool;

use std::sync::Arc;

use datastore::InMemoryDatastore;
use fatal::FatalOnce;
use pool::ConnectionPool;
use topo_common::config::RuntimeConfig;

/// Storage subsystem bootstrap module.
#[derive(Debug, Clone)]
pub struct StorageModule {
    /// Backing datastore shared by every connection.
    pub datastore: Arc<InMemoryDatastore>,
    /// Connection pool handing out purpose-tagged connections.
    pub pool: ConnectionPool,
    /// Process-wide fatal failure latch.
    pub fatal: Arc<FatalOnce>,
}

impl StorageModule {
    /// Creates the storage module over an empty datastore.
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        let datastore = Arc::new(InMemoryDatastore::new());
        let pool = ConnectionPool::new(Arc::clone(&datastore), config);
        Self {
            datastore,
            pool,
            fatal: Arc::new(FatalOnce::new()),
        }
    }
}
