//! Datastore connection pool.
//!
//! Connections are tagged by purpose. The northbound and southbound read-write connections are
//! process-wide singletons, read-only connections are drawn from a pool bounded by
//! `RuntimeConfig::max_read_connections`. A checkout is keyed by the caller's [`OwnerTag`]; a
//! second checkout by the same owner before release returns the same connection.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use topo_common::config::RuntimeConfig;
use topo_common::error::{TopoError, TopoResult};
use topo_common::ids::{ConnectionLimit, OwnerTag};
use topo_core::containers::HotMap as HashMap;
use topo_core::key::{KeyType, TopoKey};
use topo_core::value::Row;
use topo_core::version::DatastoreVersion;
use tracing::{debug, warn};

use crate::datastore::{FaultPoint, InMemoryDatastore};

/// What a connection may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPurpose {
    /// Reads only; pooled up to the configured maximum.
    ReadOnly,
    /// Northbound configuration writes; singleton.
    RwNorthbound,
    /// Southbound state and audit writes; singleton.
    RwSouthbound,
}

impl ConnectionPurpose {
    /// Lowercase label used in logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::RwNorthbound => "rw-northbound",
            Self::RwSouthbound => "rw-southbound",
        }
    }

    /// Returns whether this purpose permits writes.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

impl fmt::Display for ConnectionPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One datastore connection.
///
/// Every primitive first checks the handle: a broken connection refuses work with
/// `TopoError::DbAccess`, and any connection-level failure marks the handle broken so the pool
/// drops it at checkin.
#[derive(Debug)]
pub struct DbConnection {
    id: u64,
    purpose: ConnectionPurpose,
    store: Arc<InMemoryDatastore>,
    broken: AtomicBool,
}

impl DbConnection {
    fn open(id: u64, purpose: ConnectionPurpose, store: Arc<InMemoryDatastore>) -> TopoResult<Self> {
        store.check_fault(FaultPoint::Connect)?;
        Ok(Self {
            id,
            purpose,
            store,
            broken: AtomicBool::new(false),
        })
    }

    /// Pool-unique connection id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Purpose this connection was opened for.
    #[must_use]
    pub const fn purpose(&self) -> ConnectionPurpose {
        self.purpose
    }

    /// Returns whether the handle reported a connection-level failure.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Marks the handle unusable.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    fn usable(&self) -> TopoResult<&InMemoryDatastore> {
        if self.is_broken() {
            return Err(TopoError::DbAccess(format!(
                "{} connection {} is broken",
                self.purpose, self.id
            )));
        }
        Ok(&self.store)
    }

    fn writable(&self) -> TopoResult<&InMemoryDatastore> {
        if !self.purpose.is_writable() {
            return Err(TopoError::InvalidState("write attempted on a read-only connection"));
        }
        self.usable()
    }

    fn track<T>(&self, result: TopoResult<T>) -> TopoResult<T> {
        if let Err(error) = &result
            && error.is_fatal_db()
        {
            self.mark_broken();
        }
        result
    }

    /// Reads one row.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` for connection-level failures.
    pub fn get(&self, version: DatastoreVersion, key: &TopoKey) -> TopoResult<Option<Row>> {
        let store = self.usable()?;
        self.track(store.get(version, key))
    }

    /// Returns every row of `version` accepted by `filter`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` for connection-level failures.
    pub fn scan<F>(&self, version: DatastoreVersion, filter: F) -> TopoResult<Vec<Row>>
    where
        F: FnMut(&Row) -> bool,
    {
        let store = self.usable()?;
        self.track(store.scan(version, filter))
    }

    /// Returns rows of one key type, optionally scoped to one controller.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` for connection-level failures.
    pub fn rows_of(
        &self,
        version: DatastoreVersion,
        key_type: KeyType,
        controller: Option<&str>,
    ) -> TopoResult<Vec<Row>> {
        let store = self.usable()?;
        self.track(store.rows_of(version, key_type, controller))
    }

    /// Returns the next row of the same key type after `key`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` for connection-level failures.
    pub fn next_after(&self, version: DatastoreVersion, key: &TopoKey) -> TopoResult<Option<Row>> {
        let store = self.usable()?;
        self.track(store.next_after(version, key))
    }

    /// Inserts or replaces one row.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` on a read-only connection and `TopoError::DbAccess`
    /// for connection-level failures.
    pub fn put(&self, version: DatastoreVersion, row: Row) -> TopoResult<()> {
        let store = self.writable()?;
        self.track(store.put(version, row))
    }

    /// Removes one row.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` on a read-only connection and `TopoError::DbAccess`
    /// for connection-level failures.
    pub fn remove(&self, version: DatastoreVersion, key: &TopoKey) -> TopoResult<Option<Row>> {
        let store = self.writable()?;
        self.track(store.remove(version, key))
    }

    /// Replaces `target` with a copy of `source`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` on a read-only connection and `TopoError::DbAccess`
    /// for connection-level failures.
    pub fn copy_all(&self, source: DatastoreVersion, target: DatastoreVersion) -> TopoResult<()> {
        let store = self.writable()?;
        self.track(store.copy_all(source, target))
    }

    /// Clears `version`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` on a read-only connection and `TopoError::DbAccess`
    /// for connection-level failures.
    pub fn clear_all(&self, version: DatastoreVersion) -> TopoResult<()> {
        let store = self.writable()?;
        self.track(store.clear_all(version))
    }

    /// Clears one controller's rows from `version`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` on a read-only connection and `TopoError::DbAccess`
    /// for connection-level failures.
    pub fn clear_controller(&self, version: DatastoreVersion, controller: &str) -> TopoResult<usize> {
        let store = self.writable()?;
        self.track(store.clear_controller(version, controller))
    }

    /// Returns whether CANDIDATE has uncommitted changes.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` for connection-level failures.
    pub fn is_candidate_dirty(&self) -> TopoResult<bool> {
        let store = self.usable()?;
        self.track(store.is_candidate_dirty())
    }

    /// Commits CANDIDATE into RUNNING as one datastore transaction.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` on a read-only connection and `TopoError::DbAccess`
    /// for connection-level failures.
    pub fn commit_candidate(&self) -> TopoResult<()> {
        let store = self.writable()?;
        self.track(store.commit_candidate())
    }
}

#[derive(Debug)]
struct Lease {
    connection: Arc<DbConnection>,
    depth: u32,
}

#[derive(Debug, Default)]
struct PoolState {
    in_use: HashMap<(ConnectionPurpose, OwnerTag), Lease>,
    free_read: Vec<Arc<DbConnection>>,
    open_read: u16,
    free_northbound: Option<Arc<DbConnection>>,
    free_southbound: Option<Arc<DbConnection>>,
    northbound_out: bool,
    southbound_out: bool,
    next_id: u64,
}

impl PoolState {
    fn try_take(
        &mut self,
        purpose: ConnectionPurpose,
        limit: ConnectionLimit,
        store: &Arc<InMemoryDatastore>,
    ) -> TopoResult<Option<Arc<DbConnection>>> {
        match purpose {
            ConnectionPurpose::ReadOnly => {
                if let Some(connection) = self.free_read.pop() {
                    return Ok(Some(connection));
                }
                if self.open_read >= limit.get() {
                    return Ok(None);
                }
                let connection = self.open(purpose, store)?;
                self.open_read += 1;
                Ok(Some(connection))
            }
            ConnectionPurpose::RwNorthbound | ConnectionPurpose::RwSouthbound => {
                let northbound = purpose == ConnectionPurpose::RwNorthbound;
                let out = if northbound {
                    self.northbound_out
                } else {
                    self.southbound_out
                };
                if out {
                    return Ok(None);
                }
                let cached = if northbound {
                    self.free_northbound.take()
                } else {
                    self.free_southbound.take()
                };
                let connection = match cached {
                    Some(connection) => connection,
                    None => self.open(purpose, store)?,
                };
                if northbound {
                    self.northbound_out = true;
                } else {
                    self.southbound_out = true;
                }
                Ok(Some(connection))
            }
        }
    }

    fn open(
        &mut self,
        purpose: ConnectionPurpose,
        store: &Arc<InMemoryDatastore>,
    ) -> TopoResult<Arc<DbConnection>> {
        self.next_id += 1;
        let connection = DbConnection::open(self.next_id, purpose, Arc::clone(store))?;
        debug!(purpose = %purpose, id = self.next_id, "opened datastore connection");
        Ok(Arc::new(connection))
    }

    fn give_back(&mut self, connection: Arc<DbConnection>) {
        let purpose = connection.purpose();
        let broken = connection.is_broken();
        if broken {
            warn!(purpose = %purpose, id = connection.id(), "dropping broken datastore connection");
        }
        match purpose {
            ConnectionPurpose::ReadOnly => {
                if broken {
                    self.open_read = self.open_read.saturating_sub(1);
                } else {
                    self.free_read.push(connection);
                }
            }
            ConnectionPurpose::RwNorthbound => {
                self.northbound_out = false;
                self.free_northbound = (!broken).then_some(connection);
            }
            ConnectionPurpose::RwSouthbound => {
                self.southbound_out = false;
                self.free_southbound = (!broken).then_some(connection);
            }
        }
    }
}

#[derive(Debug)]
struct PoolShared {
    store: Arc<InMemoryDatastore>,
    read_limit: ConnectionLimit,
    checkout_wait: Duration,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl PoolShared {
    fn lock(&self) -> TopoResult<MutexGuard<'_, PoolState>> {
        self.state
            .lock()
            .map_err(|_| TopoError::InvalidState("connection pool mutex is poisoned"))
    }

    fn checkin(&self, purpose: ConnectionPurpose, owner: OwnerTag) {
        let Ok(mut state) = self.lock() else {
            warn!(purpose = %purpose, "connection pool mutex is poisoned during checkin");
            return;
        };
        let Some(lease) = state.in_use.get_mut(&(purpose, owner)) else {
            return;
        };
        lease.depth -= 1;
        if lease.depth > 0 {
            return;
        }
        if let Some(lease) = state.in_use.remove(&(purpose, owner)) {
            state.give_back(lease.connection);
        }
        drop(state);
        self.released.notify_all();
    }
}

/// Bounded connection pool over one datastore.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Creates a pool sized from runtime configuration.
    #[must_use]
    pub fn new(store: Arc<InMemoryDatastore>, config: &RuntimeConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                store,
                read_limit: config.max_read_connections,
                checkout_wait: config.checkout_wait,
                state: Mutex::new(PoolState::default()),
                released: Condvar::new(),
            }),
        }
    }

    /// Checks out a connection for `owner`.
    ///
    /// A repeated checkout by the same owner and purpose before release returns the same
    /// connection. When the purpose is at its ceiling the call waits up to the configured
    /// checkout wait, then fails.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` when no connection frees up in time or a new connection
    /// cannot be opened, and `TopoError::InvalidState` when the pool mutex is poisoned.
    pub fn checkout(&self, purpose: ConnectionPurpose, owner: OwnerTag) -> TopoResult<PooledConnection> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.checkout_wait;
        let mut state = shared.lock()?;
        loop {
            if let Some(lease) = state.in_use.get_mut(&(purpose, owner)) {
                lease.depth += 1;
                return Ok(self.lease(purpose, owner, Arc::clone(&lease.connection)));
            }
            if let Some(connection) = state.try_take(purpose, shared.read_limit, &shared.store)? {
                let _ = state.in_use.insert(
                    (purpose, owner),
                    Lease {
                        connection: Arc::clone(&connection),
                        depth: 1,
                    },
                );
                return Ok(self.lease(purpose, owner, connection));
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(purpose = %purpose, session = owner.session_id(), "connection checkout timed out");
                return Err(TopoError::DbAccess(format!(
                    "no {purpose} connection available within {} ms",
                    shared.checkout_wait.as_millis()
                )));
            }
            let (next, _) = shared
                .released
                .wait_timeout(state, deadline - now)
                .map_err(|_| TopoError::InvalidState("connection pool mutex is poisoned"))?;
            state = next;
        }
    }

    fn lease(
        &self,
        purpose: ConnectionPurpose,
        owner: OwnerTag,
        connection: Arc<DbConnection>,
    ) -> PooledConnection {
        PooledConnection {
            connection,
            purpose,
            owner,
            pool: Arc::clone(&self.shared),
        }
    }

    /// Number of entries in the in-use map.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the pool mutex is poisoned.
    pub fn in_use_count(&self, purpose: ConnectionPurpose) -> TopoResult<usize> {
        Ok(self
            .shared
            .lock()?
            .in_use
            .keys()
            .filter(|(leased, _)| *leased == purpose)
            .count())
    }

    /// Number of idle read-only connections.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the pool mutex is poisoned.
    pub fn idle_read_count(&self) -> TopoResult<usize> {
        Ok(self.shared.lock()?.free_read.len())
    }

    /// Configured read-only ceiling.
    #[must_use]
    pub fn read_limit(&self) -> ConnectionLimit {
        self.shared.read_limit
    }
}

/// Checked-out connection; released back to the pool on drop.
pub struct PooledConnection {
    connection: Arc<DbConnection>,
    purpose: ConnectionPurpose,
    owner: OwnerTag,
    pool: Arc<PoolShared>,
}

impl PooledConnection {
    /// Shared handle of the underlying connection.
    #[must_use]
    pub fn handle(&self) -> &Arc<DbConnection> {
        &self.connection
    }

    /// Owner this lease was checked out for.
    #[must_use]
    pub const fn owner(&self) -> OwnerTag {
        self.owner
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.connection.id())
            .field("purpose", &self.purpose)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = DbConnection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.checkin(self.purpose, self.owner);
    }
}
