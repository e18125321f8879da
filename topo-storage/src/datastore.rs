//! Versioned in-memory topology datastore.
//!
//! The store keeps one ordered table per [`DatastoreVersion`]. Bulk primitives (copy, clear,
//! candidate commit) run under a single write lock so concurrent readers observe either the
//! state before or after the primitive, never a mix.

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use topo_common::error::{TopoError, TopoResult};
use topo_core::key::{KeyType, TopoKey};
use topo_core::value::{Row, RowStatus};
use topo_core::version::DatastoreVersion;

type Table = BTreeMap<TopoKey, Row>;

/// Datastore primitive that a one-shot fault can be armed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Opening a new connection.
    Connect,
    /// Any read of the given version.
    Read(DatastoreVersion),
    /// Any single-row write into the given version.
    Write(DatastoreVersion),
    /// Bulk copy from one version to another.
    Copy {
        /// Source version.
        source: DatastoreVersion,
        /// Destination version.
        target: DatastoreVersion,
    },
    /// Bulk or per-controller clear of the given version.
    Clear(DatastoreVersion),
    /// Candidate normalization plus copy into running.
    CommitCandidate,
}

/// In-memory datastore with five logical containers.
#[derive(Debug, Default)]
pub struct InMemoryDatastore {
    tables: RwLock<[Table; 5]>,
    faults: Mutex<Vec<FaultPoint>>,
}

impl InMemoryDatastore {
    /// Creates an empty datastore.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms one fault; the next matching primitive fails with `TopoError::DbAccess`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the fault list mutex is poisoned.
    pub fn inject_fault(&self, point: FaultPoint) -> TopoResult<()> {
        self.faults
            .lock()
            .map_err(|_| TopoError::InvalidState("datastore fault mutex is poisoned"))?
            .push(point);
        Ok(())
    }

    /// Fails once if a fault is armed for `point`.
    pub(crate) fn check_fault(&self, point: FaultPoint) -> TopoResult<()> {
        let mut faults = self
            .faults
            .lock()
            .map_err(|_| TopoError::InvalidState("datastore fault mutex is poisoned"))?;
        if let Some(position) = faults.iter().position(|armed| *armed == point) {
            let _ = faults.remove(position);
            return Err(TopoError::DbAccess(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    fn read_tables(&self) -> TopoResult<RwLockReadGuard<'_, [Table; 5]>> {
        self.tables
            .read()
            .map_err(|_| TopoError::InvalidState("datastore table lock is poisoned"))
    }

    fn write_tables(&self) -> TopoResult<RwLockWriteGuard<'_, [Table; 5]>> {
        self.tables
            .write()
            .map_err(|_| TopoError::InvalidState("datastore table lock is poisoned"))
    }

    /// Reads one row.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` on an injected read fault.
    pub fn get(&self, version: DatastoreVersion, key: &TopoKey) -> TopoResult<Option<Row>> {
        self.check_fault(FaultPoint::Read(version))?;
        let tables = self.read_tables()?;
        Ok(tables[version.index()].get(key).cloned())
    }

    /// Returns every row of `version` accepted by `filter`, in key order.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` on an injected read fault.
    pub fn scan<F>(&self, version: DatastoreVersion, mut filter: F) -> TopoResult<Vec<Row>>
    where
        F: FnMut(&Row) -> bool,
    {
        self.check_fault(FaultPoint::Read(version))?;
        let tables = self.read_tables()?;
        Ok(tables[version.index()]
            .values()
            .filter(|row| filter(row))
            .cloned()
            .collect())
    }

    /// Returns rows of one key type, optionally scoped to one controller.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` on an injected read fault.
    pub fn rows_of(
        &self,
        version: DatastoreVersion,
        key_type: KeyType,
        controller: Option<&str>,
    ) -> TopoResult<Vec<Row>> {
        self.scan(version, |row| {
            row.key.key_type() == key_type
                && controller.is_none_or(|name| row.key.controller_name() == Some(name))
        })
    }

    /// Returns the first row of the same key type ordered after `key`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` on an injected read fault.
    pub fn next_after(&self, version: DatastoreVersion, key: &TopoKey) -> TopoResult<Option<Row>> {
        self.check_fault(FaultPoint::Read(version))?;
        let tables = self.read_tables()?;
        let key_type = key.key_type();
        Ok(tables[version.index()]
            .range::<TopoKey, _>((std::ops::Bound::Excluded(key), std::ops::Bound::Unbounded))
            .map(|(_, row)| row)
            .find(|row| row.key.key_type() == key_type)
            .cloned())
    }

    /// Inserts or replaces one row.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` on an injected write fault.
    pub fn put(&self, version: DatastoreVersion, row: Row) -> TopoResult<()> {
        self.check_fault(FaultPoint::Write(version))?;
        let mut tables = self.write_tables()?;
        let _ = tables[version.index()].insert(row.key.clone(), row);
        Ok(())
    }

    /// Removes one row, returning it when present.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` on an injected write fault.
    pub fn remove(&self, version: DatastoreVersion, key: &TopoKey) -> TopoResult<Option<Row>> {
        self.check_fault(FaultPoint::Write(version))?;
        let mut tables = self.write_tables()?;
        Ok(tables[version.index()].remove(key))
    }

    /// Replaces every row of `target` with the rows of `source`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` on an injected copy fault; `target` is untouched then.
    pub fn copy_all(&self, source: DatastoreVersion, target: DatastoreVersion) -> TopoResult<()> {
        self.check_fault(FaultPoint::Copy { source, target })?;
        if source == target {
            return Ok(());
        }
        let mut tables = self.write_tables()?;
        let copied = tables[source.index()].clone();
        tables[target.index()] = copied;
        Ok(())
    }

    /// Removes every row of `version`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` on an injected clear fault.
    pub fn clear_all(&self, version: DatastoreVersion) -> TopoResult<()> {
        self.check_fault(FaultPoint::Clear(version))?;
        let mut tables = self.write_tables()?;
        tables[version.index()].clear();
        Ok(())
    }

    /// Removes every row owned by one controller from `version`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` on an injected clear fault.
    pub fn clear_controller(&self, version: DatastoreVersion, controller: &str) -> TopoResult<usize> {
        self.check_fault(FaultPoint::Clear(version))?;
        let mut tables = self.write_tables()?;
        let table = &mut tables[version.index()];
        let before = table.len();
        table.retain(|key, _| key.controller_name() != Some(controller));
        Ok(before - table.len())
    }

    /// Returns whether CANDIDATE carries changes not yet committed to RUNNING.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` on an injected candidate read fault.
    pub fn is_candidate_dirty(&self) -> TopoResult<bool> {
        self.check_fault(FaultPoint::Read(DatastoreVersion::Candidate))?;
        let tables = self.read_tables()?;
        Ok(tables[DatastoreVersion::Candidate.index()]
            .values()
            .any(|row| row.status.is_pending()))
    }

    /// Applies CANDIDATE: drops deleted rows, marks the rest applied, and copies it into RUNNING.
    ///
    /// Both containers change under one write lock.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` on an injected commit fault; no container changes then.
    pub fn commit_candidate(&self) -> TopoResult<()> {
        self.check_fault(FaultPoint::CommitCandidate)?;
        let mut tables = self.write_tables()?;
        let candidate = &mut tables[DatastoreVersion::Candidate.index()];
        candidate.retain(|_, row| row.status != RowStatus::Deleted);
        for row in candidate.values_mut() {
            row.status = RowStatus::Applied;
        }
        let committed = candidate.clone();
        tables[DatastoreVersion::Running.index()] = committed;
        Ok(())
    }

    /// Number of rows in `version`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the table lock is poisoned.
    pub fn len(&self, version: DatastoreVersion) -> TopoResult<usize> {
        Ok(self.read_tables()?[version.index()].len())
    }

    /// Copy of every row in `version`, used by tests and status reports.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the table lock is poisoned.
    pub fn snapshot(&self, version: DatastoreVersion) -> TopoResult<Vec<Row>> {
        Ok(self.read_tables()?[version.index()]
            .values()
            .cloned()
            .collect())
    }
}
