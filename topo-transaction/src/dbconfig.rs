//! Bulk datastore lifecycle operations.

use topo_common::error::TopoResult;
use topo_common::ids::SessionId;
use topo_core::version::DatastoreVersion;
use topo_storage::pool::{ConnectionPurpose, DbConnection};
use tracing::{info, warn};

use crate::context::{SYSTEM_SESSION, TxContext};
use crate::modified::ModifiedRowSet;

/// Orchestrates copy/clear primitives over whole containers.
///
/// There is no state machine here: each operation checks out the northbound read-write
/// connection, runs a fixed sequence of primitives, and releases it.
#[derive(Debug, Clone)]
pub struct DbConfigurationRequest {
    ctx: TxContext,
}

impl DbConfigurationRequest {
    /// Creates the request handler.
    #[must_use]
    pub fn new(ctx: TxContext) -> Self {
        Self { ctx }
    }

    /// Loads STARTUP as the committed configuration.
    ///
    /// Runs STARTUP→CANDIDATE, clear RUNNING, clear IMPORT, CANDIDATE→RUNNING, clear STATE in
    /// that order and stops at the first failure. Every step is a whole-container replace or
    /// clear, so rerunning the sequence after a failure is safe.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` from the failing step.
    pub fn load_and_commit_startup(&self) -> TopoResult<()> {
        let connection = self
            .ctx
            .checkout(ConnectionPurpose::RwNorthbound, SYSTEM_SESSION)?;
        let steps: [(&str, &dyn Fn(&DbConnection) -> TopoResult<()>); 5] = [
            ("copy STARTUP to CANDIDATE", &|db: &DbConnection| {
                db.copy_all(DatastoreVersion::Startup, DatastoreVersion::Candidate)
            }),
            ("clear RUNNING", &|db: &DbConnection| db.clear_all(DatastoreVersion::Running)),
            ("clear IMPORT", &|db: &DbConnection| db.clear_all(DatastoreVersion::Import)),
            ("copy CANDIDATE to RUNNING", &|db: &DbConnection| {
                db.copy_all(DatastoreVersion::Candidate, DatastoreVersion::Running)
            }),
            ("clear STATE", &|db: &DbConnection| db.clear_all(DatastoreVersion::State)),
        ];
        for (step, run) in steps {
            if let Err(error) = self.ctx.escalate(step, run(&connection)) {
                warn!(step, %error, "startup load stopped");
                return Err(error);
            }
        }
        info!("startup configuration loaded and committed");
        Ok(())
    }

    /// Discards every uncommitted CANDIDATE change.
    ///
    /// Northbound consumers are told about the rollback before RUNNING is copied back over
    /// CANDIDATE. Returns the number of rollback notifications sent.
    ///
    /// # Errors
    ///
    /// Returns datastore errors from the scan or the copy.
    pub fn abort_candidate_db(&self, session: SessionId) -> TopoResult<usize> {
        let connection = self.ctx.checkout(ConnectionPurpose::RwNorthbound, session)?;
        let modified = self
            .ctx
            .escalate("scan candidate", ModifiedRowSet::collect(&connection))?;
        let notifications = modified.rollback_notifications();
        let failed = self.ctx.deliver(&notifications);
        self.ctx.escalate(
            "copy RUNNING to CANDIDATE",
            connection.copy_all(DatastoreVersion::Running, DatastoreVersion::Candidate),
        )?;
        info!(
            rolled_back = modified.len(),
            notified = notifications.len() - failed,
            "candidate aborted"
        );
        Ok(notifications.len())
    }

    /// Persists RUNNING as the boot image.
    ///
    /// # Errors
    ///
    /// Returns datastore errors from the copy.
    pub fn save_running_to_startup(&self, session: SessionId) -> TopoResult<()> {
        let connection = self.ctx.checkout(ConnectionPurpose::RwNorthbound, session)?;
        self.ctx.escalate(
            "copy RUNNING to STARTUP",
            connection.copy_all(DatastoreVersion::Running, DatastoreVersion::Startup),
        )?;
        info!("running configuration saved to startup");
        Ok(())
    }

    /// Empties the boot image.
    ///
    /// # Errors
    ///
    /// Returns datastore errors from the clear.
    pub fn clear_startup(&self, session: SessionId) -> TopoResult<()> {
        let connection = self.ctx.checkout(ConnectionPurpose::RwNorthbound, session)?;
        self.ctx.escalate(
            "clear STARTUP",
            connection.clear_all(DatastoreVersion::Startup),
        )?;
        info!("startup configuration cleared");
        Ok(())
    }

    /// Commits CANDIDATE into RUNNING on an already checked-out connection.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` when the datastore transaction fails; RUNNING is unchanged.
    pub fn copy_candidate_to_running(&self, connection: &DbConnection) -> TopoResult<()> {
        self.ctx
            .escalate("copy CANDIDATE to RUNNING", connection.commit_candidate())
    }

    /// Returns whether CANDIDATE has uncommitted changes.
    ///
    /// # Errors
    ///
    /// Returns datastore errors from the read.
    pub fn is_candidate_dirty(&self, session: SessionId) -> TopoResult<bool> {
        let connection = self.ctx.checkout(ConnectionPurpose::ReadOnly, session)?;
        self.ctx
            .escalate("check candidate", connection.is_candidate_dirty())
    }
}
