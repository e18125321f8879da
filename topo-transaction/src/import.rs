//! Controller configuration import.
//!
//! An import stages the configuration a controller already carries into IMPORT and later merges
//! it into CANDIDATE, so the next commit adopts it. A controller is importing from
//! `import_controller_config` until its import is merged or cleared.

use std::sync::{Arc, Mutex, MutexGuard};

use topo_common::error::{TopoError, TopoResult};
use topo_common::ids::SessionId;
use topo_core::containers::HotSet as HashSet;
use topo_core::value::{Row, RowStatus};
use topo_core::version::DatastoreVersion;
use topo_storage::pool::ConnectionPurpose;
use tracing::info;

use crate::audit::AuditRequest;
use crate::context::TxContext;

/// Import of controller configuration through IMPORT into CANDIDATE.
#[derive(Debug)]
pub struct ImportRequest {
    ctx: TxContext,
    audit: Arc<AuditRequest>,
    importing: Mutex<HashSet<String>>,
}

impl ImportRequest {
    /// Creates the import handler.
    #[must_use]
    pub fn new(ctx: TxContext, audit: Arc<AuditRequest>) -> Self {
        Self {
            ctx,
            audit,
            importing: Mutex::new(HashSet::new()),
        }
    }

    fn importing(&self) -> TopoResult<MutexGuard<'_, HashSet<String>>> {
        self.importing
            .lock()
            .map_err(|_| TopoError::InvalidState("import membership mutex is poisoned"))
    }

    /// Returns whether `controller` has a staged import.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the membership mutex is poisoned.
    pub fn is_importing(&self, controller: &str) -> TopoResult<bool> {
        Ok(self.importing()?.contains(controller))
    }

    /// Stages `rows` of `controller` into IMPORT.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::OperationNotAllowed` while the controller is under audit or already
    /// importing, `TopoError::InvalidRequest` for rows of other controllers or read-only key
    /// types, and datastore errors.
    pub fn import_controller_config(
        &self,
        session: SessionId,
        controller: &str,
        rows: Vec<Row>,
    ) -> TopoResult<usize> {
        for row in &rows {
            if row.key.controller_name() != Some(controller) {
                return Err(TopoError::InvalidRequest(format!(
                    "{} does not belong to controller {controller}",
                    row.key
                )));
            }
            self.ctx
                .registry
                .check_config_target(row.key.key_type(), DatastoreVersion::Candidate)?;
        }

        let mut importing = self.importing()?;
        if importing.contains(controller) {
            return Err(TopoError::OperationNotAllowed("controller import already staged"));
        }
        if self.audit.is_under_audit(controller)? {
            return Err(TopoError::OperationNotAllowed("controller is under audit"));
        }
        let connection = self.ctx.checkout(ConnectionPurpose::RwNorthbound, session)?;
        let count = rows.len();
        self.ctx.escalate(
            "clear import",
            connection.clear_controller(DatastoreVersion::Import, controller),
        )?;
        for row in rows {
            let row = Row::applied(row.key, row.value)?;
            self.ctx
                .escalate("write import", connection.put(DatastoreVersion::Import, row))?;
        }
        let _ = importing.insert(controller.to_owned());
        info!(controller, rows = count, "controller configuration imported");
        Ok(count)
    }

    /// Merges the staged import of `controller` into CANDIDATE and ends the import.
    ///
    /// Rows missing from CANDIDATE become `CREATED`, rows with a different configuration become
    /// `UPDATED`, identical rows are left alone. Returns the number of rows changed.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when nothing is staged for the controller, and datastore
    /// errors.
    pub fn merge_controller_config(&self, session: SessionId, controller: &str) -> TopoResult<usize> {
        let mut importing = self.importing()?;
        if !importing.contains(controller) {
            return Err(TopoError::InvalidState("no import staged for controller"));
        }
        let connection = self.ctx.checkout(ConnectionPurpose::RwNorthbound, session)?;
        let staged = self.ctx.escalate(
            "read import",
            connection.scan(DatastoreVersion::Import, |row| {
                row.key.controller_name() == Some(controller)
            }),
        )?;
        let mut changed = 0_usize;
        for row in staged {
            let current = self
                .ctx
                .escalate("read candidate", connection.get(DatastoreVersion::Candidate, &row.key))?;
            let status = match current {
                None => RowStatus::Created,
                Some(existing) if existing.status == RowStatus::Deleted => RowStatus::Updated,
                Some(existing) if existing.value.differs_in_config(&row.value) => {
                    if existing.status == RowStatus::Created {
                        RowStatus::Created
                    } else {
                        RowStatus::Updated
                    }
                }
                Some(_) => continue,
            };
            let merged = Row::new(row.key, row.value, status)?;
            self.ctx
                .escalate("write candidate", connection.put(DatastoreVersion::Candidate, merged))?;
            changed += 1;
        }
        self.ctx.escalate(
            "clear import",
            connection.clear_controller(DatastoreVersion::Import, controller),
        )?;
        let _ = importing.remove(controller);
        info!(controller, changed, "imported configuration merged into candidate");
        Ok(changed)
    }

    /// Drops the staged import of `controller`; a no-op when nothing is staged.
    ///
    /// # Errors
    ///
    /// Returns datastore errors from the clear.
    pub fn clear_import_config(&self, session: SessionId, controller: &str) -> TopoResult<usize> {
        let mut importing = self.importing()?;
        if !importing.remove(controller) {
            return Ok(0);
        }
        let connection = self.ctx.checkout(ConnectionPurpose::RwNorthbound, session)?;
        let cleared = self.ctx.escalate(
            "clear import",
            connection.clear_controller(DatastoreVersion::Import, controller),
        )?;
        info!(controller, cleared, "controller import cleared");
        Ok(cleared)
    }
}
