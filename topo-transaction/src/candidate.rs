//! Configuration writes into CANDIDATE.

use topo_common::error::{TopoError, TopoResult};
use topo_common::ids::SessionId;
use topo_core::key::TopoKey;
use topo_core::value::{BoundaryEnd, Row, RowStatus, TopoValue};
use topo_core::version::DatastoreVersion;
use topo_storage::pool::{ConnectionPurpose, DbConnection};
use tracing::debug;

use crate::context::TxContext;

/// Generic create/update/delete of configurable rows.
///
/// Row status tracks what the next commit has to do: `CREATED` rows were never committed,
/// `UPDATED` rows differ from RUNNING, `DELETED` rows are removed by the commit.
#[derive(Debug, Clone)]
pub struct CandidateWriter {
    ctx: TxContext,
}

fn is_live(row: Option<&Row>) -> bool {
    row.is_some_and(|row| row.status != RowStatus::Deleted)
}

impl CandidateWriter {
    /// Creates the writer.
    #[must_use]
    pub fn new(ctx: TxContext) -> Self {
        Self { ctx }
    }

    /// Creates one row in `version`.
    ///
    /// Re-creating a row deleted earlier in the same candidate marks it `UPDATED`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidRequest` for read-only key types, versions other than CANDIDATE,
    /// mismatched values or missing parents, `TopoError::DbQuery` when the row already exists, and
    /// datastore errors.
    pub fn create(
        &self,
        session: SessionId,
        version: DatastoreVersion,
        key: TopoKey,
        value: TopoValue,
    ) -> TopoResult<()> {
        self.ctx
            .registry
            .check_config_target(key.key_type(), version)?;
        let connection = self.ctx.checkout(ConnectionPurpose::RwNorthbound, session)?;
        let existing = self
            .ctx
            .escalate("read candidate", connection.get(version, &key))?;
        let status = match existing {
            Some(row) if row.status == RowStatus::Deleted => RowStatus::Updated,
            Some(_) => return Err(TopoError::DbQuery(format!("{key} already exists"))),
            None => RowStatus::Created,
        };
        check_parents(&connection, &key, &value)?;
        let row = Row::new(key, value, status)?;
        debug!(key = %row.key, ?status, "candidate row created");
        self.ctx.escalate("write candidate", connection.put(version, row))
    }

    /// Replaces the configuration of one row.
    ///
    /// The stored operational status is kept; a controller cannot change its driver type.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbQuery` when the row does not exist, `TopoError::InvalidRequest` for
    /// invalid targets or values, and datastore errors.
    pub fn update(
        &self,
        session: SessionId,
        version: DatastoreVersion,
        key: TopoKey,
        mut value: TopoValue,
    ) -> TopoResult<()> {
        self.ctx
            .registry
            .check_config_target(key.key_type(), version)?;
        let connection = self.ctx.checkout(ConnectionPurpose::RwNorthbound, session)?;
        let existing = self
            .ctx
            .escalate("read candidate", connection.get(version, &key))?;
        let Some(existing) = existing.filter(|row| row.status != RowStatus::Deleted) else {
            return Err(TopoError::DbQuery(format!("{key} does not exist")));
        };
        if existing.value.driver_type() != value.driver_type() {
            return Err(TopoError::InvalidRequest(format!(
                "driver type of {key} cannot change"
            )));
        }
        if let Some(status) = existing.value.oper_status() {
            let _ = value.set_oper_status(status);
        }
        check_parents(&connection, &key, &value)?;
        let status = match existing.status {
            RowStatus::Created => RowStatus::Created,
            _ => RowStatus::Updated,
        };
        let row = Row::new(key, value, status)?;
        self.ctx.escalate("write candidate", connection.put(version, row))
    }

    /// Deletes one row.
    ///
    /// Rows never committed are removed outright; committed rows are marked `DELETED`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbQuery` when the row does not exist, `TopoError::InvalidRequest` when
    /// live rows still depend on it, and datastore errors.
    pub fn delete(&self, session: SessionId, version: DatastoreVersion, key: TopoKey) -> TopoResult<()> {
        self.ctx
            .registry
            .check_config_target(key.key_type(), version)?;
        let connection = self.ctx.checkout(ConnectionPurpose::RwNorthbound, session)?;
        let existing = self
            .ctx
            .escalate("read candidate", connection.get(version, &key))?;
        let Some(mut existing) = existing.filter(|row| row.status != RowStatus::Deleted) else {
            return Err(TopoError::DbQuery(format!("{key} does not exist")));
        };
        if let TopoKey::Controller { controller } = &key {
            check_no_dependents(&connection, controller)?;
        }
        if existing.status == RowStatus::Created {
            let _ = self
                .ctx
                .escalate("remove candidate", connection.remove(version, &key))?;
            debug!(key = %key, "uncommitted candidate row dropped");
            return Ok(());
        }
        existing.status = RowStatus::Deleted;
        self.ctx.escalate("write candidate", connection.put(version, existing))
    }
}

fn check_parents(connection: &DbConnection, key: &TopoKey, value: &TopoValue) -> TopoResult<()> {
    match (key, value) {
        (TopoKey::Domain { controller, .. }, _) => require_controller(connection, controller),
        (TopoKey::Boundary { .. }, TopoValue::Boundary(boundary)) => {
            for end in [&boundary.end1, &boundary.end2] {
                require_end(connection, end)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn require_controller(connection: &DbConnection, controller: &str) -> TopoResult<()> {
    let row = connection.get(DatastoreVersion::Candidate, &TopoKey::controller(controller))?;
    if is_live(row.as_ref()) {
        return Ok(());
    }
    Err(TopoError::InvalidRequest(format!(
        "controller {controller} does not exist"
    )))
}

fn require_end(connection: &DbConnection, end: &BoundaryEnd) -> TopoResult<()> {
    require_controller(connection, &end.controller)?;
    let domain = connection.get(
        DatastoreVersion::Candidate,
        &TopoKey::domain(end.controller.clone(), end.domain.clone()),
    )?;
    if is_live(domain.as_ref()) {
        return Ok(());
    }
    Err(TopoError::InvalidRequest(format!(
        "domain {} of controller {} does not exist",
        end.domain, end.controller
    )))
}

fn check_no_dependents(connection: &DbConnection, controller: &str) -> TopoResult<()> {
    let dependents = connection.scan(DatastoreVersion::Candidate, |row| {
        if row.status == RowStatus::Deleted {
            return false;
        }
        match (&row.key, &row.value) {
            (TopoKey::Domain { controller: owner, .. }, _) => owner == controller,
            (_, TopoValue::Boundary(boundary)) => {
                boundary.end1.controller == controller || boundary.end2.controller == controller
            }
            _ => false,
        }
    })?;
    match dependents.first() {
        None => Ok(()),
        Some(row) => Err(TopoError::InvalidRequest(format!(
            "controller {controller} is still referenced by {}",
            row.key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use rstest::rstest;
    use topo_common::error::TopoError;
    use topo_core::key::TopoKey;
    use topo_core::value::RowStatus;
    use topo_core::version::DatastoreVersion;

    use crate::test_support::{Harness, boundary_row, controller_row, domain_row};

    fn status_of(harness: &Harness, key: &TopoKey) -> Option<RowStatus> {
        harness
            .rows(DatastoreVersion::Candidate)
            .into_iter()
            .find(|row| &row.key == key)
            .map(|row| row.status)
    }

    #[rstest]
    fn create_then_delete_of_uncommitted_row_leaves_nothing() {
        let harness = Harness::new();
        let writer = harness.candidate();
        let row = controller_row("c1", RowStatus::Created);

        assert_that!(
            &writer.create(1, DatastoreVersion::Candidate, row.key.clone(), row.value.clone()),
            eq(&Ok(()))
        );
        assert_that!(status_of(&harness, &row.key), eq(Some(RowStatus::Created)));
        assert_that!(
            &writer.delete(1, DatastoreVersion::Candidate, row.key.clone()),
            eq(&Ok(()))
        );
        assert_that!(harness.rows(DatastoreVersion::Candidate).is_empty(), eq(true));
    }

    #[rstest]
    fn committed_rows_move_through_updated_and_deleted() {
        let harness = Harness::new();
        harness.put(
            DatastoreVersion::Candidate,
            controller_row("c1", RowStatus::Applied),
        );
        let writer = harness.candidate();
        let row = controller_row("c1", RowStatus::Applied);

        let _ = writer.update(1, DatastoreVersion::Candidate, row.key.clone(), row.value.clone());
        assert_that!(status_of(&harness, &row.key), eq(Some(RowStatus::Updated)));
        let _ = writer.delete(1, DatastoreVersion::Candidate, row.key.clone());
        assert_that!(status_of(&harness, &row.key), eq(Some(RowStatus::Deleted)));
        let _ = writer.create(1, DatastoreVersion::Candidate, row.key.clone(), row.value);
        assert_that!(status_of(&harness, &row.key), eq(Some(RowStatus::Updated)));
    }

    #[rstest]
    #[case(DatastoreVersion::Running)]
    #[case(DatastoreVersion::Startup)]
    #[case(DatastoreVersion::State)]
    fn configuration_outside_candidate_is_rejected(#[case] version: DatastoreVersion) {
        let harness = Harness::new();
        let row = controller_row("c1", RowStatus::Created);
        let result = harness.candidate().create(1, version, row.key, row.value);
        assert_that!(matches!(result, Err(TopoError::InvalidRequest(_))), eq(true));
    }

    #[rstest]
    fn duplicate_and_missing_rows_are_query_errors() {
        let harness = Harness::new();
        harness.put(
            DatastoreVersion::Candidate,
            controller_row("c1", RowStatus::Applied),
        );
        let writer = harness.candidate();
        let existing = controller_row("c1", RowStatus::Created);
        let missing = controller_row("c9", RowStatus::Created);

        let duplicate = writer.create(1, DatastoreVersion::Candidate, existing.key, existing.value);
        assert_that!(matches!(duplicate, Err(TopoError::DbQuery(_))), eq(true));
        let absent = writer.update(1, DatastoreVersion::Candidate, missing.key.clone(), missing.value);
        assert_that!(matches!(absent, Err(TopoError::DbQuery(_))), eq(true));
        let gone = writer.delete(1, DatastoreVersion::Candidate, missing.key);
        assert_that!(matches!(gone, Err(TopoError::DbQuery(_))), eq(true));
    }

    #[rstest]
    fn domain_requires_controller_and_blocks_its_deletion() {
        let harness = Harness::new();
        let writer = harness.candidate();
        let domain = domain_row("c1", "d1", RowStatus::Created);

        let orphan = writer.create(1, DatastoreVersion::Candidate, domain.key.clone(), domain.value.clone());
        assert_that!(matches!(orphan, Err(TopoError::InvalidRequest(_))), eq(true));

        harness.put(
            DatastoreVersion::Candidate,
            controller_row("c1", RowStatus::Applied),
        );
        assert_that!(
            &writer.create(1, DatastoreVersion::Candidate, domain.key, domain.value),
            eq(&Ok(()))
        );
        let blocked = writer.delete(1, DatastoreVersion::Candidate, TopoKey::controller("c1"));
        assert_that!(matches!(blocked, Err(TopoError::InvalidRequest(_))), eq(true));
    }

    #[rstest]
    fn boundary_requires_both_ends() {
        let harness = Harness::new();
        for (controller, domain) in [("c1", "d1"), ("c2", "d2")] {
            harness.put(
                DatastoreVersion::Candidate,
                controller_row(controller, RowStatus::Applied),
            );
            harness.put(
                DatastoreVersion::Candidate,
                domain_row(controller, domain, RowStatus::Applied),
            );
        }
        let writer = harness.candidate();
        let good = boundary_row("b1", ("c1", "d1"), ("c2", "d2"), RowStatus::Created);
        let bad = boundary_row("b2", ("c1", "d1"), ("c3", "d3"), RowStatus::Created);

        assert_that!(
            &writer.create(1, DatastoreVersion::Candidate, good.key, good.value),
            eq(&Ok(()))
        );
        let missing_end = writer.create(1, DatastoreVersion::Candidate, bad.key, bad.value);
        assert_that!(matches!(missing_end, Err(TopoError::InvalidRequest(_))), eq(true));
    }
}
