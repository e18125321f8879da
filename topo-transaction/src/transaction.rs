//! Commit state machine driven by TC callbacks.

use std::collections::{BTreeMap, BTreeSet};

use topo_common::error::{TopoError, TopoResult};
use topo_common::ids::SessionId;
use topo_core::key::{KeyType, TopoKey};
use topo_core::notify::{Alarm, AlarmKind};
use topo_core::value::{DriverType, OperStatus, Row, TopoValue};
use topo_core::version::DatastoreVersion;
use topo_storage::pool::{ConnectionPurpose, DbConnection};
use tracing::{debug, error, info, warn};

use crate::context::TxContext;
use crate::dbconfig::DbConfigurationRequest;
use crate::modified::ModifiedRowSet;
use crate::phase::{AbortPhase, CommitPhase, DriverOutcome, RoundProgress, TransactionPhase};

/// Controllers grouped by the driver that serves them.
pub type DriverControllers = BTreeMap<DriverType, Vec<String>>;

/// Outcome of one completed commit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    /// Rows applied to RUNNING.
    pub applied: usize,
    /// Notifications handed to the northbound sink.
    pub notified: usize,
    /// Notifications the sink refused.
    pub failed_notifications: usize,
}

/// One commit cycle at a time: CANDIDATE scan, vote, global commit, copy into RUNNING.
///
/// Every method is called with the coordinator's single-flight flag held, so the instance is
/// owned exclusively for the duration of the call.
#[derive(Debug)]
pub struct TransactionRequest {
    ctx: TxContext,
    dbconfig: DbConfigurationRequest,
    phase: TransactionPhase,
    session: Option<SessionId>,
    modified: ModifiedRowSet,
    participants: BTreeMap<DriverType, BTreeSet<String>>,
    results: BTreeMap<DriverType, Option<DriverOutcome>>,
    last_commit_degraded: bool,
}

impl TransactionRequest {
    /// Creates an idle commit state machine.
    #[must_use]
    pub fn new(ctx: TxContext) -> Self {
        let dbconfig = DbConfigurationRequest::new(ctx.clone());
        Self {
            ctx,
            dbconfig,
            phase: TransactionPhase::End,
            session: None,
            modified: ModifiedRowSet::default(),
            participants: BTreeMap::new(),
            results: BTreeMap::new(),
            last_commit_degraded: false,
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> TransactionPhase {
        self.phase
    }

    /// Returns whether the last `end_transaction` failed to copy CANDIDATE into RUNNING.
    #[must_use]
    pub const fn last_commit_degraded(&self) -> bool {
        self.last_commit_degraded
    }

    /// Collected changes of the running cycle.
    #[must_use]
    pub const fn modified(&self) -> &ModifiedRowSet {
        &self.modified
    }

    /// Opens a cycle: scans CANDIDATE and returns the participating driver types.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when a cycle is already open,
    /// `TopoError::CandidateIsDirty` when a previous cycle left collected changes behind, and
    /// datastore errors from the scan. On error the phase is back at `END`.
    pub fn start_transaction(&mut self, session: SessionId) -> TopoResult<BTreeSet<DriverType>> {
        self.phase
            .expect(TransactionPhase::End, "commit cycle already in progress")?;
        if !self.modified.is_empty() {
            return Err(TopoError::CandidateIsDirty);
        }
        self.phase.advance(TransactionPhase::Start)?;
        self.session = Some(session);

        let collected = self.collect(session);
        let (modified, participants) = match collected {
            Ok(collected) => collected,
            Err(error) => {
                warn!(%error, "commit start failed");
                self.reset();
                return Err(error);
            }
        };
        self.modified = modified;
        self.participants = participants;
        self.phase.advance(TransactionPhase::StartSuccess)?;
        info!(
            changes = self.modified.len(),
            drivers = self.participants.len(),
            "commit cycle started"
        );
        Ok(self.participants.keys().copied().collect())
    }

    fn collect(
        &self,
        session: SessionId,
    ) -> TopoResult<(ModifiedRowSet, BTreeMap<DriverType, BTreeSet<String>>)> {
        let connection = self.ctx.checkout(ConnectionPurpose::RwNorthbound, session)?;
        let modified = self
            .ctx
            .escalate("scan candidate", ModifiedRowSet::collect(&connection))?;
        let participants = modified.participants(|controller| {
            driver_of(&connection, controller)
        })?;
        Ok((modified, participants))
    }

    /// Starts the vote round and returns the controllers each driver must vote for.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` unless the cycle is at `START_SUCCESS`.
    pub fn handle_vote_request(&mut self) -> TopoResult<DriverControllers> {
        self.phase
            .expect(TransactionPhase::StartSuccess, "vote requested outside START_SUCCESS")?;
        self.phase.advance(TransactionPhase::VoteBegin)?;
        let instructions = self.open_round();
        self.phase.advance(TransactionPhase::VoteWaitResult)?;
        if self.results.is_empty() {
            self.phase.advance(TransactionPhase::VoteSuccess)?;
        }
        debug!(drivers = instructions.len(), "vote round opened");
        Ok(instructions)
    }

    /// Starts the global commit round and returns the controllers each driver must commit.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` unless the cycle is at `VOTE_SUCCESS`.
    pub fn handle_global_commit_request(&mut self) -> TopoResult<DriverControllers> {
        self.phase.expect(
            TransactionPhase::VoteSuccess,
            "global commit requested outside VOTE_SUCCESS",
        )?;
        self.phase.advance(TransactionPhase::GlobalCommitBegin)?;
        let instructions = self.open_round();
        self.phase.advance(TransactionPhase::GlobalCommitWaitResult)?;
        if self.results.is_empty() {
            self.phase.advance(TransactionPhase::GlobalCommitResult)?;
            self.phase.advance(TransactionPhase::GlobalCommitSuccess)?;
        }
        debug!(drivers = instructions.len(), "global commit round opened");
        Ok(instructions)
    }

    fn open_round(&mut self) -> DriverControllers {
        self.results = self
            .participants
            .keys()
            .map(|driver| (*driver, None))
            .collect();
        self.participants
            .iter()
            .map(|(driver, controllers)| (*driver, controllers.iter().cloned().collect()))
            .collect()
    }

    /// Records one driver's result for the current round.
    ///
    /// Any failure or timeout aborts the cycle at once; RUNNING is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when no round of `phase` is waiting and
    /// `TopoError::InvalidRequest` for drivers outside the cycle or duplicate reports.
    pub fn handle_driver_result(
        &mut self,
        phase: CommitPhase,
        driver: DriverType,
        outcome: DriverOutcome,
    ) -> TopoResult<RoundProgress> {
        let waiting = match phase {
            CommitPhase::Vote => TransactionPhase::VoteWaitResult,
            CommitPhase::GlobalCommit => TransactionPhase::GlobalCommitWaitResult,
        };
        self.phase
            .expect(waiting, "driver result arrived outside a waiting round")?;
        let Some(slot) = self.results.get_mut(&driver) else {
            return Err(TopoError::InvalidRequest(format!(
                "driver {driver} does not take part in this cycle"
            )));
        };
        if slot.is_some() {
            return Err(TopoError::InvalidRequest(format!(
                "driver {driver} already reported"
            )));
        }
        *slot = Some(outcome);

        if !outcome.is_success() {
            warn!(driver = %driver, ?phase, ?outcome, "driver result aborts commit cycle");
            self.reset();
            return Ok(RoundProgress::Aborted);
        }
        if self.results.values().any(Option::is_none) {
            return Ok(RoundProgress::Waiting);
        }
        match phase {
            CommitPhase::Vote => self.phase.advance(TransactionPhase::VoteSuccess)?,
            CommitPhase::GlobalCommit => {
                self.phase.advance(TransactionPhase::GlobalCommitResult)?;
                self.phase.advance(TransactionPhase::GlobalCommitSuccess)?;
            }
        }
        debug!(?phase, phase_now = %self.phase, "driver round complete");
        Ok(RoundProgress::Succeeded)
    }

    /// Closes the cycle.
    ///
    /// With `committed == false` this behaves like an abort. Otherwise CANDIDATE is committed
    /// into RUNNING as one datastore transaction and the changes are notified northbound. A
    /// failed copy still returns the phase to `END`, sets the degraded flag, and raises an
    /// alarm.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` unless the cycle is at `GLOBAL_COMMIT_SUCCESS`, and
    /// `TopoError::DbAccess` when the copy failed.
    pub fn end_transaction(&mut self, committed: bool) -> TopoResult<CommitSummary> {
        if !committed {
            self.abort_transaction(AbortPhase::GlobalCommit)?;
            return Ok(CommitSummary {
                applied: 0,
                notified: 0,
                failed_notifications: 0,
            });
        }
        self.phase.expect(
            TransactionPhase::GlobalCommitSuccess,
            "end requested before GLOBAL_COMMIT_SUCCESS",
        )?;
        let session = self.session.unwrap_or_default();
        let outcome = self.apply(session);
        self.reset();
        match outcome {
            Ok(summary) => {
                if self.last_commit_degraded {
                    self.ctx.alarms.publish(Alarm::clear(
                        AlarmKind::CommitDegraded,
                        None,
                        "commit applied",
                    ));
                }
                self.last_commit_degraded = false;
                info!(
                    applied = summary.applied,
                    notified = summary.notified,
                    "commit cycle ended"
                );
                Ok(summary)
            }
            Err(failure) => {
                self.last_commit_degraded = true;
                error!(error = %failure, "commit did not reach RUNNING");
                self.ctx.alarms.publish(Alarm::raise(
                    AlarmKind::CommitDegraded,
                    None,
                    failure.to_string(),
                ));
                Err(failure)
            }
        }
    }

    fn apply(&self, session: SessionId) -> TopoResult<CommitSummary> {
        let connection = self.ctx.checkout(ConnectionPurpose::RwNorthbound, session)?;
        self.dbconfig.copy_candidate_to_running(&connection)?;
        self.sync_controller_state(&connection);

        let notifications = self.modified.commit_notifications(|key| {
            connection
                .get(DatastoreVersion::Running, key)
                .ok()
                .flatten()
                .map(|row| row.value)
        });
        let failed = self.ctx.deliver(&notifications);
        Ok(CommitSummary {
            applied: self.modified.len(),
            notified: notifications.len() - failed,
            failed_notifications: failed,
        })
    }

    /// Seeds STATE rows for new controllers and drops every row left behind by deleted ones.
    ///
    /// Failures here are logged only: the configuration is already committed.
    fn sync_controller_state(&self, connection: &DbConnection) {
        let Some(changes) = self.modified.changes(KeyType::Controller) else {
            return;
        };
        for key in &changes.created {
            let seeded = connection
                .get(DatastoreVersion::Running, key)
                .and_then(|row| match row {
                    Some(row) => state_row(row).map(Some),
                    None => Ok(None),
                })
                .and_then(|row| match row {
                    Some(row) => connection.put(DatastoreVersion::State, row),
                    None => Ok(()),
                });
            if let Err(error) = seeded {
                warn!(key = %key, %error, "controller state row not seeded");
            }
        }
        for key in &changes.deleted {
            let Some(controller) = key.controller_name() else {
                continue;
            };
            for version in [
                DatastoreVersion::State,
                DatastoreVersion::Running,
                DatastoreVersion::Candidate,
                DatastoreVersion::Import,
            ] {
                match connection.clear_controller(version, controller) {
                    Ok(cleared) => debug!(controller, %version, cleared, "controller rows dropped"),
                    Err(error) => warn!(controller, %version, %error, "controller rows not cleared"),
                }
            }
        }
    }

    /// Aborts the open cycle without touching RUNNING or CANDIDATE.
    ///
    /// Aborting when no cycle is open succeeds, so a TC abort that races an internal abort is
    /// harmless.
    ///
    /// # Errors
    ///
    /// Currently never returns an error.
    pub fn abort_transaction(&mut self, marker: AbortPhase) -> TopoResult<()> {
        if self.phase == TransactionPhase::End {
            debug!(?marker, "abort with no open commit cycle");
            self.reset();
            return Ok(());
        }
        if !marker.covers(self.phase) {
            warn!(?marker, phase = %self.phase, "abort marker does not match commit phase");
        }
        info!(phase = %self.phase, discarded = self.modified.len(), "commit cycle aborted");
        self.reset();
        Ok(())
    }

    fn reset(&mut self) {
        self.phase = TransactionPhase::End;
        self.session = None;
        self.modified.clear();
        self.participants.clear();
        self.results.clear();
    }
}

fn driver_of(connection: &DbConnection, controller: &str) -> TopoResult<Option<DriverType>> {
    let key = TopoKey::controller(controller);
    for version in [DatastoreVersion::Candidate, DatastoreVersion::Running] {
        if let Some(row) = connection.get(version, &key)?
            && let Some(driver) = row.value.driver_type()
        {
            return Ok(Some(driver));
        }
    }
    Ok(None)
}

fn state_row(mut row: Row) -> TopoResult<Row> {
    if !matches!(row.value, TopoValue::Controller(_)) {
        return Err(TopoError::InvalidRequest(format!(
            "state row for {} is not a controller",
            row.key
        )));
    }
    let _ = row.value.set_oper_status(OperStatus::Down);
    Row::applied(row.key, row.value)
}
