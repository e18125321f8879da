//! Per-controller audit state machine.
//!
//! An audit reconciles RUNNING with what one controller actually reports. The driver uploads
//! its view into IMPORT, the TC drives the same vote/global-commit rounds as a configuration
//! commit, and `end_audit_transaction` merges IMPORT into RUNNING. Different controllers are
//! audited concurrently; one controller is audited at most once at a time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use topo_common::error::{TopoError, TopoResult};
use topo_core::containers::HotMap as HashMap;
use topo_core::key::{KeyType, TopoKey};
use topo_core::notify::{Alarm, AlarmKind, Notification};
use topo_core::record::{CommitVersionRecord, OperStatusPendingList};
use topo_core::value::{DriverType, OperStatus, Row};
use topo_core::version::DatastoreVersion;
use topo_storage::pool::{ConnectionPurpose, DbConnection};
use tracing::{debug, info, warn};

use crate::context::{SYSTEM_SESSION, TxContext};
use crate::phase::{CommitPhase, DriverOutcome, RoundProgress, TransactionPhase};
use crate::timer::NotificationTimers;
use crate::transaction::DriverControllers;

/// What an audit reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditKind {
    /// Full reconciliation: IMPORT rows are merged into RUNNING.
    Normal,
    /// Operational-status refresh only; RUNNING rows are not created or deleted.
    RealNetwork,
}

/// Row counts produced by one IMPORT merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Rows added to RUNNING.
    pub created: usize,
    /// Rows whose configuration changed in RUNNING.
    pub updated: usize,
    /// Rows removed from RUNNING.
    pub deleted: usize,
    /// Operational-status changes staged for the end of the audit.
    pub staged: usize,
}

/// Result of a finished audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSummary {
    /// Audited controller.
    pub controller: String,
    /// Whether the audit was applied.
    pub succeeded: bool,
    /// Controller status after the audit.
    pub status: OperStatus,
    /// Notifications handed to the northbound sink.
    pub notified: usize,
}

#[derive(Debug)]
struct AuditSession {
    controller: String,
    driver_type: DriverType,
    kind: AuditKind,
    phase: TransactionPhase,
    prior_status: OperStatus,
    aborted: bool,
    merged: bool,
    /// Side effects of the IMPORT merge; dropped when the audit fails.
    pending: OperStatusPendingList,
    /// Southbound reports received during the audit; applied however the audit ends.
    live: OperStatusPendingList,
    notifications: Vec<Notification>,
}

type SessionSlot = Arc<Mutex<AuditSession>>;

/// Notifications held back while a controller's post-audit timer is armed.
///
/// A queue exists exactly while a timer of its generation has not flushed it.
#[derive(Debug, Default)]
struct DeferredQueue {
    generation: u64,
    queued: Vec<Notification>,
}

type DeferredNotifications = Arc<Mutex<HashMap<String, DeferredQueue>>>;

/// Audit coordinator holding every active audit session.
#[derive(Debug)]
pub struct AuditRequest {
    ctx: TxContext,
    commit_application: String,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    versions: Mutex<HashMap<String, CommitVersionRecord>>,
    timers: NotificationTimers,
    deferred: DeferredNotifications,
    timer_generation: AtomicU64,
}

fn lock_session(slot: &SessionSlot) -> TopoResult<MutexGuard<'_, AuditSession>> {
    slot.lock()
        .map_err(|_| TopoError::InvalidState("audit session mutex is poisoned"))
}

impl AuditRequest {
    /// Creates the audit coordinator.
    #[must_use]
    pub fn new(ctx: TxContext, timers: NotificationTimers, commit_application: String) -> Self {
        Self {
            ctx,
            commit_application,
            sessions: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
            timers,
            deferred: Arc::new(Mutex::new(HashMap::new())),
            timer_generation: AtomicU64::new(0),
        }
    }

    fn deferred(&self) -> TopoResult<MutexGuard<'_, HashMap<String, DeferredQueue>>> {
        self.deferred
            .lock()
            .map_err(|_| TopoError::InvalidState("deferred notification mutex is poisoned"))
    }

    fn sessions(&self) -> TopoResult<MutexGuard<'_, HashMap<String, SessionSlot>>> {
        self.sessions
            .lock()
            .map_err(|_| TopoError::InvalidState("audit session map mutex is poisoned"))
    }

    fn session(&self, controller: &str) -> TopoResult<SessionSlot> {
        self.sessions()?
            .get(controller)
            .cloned()
            .ok_or(TopoError::InvalidState("controller is not under audit"))
    }

    /// Returns whether `controller` has an active audit session.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the session map mutex is poisoned.
    pub fn is_under_audit(&self, controller: &str) -> TopoResult<bool> {
        Ok(self.sessions()?.contains_key(controller))
    }

    /// Controllers currently under audit, sorted.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the session map mutex is poisoned.
    pub fn active_audits(&self) -> TopoResult<Vec<String>> {
        let mut controllers = self.sessions()?.keys().cloned().collect::<Vec<_>>();
        controllers.sort_unstable();
        Ok(controllers)
    }

    /// Last commit version recorded for `controller`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the version map mutex is poisoned.
    pub fn commit_version(&self, controller: &str) -> TopoResult<Option<CommitVersionRecord>> {
        Ok(self
            .versions
            .lock()
            .map_err(|_| TopoError::InvalidState("commit version mutex is poisoned"))?
            .get(controller)
            .cloned())
    }

    /// Post-audit notification timers.
    #[must_use]
    pub const fn timers(&self) -> &NotificationTimers {
        &self.timers
    }

    /// Opens an audit session for `controller`.
    ///
    /// The controller's current status is snapshotted and replaced by `AUDITING` in STATE.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the controller already has a session or its status
    /// is already `AUDITING`, `TopoError::DbQuery` for unknown controllers,
    /// `TopoError::InvalidRequest` when `driver_type` does not serve the controller, and
    /// datastore errors.
    pub fn start_audit(
        &self,
        controller: &str,
        driver_type: DriverType,
        kind: AuditKind,
    ) -> TopoResult<()> {
        let slot = Arc::new(Mutex::new(AuditSession {
            controller: controller.to_owned(),
            driver_type,
            kind,
            phase: TransactionPhase::End,
            prior_status: OperStatus::Unknown,
            aborted: false,
            merged: false,
            pending: OperStatusPendingList::default(),
            live: OperStatusPendingList::default(),
            notifications: Vec::new(),
        }));
        {
            let mut sessions = self.sessions()?;
            if sessions.contains_key(controller) {
                warn!(controller, "audit already in progress");
                return Err(TopoError::InvalidState("controller audit already in progress"));
            }
            let _ = sessions.insert(controller.to_owned(), Arc::clone(&slot));
        }

        match self.mark_auditing(controller, driver_type) {
            Ok(prior_status) => {
                let mut session = lock_session(&slot)?;
                session.prior_status = prior_status;
                session.phase.advance(TransactionPhase::Start)?;
                info!(controller, driver = %driver_type, ?kind, prior = ?prior_status, "audit started");
                Ok(())
            }
            Err(error) => {
                let _ = self.sessions()?.remove(controller);
                Err(error)
            }
        }
    }

    fn mark_auditing(&self, controller: &str, driver_type: DriverType) -> TopoResult<OperStatus> {
        let connection = self
            .ctx
            .checkout(ConnectionPurpose::RwSouthbound, SYSTEM_SESSION)?;
        let key = TopoKey::controller(controller);
        let Some(configured) = self
            .ctx
            .escalate("read controller", connection.get(DatastoreVersion::Running, &key))?
        else {
            return Err(TopoError::DbQuery(format!(
                "controller {controller} is not configured"
            )));
        };
        if configured.value.driver_type() != Some(driver_type) {
            return Err(TopoError::InvalidRequest(format!(
                "driver {driver_type} does not serve controller {controller}"
            )));
        }
        let state = self
            .ctx
            .escalate("read controller state", connection.get(DatastoreVersion::State, &key))?;
        let prior = state
            .as_ref()
            .and_then(|row| row.value.oper_status())
            .unwrap_or(OperStatus::Unknown);
        if prior == OperStatus::Auditing {
            return Err(TopoError::InvalidState("controller is already auditing"));
        }
        let mut marked = state.unwrap_or(configured);
        let _ = marked.value.set_oper_status(OperStatus::Auditing);
        let marked = Row::applied(marked.key, marked.value)?;
        self.ctx.escalate(
            "mark controller auditing",
            connection.put(DatastoreVersion::State, marked),
        )?;
        self.ctx.escalate(
            "clear stale import",
            connection.clear_controller(DatastoreVersion::Import, controller),
        )?;
        Ok(prior)
    }

    /// Moves the audit to `START_SUCCESS`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the controller is not under audit or not at
    /// `START`.
    pub fn start_audit_transaction(&self, controller: &str) -> TopoResult<()> {
        let slot = self.session(controller)?;
        let mut session = lock_session(&slot)?;
        session
            .phase
            .expect(TransactionPhase::Start, "audit transaction requested outside START")?;
        session.phase.advance(TransactionPhase::StartSuccess)?;
        debug!(controller, "audit transaction started");
        Ok(())
    }

    /// Stores rows reported by the controller into IMPORT.
    ///
    /// Only key types that take part in the audit merge are accepted, and every row must belong
    /// to the audited controller.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the controller is not under audit or the audit was
    /// aborted, `TopoError::InvalidRequest` for foreign or unmergeable rows, and datastore
    /// errors.
    pub fn upload_import(&self, controller: &str, rows: Vec<Row>) -> TopoResult<usize> {
        let slot = self.session(controller)?;
        let session = lock_session(&slot)?;
        if session.aborted || session.merged {
            return Err(TopoError::InvalidState("audit no longer accepts import rows"));
        }
        for row in &rows {
            if row.key.controller_name() != Some(controller) {
                return Err(TopoError::InvalidRequest(format!(
                    "{} does not belong to controller {controller}",
                    row.key
                )));
            }
            if self
                .ctx
                .registry
                .spec(row.key.key_type())?
                .audit_merge_rank
                .is_none()
            {
                return Err(TopoError::InvalidRequest(format!(
                    "{} is not reconciled by audit",
                    row.key.key_type()
                )));
            }
        }
        let connection = self
            .ctx
            .checkout(ConnectionPurpose::RwSouthbound, SYSTEM_SESSION)?;
        let count = rows.len();
        for row in rows {
            let row = Row::applied(row.key, row.value)?;
            self.ctx
                .escalate("write import", connection.put(DatastoreVersion::Import, row))?;
        }
        drop(session);
        debug!(controller, rows = count, "import rows uploaded");
        Ok(count)
    }

    /// Starts the audit vote round.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` unless the audit is at `START_SUCCESS`.
    pub fn handle_vote_request(&self, controller: &str) -> TopoResult<DriverControllers> {
        self.open_round(
            controller,
            TransactionPhase::StartSuccess,
            "audit vote requested outside START_SUCCESS",
            [TransactionPhase::VoteBegin, TransactionPhase::VoteWaitResult],
        )
    }

    /// Starts the audit global commit round.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` unless the audit is at `VOTE_SUCCESS`.
    pub fn handle_global_commit_request(&self, controller: &str) -> TopoResult<DriverControllers> {
        self.open_round(
            controller,
            TransactionPhase::VoteSuccess,
            "audit global commit requested outside VOTE_SUCCESS",
            [
                TransactionPhase::GlobalCommitBegin,
                TransactionPhase::GlobalCommitWaitResult,
            ],
        )
    }

    fn open_round(
        &self,
        controller: &str,
        expected: TransactionPhase,
        message: &'static str,
        steps: [TransactionPhase; 2],
    ) -> TopoResult<DriverControllers> {
        let slot = self.session(controller)?;
        let mut session = lock_session(&slot)?;
        session.phase.expect(expected, message)?;
        for step in steps {
            session.phase.advance(step)?;
        }
        let mut instructions = BTreeMap::new();
        let _ = instructions.insert(session.driver_type, vec![session.controller.clone()]);
        Ok(instructions)
    }

    /// Records the driver's result for the current audit round.
    ///
    /// A failure or timeout aborts the audit cycle; the TC is expected to end or cancel the
    /// audit afterwards, which restores the controller status.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when no round of `phase` is waiting and
    /// `TopoError::InvalidRequest` for a driver that does not serve the controller.
    pub fn handle_driver_result(
        &self,
        controller: &str,
        phase: CommitPhase,
        driver: DriverType,
        outcome: DriverOutcome,
    ) -> TopoResult<RoundProgress> {
        let slot = self.session(controller)?;
        let mut session = lock_session(&slot)?;
        let waiting = match phase {
            CommitPhase::Vote => TransactionPhase::VoteWaitResult,
            CommitPhase::GlobalCommit => TransactionPhase::GlobalCommitWaitResult,
        };
        session
            .phase
            .expect(waiting, "audit driver result arrived outside a waiting round")?;
        if driver != session.driver_type {
            return Err(TopoError::InvalidRequest(format!(
                "driver {driver} does not serve controller {controller}"
            )));
        }
        if !outcome.is_success() {
            warn!(controller, ?phase, ?outcome, "driver result aborts audit");
            session.aborted = true;
            session.phase = TransactionPhase::End;
            return Ok(RoundProgress::Aborted);
        }
        match phase {
            CommitPhase::Vote => session.phase.advance(TransactionPhase::VoteSuccess)?,
            CommitPhase::GlobalCommit => {
                session.phase.advance(TransactionPhase::GlobalCommitResult)?;
                session.phase.advance(TransactionPhase::GlobalCommitSuccess)?;
            }
        }
        Ok(RoundProgress::Succeeded)
    }

    /// Reconciles RUNNING with IMPORT after a successful global commit.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` unless the audit is at `GLOBAL_COMMIT_SUCCESS`, and
    /// datastore errors from the merge; a failed merge marks the audit aborted.
    pub fn end_audit_transaction(&self, controller: &str) -> TopoResult<MergeStats> {
        let slot = self.session(controller)?;
        let mut session = lock_session(&slot)?;
        session.phase.expect(
            TransactionPhase::GlobalCommitSuccess,
            "audit end requested before GLOBAL_COMMIT_SUCCESS",
        )?;
        let merged = self
            .ctx
            .checkout(ConnectionPurpose::RwSouthbound, SYSTEM_SESSION)
            .and_then(|connection| match session.kind {
                AuditKind::Normal => self.merge_audit_db_to_running(&connection, &mut session),
                AuditKind::RealNetwork => self.refresh_oper_status(&connection, &mut session),
            });
        session.phase = TransactionPhase::End;
        match self.ctx.escalate("merge import", merged) {
            Ok(stats) => {
                session.merged = true;
                info!(
                    controller,
                    created = stats.created,
                    updated = stats.updated,
                    deleted = stats.deleted,
                    staged = stats.staged,
                    "audit merge finished"
                );
                Ok(stats)
            }
            Err(error) => {
                session.aborted = true;
                warn!(controller, %error, "audit merge failed");
                Err(error)
            }
        }
    }

    /// Merges the controller's IMPORT rows into RUNNING in dependency order.
    ///
    /// Rows missing from RUNNING are created, rows with a different configuration are updated,
    /// and RUNNING rows the controller no longer reports are deleted in reverse order after every
    /// key type was merged. Status changes of existing rows are staged, not written.
    fn merge_audit_db_to_running(
        &self,
        connection: &DbConnection,
        session: &mut AuditSession,
    ) -> TopoResult<MergeStats> {
        let controller = session.controller.clone();
        let mut stats = MergeStats::default();
        let mut stale = Vec::new();
        for key_type in self.ctx.registry.audit_merge_order() {
            let imported = connection.rows_of(DatastoreVersion::Import, key_type, Some(&controller))?;
            let mut running = connection
                .rows_of(DatastoreVersion::Running, key_type, Some(&controller))?
                .into_iter()
                .map(|row| (row.key.clone(), row))
                .collect::<BTreeMap<_, _>>();

            for row in imported {
                match running.remove(&row.key) {
                    None => {
                        write_running(connection, row.clone())?;
                        session.notifications.push(Notification::Create {
                            key: row.key,
                            value: row.value,
                        });
                        stats.created += 1;
                    }
                    Some(existing) => {
                        let reported = row.value.oper_status();
                        if existing.value.differs_in_config(&row.value) {
                            let mut value = row.value;
                            if let Some(status) = existing.value.oper_status() {
                                let _ = value.set_oper_status(status);
                            }
                            write_running(connection, Row::applied(row.key.clone(), value.clone())?)?;
                            session.notifications.push(Notification::Update {
                                key: row.key.clone(),
                                old: existing.value.clone(),
                                new: value,
                            });
                            stats.updated += 1;
                        }
                        if let Some(status) = reported
                            && existing.value.oper_status() != Some(status)
                        {
                            session.pending.stage(row.key, status);
                            stats.staged += 1;
                        }
                    }
                }
            }
            stale.extend(running.into_values());

            if key_type == KeyType::Port {
                stats.staged += derive_logical_port_status(connection, &controller, &mut session.pending)?;
            }
        }

        for row in stale.into_iter().rev() {
            remove_running(connection, &row.key)?;
            session.notifications.push(Notification::Delete {
                key: row.key,
                old: row.value,
            });
            stats.deleted += 1;
        }
        Ok(stats)
    }

    fn refresh_oper_status(
        &self,
        connection: &DbConnection,
        session: &mut AuditSession,
    ) -> TopoResult<MergeStats> {
        let controller = session.controller.clone();
        let mut stats = MergeStats::default();
        for key_type in self.ctx.registry.audit_merge_order() {
            for row in connection.rows_of(DatastoreVersion::Import, key_type, Some(&controller))? {
                let Some(reported) = row.value.oper_status() else {
                    continue;
                };
                let current = connection
                    .get(DatastoreVersion::Running, &row.key)?
                    .and_then(|existing| existing.value.oper_status());
                if current.is_some_and(|status| status != reported) {
                    session.pending.stage(row.key, reported);
                    stats.staged += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Closes the audit of `controller`.
    ///
    /// On success the staged status changes are applied, the controller goes `UP`, a commit
    /// version record is stored, IMPORT is cleared, notifications are sent, the audit alarm is
    /// cleared, and the controller's notification timer starts. Otherwise the pre-audit status
    /// is restored, dependents follow it when it is `DOWN`, and an audit alarm is raised.
    ///
    /// `reported` is the controller's own commit version; it is kept only when fresher than the
    /// stored one.
    ///
    /// When applying a successful audit fails partway, the audit is closed again as failed on a
    /// fresh connection so the controller does not stay `AUDITING`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the controller is not under audit, and datastore
    /// errors. The controller leaves the audit set in every case.
    pub fn end_audit(
        &self,
        controller: &str,
        succeeded: bool,
        reported: Option<CommitVersionRecord>,
    ) -> TopoResult<AuditSummary> {
        let slot = self
            .sessions()?
            .remove(controller)
            .ok_or(TopoError::InvalidState("controller is not under audit"))?;
        let mut session = lock_session(&slot)?;
        let applied = succeeded && session.merged && !session.aborted;
        let closed = self.close_session(&mut session, applied, reported);
        let status = match self.ctx.escalate("end audit", closed) {
            Ok(status) => status,
            Err(error) => {
                warn!(controller, %error, "audit end failed, restoring controller status");
                let restored = self.close_session(&mut session, false, None);
                match self.ctx.escalate("restore controller status", restored) {
                    Ok(status) => info!(controller, ?status, "controller status restored"),
                    Err(restore) => {
                        warn!(controller, error = %restore, "controller status not restored");
                    }
                }
                let notifications = std::mem::take(&mut session.notifications);
                let _ = self.ctx.deliver(&notifications);
                self.raise_audit_alarm(controller, &error.to_string());
                return Err(error);
            }
        };

        let notifications = std::mem::take(&mut session.notifications);
        let failed = self.ctx.deliver(&notifications);
        if applied {
            self.ctx.alarms.publish(Alarm::clear(
                AlarmKind::AuditFailure,
                Some(controller),
                "audit completed",
            ));
            self.start_timer(controller)?;
        } else {
            self.raise_audit_alarm(controller, "audit did not complete");
        }
        info!(controller, succeeded = applied, status = ?status, "audit ended");
        Ok(AuditSummary {
            controller: controller.to_owned(),
            succeeded: applied,
            status,
            notified: notifications.len() - failed,
        })
    }

    /// Finishes the session on its own connection and clears the controller's IMPORT rows.
    ///
    /// The connection is released on return, so a retry checks out a fresh one.
    fn close_session(
        &self,
        session: &mut AuditSession,
        applied: bool,
        reported: Option<CommitVersionRecord>,
    ) -> TopoResult<OperStatus> {
        let connection = self
            .ctx
            .checkout(ConnectionPurpose::RwSouthbound, SYSTEM_SESSION)?;
        let finished = if applied {
            self.finish_success(&connection, session, reported)
        } else {
            self.finish_failure(&connection, session)
        };
        if let Err(error) = connection.clear_controller(DatastoreVersion::Import, &session.controller)
        {
            warn!(controller = %session.controller, %error, "import rows not cleared");
        }
        finished
    }

    fn finish_success(
        &self,
        connection: &DbConnection,
        session: &mut AuditSession,
        reported: Option<CommitVersionRecord>,
    ) -> TopoResult<OperStatus> {
        let mut pending = session.pending.clone();
        for change in session.live.clone().take() {
            pending.stage(change.key, change.oper_status);
        }
        let applied = apply_pending(connection, &mut pending)?;
        session.pending = OperStatusPendingList::default();
        session.live = OperStatusPendingList::default();
        session.notifications.extend(applied);
        session
            .notifications
            .extend(set_controller_state(connection, &session.controller, OperStatus::Up)?);
        self.record_commit_version(&session.controller, reported)?;
        Ok(OperStatus::Up)
    }

    fn finish_failure(
        &self,
        connection: &DbConnection,
        session: &mut AuditSession,
    ) -> TopoResult<OperStatus> {
        let restored = session.prior_status;
        session
            .notifications
            .extend(set_controller_state(connection, &session.controller, restored)?);
        session.pending = OperStatusPendingList::default();
        let mut pending = session.live.clone();
        if restored == OperStatus::Down {
            self.stage_cascade(connection, &session.controller, restored, &mut pending)?;
        }
        let applied = apply_pending(connection, &mut pending)?;
        session.live = OperStatusPendingList::default();
        session.notifications.extend(applied);
        Ok(restored)
    }

    fn stage_cascade(
        &self,
        connection: &DbConnection,
        controller: &str,
        status: OperStatus,
        pending: &mut OperStatusPendingList,
    ) -> TopoResult<()> {
        for key_type in self.ctx.registry.audit_merge_order() {
            let Some(derived) = self.ctx.registry.cascade_status(key_type, status) else {
                continue;
            };
            for row in connection.rows_of(DatastoreVersion::Running, key_type, Some(controller))? {
                pending.stage(row.key, derived);
            }
        }
        Ok(())
    }

    fn record_commit_version(
        &self,
        controller: &str,
        reported: Option<CommitVersionRecord>,
    ) -> TopoResult<()> {
        let mut versions = self
            .versions
            .lock()
            .map_err(|_| TopoError::InvalidState("commit version mutex is poisoned"))?;
        let previous = versions.get(controller);
        let record = match reported {
            Some(record) => record,
            None => CommitVersionRecord {
                commit_number: previous.map_or(1, |record| record.commit_number + 1),
                commit_date: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |elapsed| elapsed.as_secs()),
                commit_application: self.commit_application.clone(),
            },
        };
        if let Some(previous) = previous
            && !record.is_fresher_than(previous)
        {
            warn!(
                controller,
                stored = previous.commit_number,
                reported = record.commit_number,
                "stale commit version ignored"
            );
            return Ok(());
        }
        let _ = versions.insert(controller.to_owned(), record);
        Ok(())
    }

    fn raise_audit_alarm(&self, controller: &str, detail: &str) {
        self.ctx.alarms.publish(Alarm::raise(
            AlarmKind::AuditFailure,
            Some(controller),
            detail,
        ));
    }

    /// Arms the deferred queue of `controller` and starts the timer that flushes it.
    ///
    /// The queue is armed before the timer starts and only the timer of the same generation
    /// disarms it, under the queue lock, so a replaced timer never flushes its successor's queue.
    fn start_timer(&self, controller: &str) -> TopoResult<()> {
        let generation = self.timer_generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.deferred()?
            .entry(controller.to_owned())
            .or_default()
            .generation = generation;

        let deferred = Arc::clone(&self.deferred);
        let ctx = self.ctx.clone();
        let name = controller.to_owned();
        let started = self.timers.start(
            controller,
            Box::new(move || {
                let Ok(mut queues) = deferred.lock() else {
                    warn!(controller = %name, "deferred notification mutex is poisoned");
                    return;
                };
                if queues
                    .get(&name)
                    .is_none_or(|queue| queue.generation != generation)
                {
                    return;
                }
                let queued = queues.remove(&name).map(|queue| queue.queued).unwrap_or_default();
                let failed = ctx.deliver(&queued);
                debug!(controller = %name, flushed = queued.len() - failed, "deferred notifications flushed");
            }),
        );
        if started.is_err()
            && let Some(queue) = self.deferred()?.remove(controller)
        {
            let _ = self.ctx.deliver(&queue.queued);
        }
        started
    }

    /// Cancels the audit of `controller` as a failed audit.
    ///
    /// Returns `None` when the controller is not under audit.
    ///
    /// # Errors
    ///
    /// Returns datastore errors from restoring the controller status.
    pub fn cancel_audit(&self, controller: &str) -> TopoResult<Option<AuditSummary>> {
        if !self.is_under_audit(controller)? {
            return Ok(None);
        }
        self.end_audit(controller, false, None).map(Some)
    }

    /// Applies one southbound operational-status report.
    ///
    /// While the controller is under audit the change is kept with the audit and applied when it
    /// ends, successful or not. Otherwise it is applied at once; a controller going `DOWN` drags
    /// its dependents along. Notifications are held back while the controller's post-audit timer
    /// is armed and flushed when it fires.
    /// Returns the number of notifications produced.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidRequest` for keys without a controller or a status attribute,
    /// and datastore errors.
    pub fn report_oper_status(&self, key: &TopoKey, status: OperStatus) -> TopoResult<usize> {
        let Some(controller) = key.controller_name() else {
            return Err(TopoError::InvalidRequest(format!(
                "{key} has no owning controller"
            )));
        };
        if let Some(slot) = self.sessions()?.get(controller).cloned() {
            if key.key_type() == KeyType::Controller {
                debug!(controller, ?status, "controller status report ignored during audit");
                return Ok(0);
            }
            lock_session(&slot)?.live.stage(key.clone(), status);
            debug!(key = %key, ?status, "status report held until audit end");
            return Ok(0);
        }

        let connection = self
            .ctx
            .checkout(ConnectionPurpose::RwSouthbound, SYSTEM_SESSION)?;
        let mut pending = OperStatusPendingList::default();
        let mut notifications = Vec::new();
        if key.key_type() == KeyType::Controller {
            if let Some(notification) = self.ctx.escalate(
                "write controller state",
                set_controller_state(&connection, controller, status),
            )? {
                notifications.push(notification);
            }
            if status == OperStatus::Down {
                self.stage_cascade(&connection, controller, status, &mut pending)?;
            }
        } else {
            pending.stage(key.clone(), status);
        }
        notifications.extend(self.ctx.escalate(
            "apply status",
            apply_pending(&connection, &mut pending),
        )?);
        drop(connection);

        let produced = notifications.len();
        let mut queues = self.deferred()?;
        match queues.get_mut(controller) {
            Some(queue) => queue.queued.extend(notifications),
            None => {
                let _ = self.ctx.deliver(&notifications);
            }
        }
        Ok(produced)
    }
}

/// Writes `status` into the controller's STATE row, creating it from RUNNING when missing.
///
/// Returns an update notification when the status changed.
fn set_controller_state(
    connection: &DbConnection,
    controller: &str,
    status: OperStatus,
) -> TopoResult<Option<Notification>> {
    let key = TopoKey::controller(controller);
    let current = match connection.get(DatastoreVersion::State, &key)? {
        Some(row) => row,
        None => connection
            .get(DatastoreVersion::Running, &key)?
            .ok_or_else(|| TopoError::DbQuery(format!("controller {controller} is not configured")))?,
    };
    let old = current.value.clone();
    let mut value = current.value;
    let _ = value.set_oper_status(status);
    connection.put(DatastoreVersion::State, Row::applied(key.clone(), value.clone())?)?;
    Ok((old.oper_status() != Some(status)).then_some(Notification::Update { key, old, new: value }))
}

/// Applies staged status changes to RUNNING, returning update notifications for real changes.
fn apply_pending(
    connection: &DbConnection,
    pending: &mut OperStatusPendingList,
) -> TopoResult<Vec<Notification>> {
    let mut notifications = Vec::new();
    for change in pending.take() {
        let Some(row) = connection.get(DatastoreVersion::Running, &change.key)? else {
            continue;
        };
        if row.value.oper_status() == Some(change.oper_status) {
            continue;
        }
        let old = row.value.clone();
        let mut value = row.value;
        if !value.set_oper_status(change.oper_status) {
            continue;
        }
        write_running(connection, Row::applied(change.key.clone(), value.clone())?)?;
        notifications.push(Notification::Update {
            key: change.key,
            old,
            new: value,
        });
    }
    Ok(notifications)
}

/// Writes one row into RUNNING and mirrors it into CANDIDATE unless CANDIDATE holds an
/// uncommitted change of the same key.
fn write_running(connection: &DbConnection, row: Row) -> TopoResult<()> {
    let candidate = connection.get(DatastoreVersion::Candidate, &row.key)?;
    if !candidate.is_some_and(|existing| existing.status.is_pending()) {
        connection.put(DatastoreVersion::Candidate, row.clone())?;
    }
    connection.put(DatastoreVersion::Running, row)
}

fn remove_running(connection: &DbConnection, key: &TopoKey) -> TopoResult<()> {
    let candidate = connection.get(DatastoreVersion::Candidate, key)?;
    if !candidate.is_some_and(|existing| existing.status.is_pending()) {
        let _ = connection.remove(DatastoreVersion::Candidate, key)?;
    }
    let _ = connection.remove(DatastoreVersion::Running, key)?;
    Ok(())
}

/// Stages `DOWN` for every logical port whose member ports all sit on `DOWN` physical ports.
///
/// Runs after physical ports were merged, so it can correct a status staged for a logical port
/// earlier in the same merge. Returns the number of logical ports staged.
fn derive_logical_port_status(
    connection: &DbConnection,
    controller: &str,
    pending: &mut OperStatusPendingList,
) -> TopoResult<usize> {
    let members = connection.rows_of(
        DatastoreVersion::Running,
        KeyType::LogicalMemberPort,
        Some(controller),
    )?;
    let mut by_logical_port: BTreeMap<TopoKey, Vec<TopoKey>> = BTreeMap::new();
    for member in members {
        let TopoKey::LogicalMemberPort {
            controller,
            switch_id,
            physical_port_id,
            ..
        } = &member.key
        else {
            continue;
        };
        let physical = TopoKey::port(controller.clone(), switch_id.clone(), physical_port_id.clone());
        if let Some(logical_port) = member.key.parent() {
            by_logical_port.entry(logical_port).or_default().push(physical);
        }
    }

    let mut staged = 0;
    for (logical_port, ports) in by_logical_port {
        let mut all_down = true;
        for port in &ports {
            let status = match pending.get(port) {
                Some(status) => Some(status),
                None => connection
                    .get(DatastoreVersion::Running, port)?
                    .and_then(|row| row.value.oper_status()),
            };
            if status != Some(OperStatus::Down) {
                all_down = false;
                break;
            }
        }
        if all_down {
            pending.stage(logical_port, OperStatus::Down);
            staged += 1;
        }
    }
    Ok(staged)
}

#[cfg(test)]
impl AuditRequest {
    fn phase_of(&self, controller: &str) -> Option<TransactionPhase> {
        let slot = self.session(controller).ok()?;
        let session = lock_session(&slot).ok()?;
        Some(session.phase)
    }

    fn is_deferring(&self, controller: &str) -> bool {
        self.deferred()
            .map(|queues| queues.contains_key(controller))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use googletest::prelude::*;
    use rstest::rstest;
    use topo_common::error::TopoError;
    use topo_core::key::TopoKey;
    use topo_core::notify::{AlarmKind, Notification};
    use topo_core::record::CommitVersionRecord;
    use topo_core::value::{DriverType, OperStatus, RowStatus};
    use topo_core::version::DatastoreVersion;
    use topo_storage::datastore::FaultPoint;

    use super::{AuditKind, AuditRequest};
    use crate::phase::{CommitPhase, DriverOutcome, RoundProgress, TransactionPhase};
    use crate::test_support::{
        Harness, controller_row, domain_row, logical_member_row, logical_port_row, port_row,
        switch_row,
    };

    fn seeded() -> Harness {
        let harness = Harness::new();
        for name in ["c1", "c2"] {
            harness.put(
                DatastoreVersion::Running,
                controller_row(name, RowStatus::Applied),
            );
            harness.put(
                DatastoreVersion::Candidate,
                controller_row(name, RowStatus::Applied),
            );
        }
        harness
    }

    fn drive_to_merge(audit: &AuditRequest, controller: &str) {
        let _ = audit.start_audit_transaction(controller);
        let _ = audit.handle_vote_request(controller);
        let _ = audit.handle_driver_result(controller, CommitPhase::Vote, DriverType::Pfc, DriverOutcome::Success);
        let _ = audit.handle_global_commit_request(controller);
        let _ = audit.handle_driver_result(
            controller,
            CommitPhase::GlobalCommit,
            DriverType::Pfc,
            DriverOutcome::Success,
        );
    }

    #[rstest]
    fn second_start_for_same_controller_is_rejected_but_others_proceed() {
        let harness = seeded();
        let audit = harness.audit();

        assert_that!(
            &audit.start_audit("c1", DriverType::Pfc, AuditKind::Normal),
            eq(&Ok(()))
        );
        assert_that!(
            &audit.start_audit("c1", DriverType::Pfc, AuditKind::Normal),
            eq(&Err(TopoError::InvalidState("controller audit already in progress")))
        );
        assert_that!(
            &audit.start_audit("c2", DriverType::Pfc, AuditKind::Normal),
            eq(&Ok(()))
        );
        assert_eq!(
            audit.active_audits().unwrap_or_default(),
            vec!["c1".to_owned(), "c2".to_owned()]
        );
    }

    #[rstest]
    fn controller_already_auditing_in_state_is_rejected() {
        let harness = seeded();
        let mut auditing = controller_row("c1", RowStatus::Applied);
        let _ = auditing.value.set_oper_status(OperStatus::Auditing);
        harness.put(DatastoreVersion::State, auditing);
        let audit = harness.audit();

        assert_that!(
            &audit.start_audit("c1", DriverType::Pfc, AuditKind::Normal),
            eq(&Err(TopoError::InvalidState("controller is already auditing")))
        );
        assert_that!(&audit.is_under_audit("c1"), eq(&Ok(false)));
    }

    #[rstest]
    fn normal_audit_merges_import_and_brings_controller_up() {
        let harness = seeded();
        harness.put(
            DatastoreVersion::Running,
            switch_row("c1", "old-switch", OperStatus::Up),
        );
        harness.put(
            DatastoreVersion::Running,
            domain_row("c1", "d1", RowStatus::Applied),
        );
        let audit = harness.audit();
        let _ = audit.start_audit("c1", DriverType::Pfc, AuditKind::Normal);
        let uploaded = audit.upload_import(
            "c1",
            vec![
                domain_row("c1", "d1", RowStatus::Applied),
                switch_row("c1", "s1", OperStatus::Up),
                port_row("c1", "s1", "p1", OperStatus::Up),
            ],
        );
        assert_that!(&uploaded, eq(&Ok(3_usize)));
        drive_to_merge(&audit, "c1");

        let stats = audit.end_audit_transaction("c1").unwrap_or_default();
        assert_that!(stats.created, eq(2_usize));
        assert_that!(stats.deleted, eq(1_usize));
        assert_that!(audit.phase_of("c1"), eq(Some(TransactionPhase::End)));

        let summary = audit.end_audit("c1", true, None);
        assert_that!(summary.as_ref().map(|summary| summary.succeeded), eq(Ok(true)));
        assert_that!(&audit.is_under_audit("c1"), eq(&Ok(false)));
        assert_that!(
            harness
                .keys(DatastoreVersion::Running)
                .contains(&TopoKey::switch("c1", "s1")),
            eq(true)
        );
        assert_that!(
            harness
                .keys(DatastoreVersion::Running)
                .contains(&TopoKey::switch("c1", "old-switch")),
            eq(false)
        );
        assert_that!(harness.keys(DatastoreVersion::Import).is_empty(), eq(true));
        assert_that!(
            harness.state_status("c1"),
            eq(Some(OperStatus::Up))
        );
        assert_that!(
            audit
                .commit_version("c1")
                .ok()
                .flatten()
                .map(|record| record.commit_number),
            eq(Some(1_u64))
        );
        let delivered = harness.journal.entries().unwrap_or_default();
        assert_that!(
            delivered
                .iter()
                .filter(|entry| matches!(entry.notification, Notification::Create { .. }))
                .count(),
            eq(2_usize)
        );
        assert_that!(&audit.timers().len(), eq(&Ok(1_usize)));
    }

    #[rstest]
    fn later_port_merge_corrects_logical_port_status() {
        let harness = seeded();
        harness.put(
            DatastoreVersion::Running,
            logical_port_row("c1", "d1", "lp1", OperStatus::Up),
        );
        harness.put(
            DatastoreVersion::Running,
            port_row("c1", "s1", "p1", OperStatus::Up),
        );
        let audit = harness.audit();
        let _ = audit.start_audit("c1", DriverType::Pfc, AuditKind::Normal);
        let _ = audit.upload_import(
            "c1",
            vec![
                logical_port_row("c1", "d1", "lp1", OperStatus::Up),
                logical_member_row("c1", "d1", "lp1", "s1", "p1"),
                switch_row("c1", "s1", OperStatus::Up),
                port_row("c1", "s1", "p1", OperStatus::Down),
            ],
        );
        drive_to_merge(&audit, "c1");
        let _ = audit.end_audit_transaction("c1");
        let _ = audit.end_audit("c1", true, None);

        assert_that!(
            harness.running_status(&TopoKey::logical_port("c1", "d1", "lp1")),
            eq(Some(OperStatus::Down))
        );
        assert_that!(
            harness.running_status(&TopoKey::port("c1", "s1", "p1")),
            eq(Some(OperStatus::Down))
        );
    }

    #[rstest]
    fn failed_vote_restores_prior_status_and_raises_alarm() {
        let harness = seeded();
        let mut down = controller_row("c1", RowStatus::Applied);
        let _ = down.value.set_oper_status(OperStatus::Down);
        harness.put(DatastoreVersion::State, down);
        harness.put(
            DatastoreVersion::Running,
            domain_row("c1", "d1", RowStatus::Applied),
        );
        let audit = harness.audit();

        let _ = audit.start_audit("c1", DriverType::Pfc, AuditKind::Normal);
        assert_that!(harness.state_status("c1"), eq(Some(OperStatus::Auditing)));
        let _ = audit.start_audit_transaction("c1");
        let _ = audit.handle_vote_request("c1");
        assert_that!(
            &audit.handle_driver_result("c1", CommitPhase::Vote, DriverType::Pfc, DriverOutcome::Timeout),
            eq(&Ok(RoundProgress::Aborted))
        );

        let summary = audit.end_audit("c1", true, None);
        assert_that!(summary.as_ref().map(|summary| summary.succeeded), eq(Ok(false)));
        assert_that!(harness.state_status("c1"), eq(Some(OperStatus::Down)));
        assert_that!(
            harness.running_status(&TopoKey::domain("c1", "d1")),
            eq(Some(OperStatus::Down))
        );
        assert_that!(
            &harness.alarms.is_active(AlarmKind::AuditFailure, Some("c1")),
            eq(&Ok(true))
        );
        assert_that!(&audit.is_under_audit("c1"), eq(&Ok(false)));
    }

    #[rstest]
    fn stale_reported_commit_version_is_ignored() {
        let harness = seeded();
        let audit = harness.audit();
        let run = |number: u64| {
            let _ = audit.start_audit("c1", DriverType::Pfc, AuditKind::RealNetwork);
            drive_to_merge(&audit, "c1");
            let _ = audit.end_audit_transaction("c1");
            let _ = audit.end_audit(
                "c1",
                true,
                Some(CommitVersionRecord {
                    commit_number: number,
                    commit_date: 100,
                    commit_application: "driver".to_owned(),
                }),
            );
        };
        run(5);
        run(3);
        assert_that!(
            audit
                .commit_version("c1")
                .ok()
                .flatten()
                .map(|record| record.commit_number),
            eq(Some(5_u64))
        );
    }

    #[rstest]
    fn status_reports_are_staged_during_audit_and_deferred_by_the_timer() {
        let harness = Harness::with_notification_delay(Duration::from_millis(250));
        harness.put(
            DatastoreVersion::Running,
            controller_row("c1", RowStatus::Applied),
        );
        harness.put(
            DatastoreVersion::Running,
            port_row("c1", "s1", "p1", OperStatus::Up),
        );
        let audit = harness.audit();
        let port = TopoKey::port("c1", "s1", "p1");

        let _ = audit.start_audit("c1", DriverType::Pfc, AuditKind::RealNetwork);
        assert_that!(&audit.report_oper_status(&port, OperStatus::Down), eq(&Ok(0_usize)));
        drive_to_merge(&audit, "c1");
        let _ = audit.end_audit_transaction("c1");
        let _ = audit.end_audit("c1", true, None);
        assert_that!(harness.running_status(&port), eq(Some(OperStatus::Down)));
        let after_audit = harness.journal.len().unwrap_or_default();

        assert_that!(&audit.report_oper_status(&port, OperStatus::Up), eq(&Ok(1_usize)));
        assert_that!(&harness.journal.len(), eq(&Ok(after_audit)));
        std::thread::sleep(Duration::from_millis(800));
        assert_that!(&harness.journal.len(), eq(&Ok(after_audit + 1)));
    }

    #[rstest]
    fn cancel_without_session_is_a_no_op() {
        let harness = seeded();
        let audit = harness.audit();
        assert_that!(&audit.cancel_audit("c1"), eq(&Ok(None)));
    }

    #[rstest]
    fn import_rows_of_other_controllers_are_rejected() {
        let harness = seeded();
        let audit = harness.audit();
        let _ = audit.start_audit("c1", DriverType::Pfc, AuditKind::Normal);
        let foreign = audit.upload_import("c1", vec![switch_row("c2", "s1", OperStatus::Up)]);
        assert_that!(matches!(foreign, Err(TopoError::InvalidRequest(_))), eq(true));
    }

    fn with_controller_up() -> Harness {
        let harness = seeded();
        let mut up = controller_row("c1", RowStatus::Applied);
        let _ = up.value.set_oper_status(OperStatus::Up);
        harness.put(DatastoreVersion::State, up);
        harness.put(
            DatastoreVersion::Running,
            port_row("c1", "s1", "p1", OperStatus::Up),
        );
        harness
    }

    #[rstest]
    fn failure_while_applying_a_successful_audit_restores_the_controller() {
        let harness = with_controller_up();
        let audit = harness.audit();
        let port = TopoKey::port("c1", "s1", "p1");

        let _ = audit.start_audit("c1", DriverType::Pfc, AuditKind::RealNetwork);
        let _ = audit.report_oper_status(&port, OperStatus::Down);
        drive_to_merge(&audit, "c1");
        let _ = audit.end_audit_transaction("c1");
        harness
            .store
            .inject_fault(FaultPoint::Read(DatastoreVersion::Running))
            .expect("fault should arm");

        let ended = audit.end_audit("c1", true, None);
        assert_that!(matches!(ended, Err(TopoError::DbAccess(_))), eq(true));
        assert_that!(harness.state_status("c1"), eq(Some(OperStatus::Up)));
        assert_that!(harness.running_status(&port), eq(Some(OperStatus::Down)));
        assert_that!(&audit.is_under_audit("c1"), eq(&Ok(false)));
        assert_that!(
            &harness.alarms.is_active(AlarmKind::AuditFailure, Some("c1")),
            eq(&Ok(true))
        );
        assert_that!(
            &audit.start_audit("c1", DriverType::Pfc, AuditKind::Normal),
            eq(&Ok(()))
        );
    }

    #[rstest]
    fn status_reported_during_a_failed_audit_still_reaches_running() {
        let harness = with_controller_up();
        let audit = harness.audit();
        let port = TopoKey::port("c1", "s1", "p1");

        let _ = audit.start_audit("c1", DriverType::Pfc, AuditKind::Normal);
        assert_that!(&audit.report_oper_status(&port, OperStatus::Down), eq(&Ok(0_usize)));
        let _ = audit.start_audit_transaction("c1");
        let _ = audit.handle_vote_request("c1");
        let _ = audit.handle_driver_result("c1", CommitPhase::Vote, DriverType::Pfc, DriverOutcome::Failure);

        let summary = audit.end_audit("c1", false, None);
        assert_that!(summary.as_ref().map(|summary| summary.succeeded), eq(Ok(false)));
        assert_that!(harness.state_status("c1"), eq(Some(OperStatus::Up)));
        assert_that!(harness.running_status(&port), eq(Some(OperStatus::Down)));
        let delivered = harness.journal.entries().unwrap_or_default();
        assert_that!(
            delivered
                .iter()
                .any(|entry| matches!(&entry.notification, Notification::Update { key, .. } if *key == port)),
            eq(true)
        );
    }

    #[rstest]
    fn reports_after_the_timer_flushed_are_delivered_at_once() {
        let harness = Harness::with_notification_delay(Duration::from_millis(100));
        harness.put(
            DatastoreVersion::Running,
            controller_row("c1", RowStatus::Applied),
        );
        harness.put(
            DatastoreVersion::Running,
            port_row("c1", "s1", "p1", OperStatus::Up),
        );
        let audit = harness.audit();
        let port = TopoKey::port("c1", "s1", "p1");

        for _ in 0..2 {
            let _ = audit.start_audit("c1", DriverType::Pfc, AuditKind::RealNetwork);
            drive_to_merge(&audit, "c1");
            let _ = audit.end_audit_transaction("c1");
            let _ = audit.end_audit("c1", true, None);
        }
        assert_that!(audit.is_deferring("c1"), eq(true));
        std::thread::sleep(Duration::from_millis(600));
        assert_that!(audit.is_deferring("c1"), eq(false));

        let before = harness.journal.len().unwrap_or_default();
        assert_that!(&audit.report_oper_status(&port, OperStatus::Down), eq(&Ok(1_usize)));
        assert_that!(&harness.journal.len(), eq(&Ok(before + 1)));
    }
}
