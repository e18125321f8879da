//! Internal Transaction Coordinator.
//!
//! Single entry point for northbound requests and TC callbacks. Configuration requests and
//! commit callbacks are single-flight; reads bypass the flag; imports and audits are serialized
//! per controller by their own membership sets.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use topo_common::config::{NodeRole, RuntimeConfig};
use topo_common::error::{TopoError, TopoResult};
use topo_common::ids::{ConfigId, SessionId};
use topo_core::key::{KeyType, TopoKey};
use topo_core::notify::SessionAuthority;
use topo_core::registry::KeyTypeRegistry;
use topo_core::value::{OperStatus, Row, TopoValue};
use topo_core::version::DatastoreVersion;
use topo_facade::protocol::{Operation, RequestHeader, ResponseHeader, ResultCode, ServiceId};
use topo_facade::request::{
    Request, RequestBody, Response, ResponseBody, TcAbortMarker, TcAuditKind, TcCall,
    TcDriverResult, TcReply, TcResponse, TcRound, TcRoundState,
};
use topo_storage::pool::{ConnectionPool, ConnectionPurpose};
use topo_transaction::TransactionModule;
use topo_transaction::audit::{AuditKind, AuditRequest};
use topo_transaction::candidate::CandidateWriter;
use topo_transaction::dbconfig::DbConfigurationRequest;
use topo_transaction::import::ImportRequest;
use topo_transaction::phase::{AbortPhase, CommitPhase, DriverOutcome, RoundProgress, TransactionPhase};
use topo_transaction::read::{ReadKind, ReadRequest};
use topo_transaction::transaction::TransactionRequest;
use tracing::{debug, info, warn};

/// Clears the single-flight flag when dropped, including on unwind.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Snapshot of coordinator state for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub role: NodeRole,
    pub phase: TransactionPhase,
    pub config_in_flight: bool,
    pub last_commit_degraded: bool,
    pub active_audits: Vec<String>,
    pub read_connections_in_use: usize,
    pub read_connection_limit: u16,
    pub shutting_down: bool,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "role={:?} phase={} config_in_flight={} last_commit_degraded={} audits=[{}] read_connections={}/{} shutting_down={}",
            self.role,
            self.phase,
            self.config_in_flight,
            self.last_commit_degraded,
            self.active_audits.join(","),
            self.read_connections_in_use,
            self.read_connection_limit,
            self.shutting_down
        )
    }
}

/// The request router.
pub struct InternalTransactionCoordinator {
    role: NodeRole,
    authority: Arc<dyn SessionAuthority>,
    registry: Arc<KeyTypeRegistry>,
    pool: ConnectionPool,
    config_in_flight: AtomicBool,
    transaction: Mutex<TransactionRequest>,
    audit: Arc<AuditRequest>,
    dbconfig: DbConfigurationRequest,
    candidate: CandidateWriter,
    reads: ReadRequest,
    import: ImportRequest,
    shutdown: RwLock<bool>,
}

impl fmt::Debug for InternalTransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalTransactionCoordinator")
            .field("role", &self.role)
            .field("config_in_flight", &self.config_in_flight)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl InternalTransactionCoordinator {
    /// Takes ownership of the transaction module's handlers.
    #[must_use]
    pub fn new(
        config: &RuntimeConfig,
        module: TransactionModule,
        authority: Arc<dyn SessionAuthority>,
    ) -> Self {
        Self {
            role: config.role,
            authority,
            registry: Arc::clone(&module.ctx.registry),
            pool: module.ctx.pool.clone(),
            config_in_flight: AtomicBool::new(false),
            transaction: Mutex::new(module.transaction),
            audit: module.audit,
            dbconfig: module.dbconfig,
            candidate: module.candidate,
            reads: module.reads,
            import: module.import,
            shutdown: RwLock::new(false),
        }
    }

    fn enter_single_flight(&self) -> TopoResult<InFlight<'_>> {
        self.config_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TopoError::OperationNotAllowed("configuration request already in flight"))?;
        Ok(InFlight(&self.config_in_flight))
    }

    fn transaction(&self) -> TopoResult<MutexGuard<'_, TransactionRequest>> {
        self.transaction
            .lock()
            .map_err(|_| TopoError::InvalidState("transaction mutex is poisoned"))
    }

    fn reject_standby(&self) -> TopoResult<()> {
        if self.role == NodeRole::Standby {
            return Err(TopoError::OperationNotAllowed("standby node accepts reads only"));
        }
        Ok(())
    }

    /// Runs `work` unless the coordinator is finalized; in-flight work holds the barrier open.
    fn admitted<T>(&self, work: impl FnOnce() -> TopoResult<T>) -> TopoResult<T> {
        let closed = self
            .shutdown
            .read()
            .map_err(|_| TopoError::InvalidState("shutdown barrier is poisoned"))?;
        if *closed {
            return Err(TopoError::OperationNotAllowed("coordinator is shutting down"));
        }
        work()
    }

    /// Routes one northbound request and answers it.
    pub fn dispatch(&self, request: &Request) -> Response {
        let header = &request.header;
        let outcome = self.admitted(|| match header.operation.service() {
            ServiceId::Configuration => self.configure(request),
            ServiceId::Read => self.read(request),
            ServiceId::OutOfBand => self.out_of_band(request),
        });
        match outcome {
            Ok(body) => Response {
                header: ResponseHeader::answering(header, ResultCode::Success),
                body,
            },
            Err(error) => {
                let code = ResultCode::from(&error);
                warn!(
                    session = header.session_id,
                    operation = %header.operation,
                    ?code,
                    %error,
                    "request rejected"
                );
                Response::rejected(header, code)
            }
        }
    }

    fn keyed(request: &Request) -> TopoResult<(&TopoKey, Option<&TopoValue>)> {
        let RequestBody::Keyed { key, value } = &request.body else {
            return Err(TopoError::InvalidRequest(format!(
                "{} requires a keyed body",
                request.header.operation
            )));
        };
        if key.key_type() != request.header.key_type {
            return Err(TopoError::InvalidRequest(format!(
                "key {key} does not match header key type {}",
                request.header.key_type
            )));
        }
        Ok((key, value.as_ref()))
    }

    fn configure(&self, request: &Request) -> TopoResult<ResponseBody> {
        let header = &request.header;
        self.reject_standby()?;
        self.authority.validate(header.session_id, header.config_id)?;
        self.registry
            .check_config_target(header.key_type, header.datastore_version)?;
        let (key, value) = Self::keyed(request)?;

        let _flight = self.enter_single_flight()?;
        if self.transaction()?.phase() != TransactionPhase::End {
            return Err(TopoError::OperationNotAllowed("commit cycle in progress"));
        }
        let missing_value = || TopoError::InvalidRequest(format!("{} requires a value", header.operation));
        match header.operation {
            Operation::Create => self.candidate.create(
                header.session_id,
                header.datastore_version,
                key.clone(),
                value.cloned().ok_or_else(missing_value)?,
            )?,
            Operation::Update => self.candidate.update(
                header.session_id,
                header.datastore_version,
                key.clone(),
                value.cloned().ok_or_else(missing_value)?,
            )?,
            Operation::Delete => {
                self.candidate
                    .delete(header.session_id, header.datastore_version, key.clone())?;
            }
            _ => return Err(TopoError::InvalidRequest("not a configuration operation".to_owned())),
        }
        debug!(session = header.session_id, operation = %header.operation, key = %key, "configuration applied to candidate");
        Ok(ResponseBody::Empty)
    }

    fn read(&self, request: &Request) -> TopoResult<ResponseBody> {
        let header = &request.header;
        self.registry
            .check_read_target(header.key_type, header.datastore_version)?;
        let (key, _) = Self::keyed(request)?;
        let kind = read_kind(header.operation)?;
        let response = self.reads.read(
            header.session_id,
            kind,
            header.datastore_version,
            key,
            header.max_repeat_count,
        )?;
        Ok(match kind {
            ReadKind::ReadSiblingCount => ResponseBody::Count(response.count),
            _ => ResponseBody::Rows(response.rows),
        })
    }

    fn out_of_band(&self, request: &Request) -> TopoResult<ResponseBody> {
        let header = &request.header;
        if header.operation == Operation::IsCandidateDirty {
            return Ok(ResponseBody::Dirty(
                self.dbconfig.is_candidate_dirty(header.session_id)?,
            ));
        }
        self.reject_standby()?;
        self.authority.validate(header.session_id, header.config_id)?;
        let RequestBody::Controller { controller, rows } = &request.body else {
            return Err(TopoError::InvalidRequest(format!(
                "{} requires a controller body",
                header.operation
            )));
        };
        let count = match header.operation {
            Operation::ImportControllerConfig => {
                self.import
                    .import_controller_config(header.session_id, controller, rows.clone())?
            }
            Operation::MergeControllerConfig => {
                let _flight = self.enter_single_flight()?;
                if self.transaction()?.phase() != TransactionPhase::End {
                    return Err(TopoError::OperationNotAllowed("commit cycle in progress"));
                }
                self.import
                    .merge_controller_config(header.session_id, controller)?
            }
            Operation::ClearImportConfig => self
                .import
                .clear_import_config(header.session_id, controller)?,
            _ => return Err(TopoError::InvalidRequest("not an out-of-band operation".to_owned())),
        };
        Ok(ResponseBody::Count(count))
    }

    /// Handles one TC callback.
    pub fn tc_call(&self, call: TcCall) -> TcResponse {
        let name = call.name();
        match self.admitted(|| self.route_tc(call)) {
            Ok(reply) => {
                debug!(call = name, ?reply, "tc callback handled");
                TcResponse::ok(reply)
            }
            Err(error) => {
                let code = ResultCode::from(&error);
                warn!(call = name, ?code, %error, "tc callback failed");
                TcResponse::failed(code)
            }
        }
    }

    fn route_tc(&self, call: TcCall) -> TopoResult<TcReply> {
        self.reject_standby()?;
        if call.is_commit_scoped() {
            return self.commit_call(call);
        }
        self.audit_call(call)
    }

    fn validated(&self, session: SessionId, config: ConfigId) -> TopoResult<InFlight<'_>> {
        self.authority.validate(session, config)?;
        self.enter_single_flight()
    }

    fn commit_call(&self, call: TcCall) -> TopoResult<TcReply> {
        match call {
            TcCall::CommitTransactionStart { session, config } => {
                let _flight = self.validated(session, config)?;
                let drivers = self.transaction()?.start_transaction(session)?;
                Ok(TcReply::Participants(drivers.into_iter().collect()))
            }
            TcCall::CommitVoteRequest { session, config } => {
                let _flight = self.validated(session, config)?;
                Ok(TcReply::Instructions(self.transaction()?.handle_vote_request()?))
            }
            TcCall::CommitGlobalCommit { session, config } => {
                let _flight = self.validated(session, config)?;
                Ok(TcReply::Instructions(
                    self.transaction()?.handle_global_commit_request()?,
                ))
            }
            TcCall::CommitDriverResult {
                session,
                config,
                round,
                driver,
                result,
            } => {
                let _flight = self.validated(session, config)?;
                let progress = self.transaction()?.handle_driver_result(
                    commit_phase(round),
                    driver,
                    driver_outcome(result),
                )?;
                Ok(TcReply::Round(round_state(progress)))
            }
            TcCall::CommitTransactionEnd {
                session,
                config,
                committed,
            } => {
                let _flight = self.validated(session, config)?;
                let summary = self.transaction()?.end_transaction(committed)?;
                Ok(TcReply::Committed {
                    applied: summary.applied,
                    notified: summary.notified,
                })
            }
            TcCall::AbortTransaction {
                session,
                config,
                marker,
            } => {
                let _flight = self.validated(session, config)?;
                self.transaction()?.abort_transaction(abort_phase(marker))?;
                Ok(TcReply::Ack)
            }
            TcCall::AbortCandidate { session, config } => {
                let _flight = self.validated(session, config)?;
                self.require_idle_cycle()?;
                let notified = self.dbconfig.abort_candidate_db(session)?;
                Ok(TcReply::CandidateAborted { notified })
            }
            TcCall::SaveConfiguration { session, config } => {
                let _flight = self.validated(session, config)?;
                self.dbconfig.save_running_to_startup(session)?;
                Ok(TcReply::Ack)
            }
            TcCall::ClearStartup { session, config } => {
                let _flight = self.validated(session, config)?;
                self.dbconfig.clear_startup(session)?;
                Ok(TcReply::Ack)
            }
            _ => Err(TopoError::InvalidRequest(format!(
                "{} is not a commit callback",
                call.name()
            ))),
        }
    }

    fn require_idle_cycle(&self) -> TopoResult<()> {
        if self.transaction()?.phase() != TransactionPhase::End {
            return Err(TopoError::OperationNotAllowed("commit cycle in progress"));
        }
        Ok(())
    }

    fn audit_call(&self, call: TcCall) -> TopoResult<TcReply> {
        match call {
            TcCall::AuditStart {
                controller,
                driver,
                kind,
            } => {
                if self.import.is_importing(&controller)? {
                    return Err(TopoError::OperationNotAllowed("controller import in progress"));
                }
                self.audit.start_audit(&controller, driver, audit_kind(kind))?;
                Ok(TcReply::Ack)
            }
            TcCall::AuditTransactionStart { controller, .. } => {
                self.audit.start_audit_transaction(&controller)?;
                Ok(TcReply::Ack)
            }
            TcCall::AuditVoteRequest { controller, .. } => Ok(TcReply::Instructions(
                self.audit.handle_vote_request(&controller)?,
            )),
            TcCall::AuditGlobalCommit { controller, .. } => Ok(TcReply::Instructions(
                self.audit.handle_global_commit_request(&controller)?,
            )),
            TcCall::AuditDriverResult {
                controller,
                driver,
                round,
                result,
            } => {
                let progress = self.audit.handle_driver_result(
                    &controller,
                    commit_phase(round),
                    driver,
                    driver_outcome(result),
                )?;
                Ok(TcReply::Round(round_state(progress)))
            }
            TcCall::AuditTransactionEnd { controller, .. } => {
                let stats = self.audit.end_audit_transaction(&controller)?;
                Ok(TcReply::AuditMerged {
                    created: stats.created,
                    updated: stats.updated,
                    deleted: stats.deleted,
                })
            }
            TcCall::AuditEnd {
                controller,
                succeeded,
                commit_version,
                ..
            } => {
                let summary = self.audit.end_audit(&controller, succeeded, commit_version)?;
                Ok(TcReply::AuditClosed {
                    succeeded: summary.succeeded,
                    status: summary.status,
                })
            }
            TcCall::AuditCancel { controller, .. } => {
                match self.audit.cancel_audit(&controller)? {
                    Some(summary) => Ok(TcReply::AuditClosed {
                        succeeded: summary.succeeded,
                        status: summary.status,
                    }),
                    None => Ok(TcReply::Ack),
                }
            }
            _ => Err(TopoError::InvalidRequest(format!(
                "{} is not an audit callback",
                call.name()
            ))),
        }
    }

    /// Applies one southbound operational-status event.
    ///
    /// # Errors
    ///
    /// Returns the audit layer's error for the event.
    pub fn report_oper_status(&self, key: &TopoKey, status: OperStatus) -> TopoResult<usize> {
        self.admitted(|| self.audit.report_oper_status(key, status))
    }

    /// Stores rows a driver reports for an audited controller.
    ///
    /// # Errors
    ///
    /// Returns the audit layer's error for the upload.
    pub fn upload_audit_rows(&self, controller: &str, rows: Vec<Row>) -> TopoResult<usize> {
        self.admitted(|| self.audit.upload_import(controller, rows))
    }

    /// Loads STARTUP as the committed configuration at boot.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::OperationNotAllowed` when a configuration request is in flight, and the
    /// failing step's datastore error.
    pub fn load_startup(&self) -> TopoResult<()> {
        self.admitted(|| {
            let _flight = self.enter_single_flight()?;
            self.require_idle_cycle()?;
            self.dbconfig.load_and_commit_startup()
        })
    }

    /// Reports the current coordinator state.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when a coordinator mutex is poisoned.
    pub fn status(&self) -> TopoResult<StatusReport> {
        let (phase, last_commit_degraded) = {
            let transaction = self.transaction()?;
            (transaction.phase(), transaction.last_commit_degraded())
        };
        let shutting_down = *self
            .shutdown
            .read()
            .map_err(|_| TopoError::InvalidState("shutdown barrier is poisoned"))?;
        Ok(StatusReport {
            role: self.role,
            phase,
            config_in_flight: self.config_in_flight.load(Ordering::Acquire),
            last_commit_degraded,
            active_audits: self.audit.active_audits()?,
            read_connections_in_use: self.pool.in_use_count(ConnectionPurpose::ReadOnly)?,
            read_connection_limit: self.pool.read_limit().get(),
            shutting_down,
        })
    }

    /// Closes the coordinator: waits for in-flight work, then rejects everything.
    ///
    /// Open audits are cancelled so their controllers do not stay `AUDITING`. Calling it twice is
    /// harmless.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the shutdown barrier is poisoned.
    pub fn finalize(&self) -> TopoResult<()> {
        let mut closed = self
            .shutdown
            .write()
            .map_err(|_| TopoError::InvalidState("shutdown barrier is poisoned"))?;
        if *closed {
            return Ok(());
        }
        *closed = true;
        for controller in self.audit.active_audits()? {
            if let Err(error) = self.audit.cancel_audit(&controller) {
                warn!(controller = %controller, %error, "audit not cancelled at shutdown");
            }
        }
        info!("coordinator finalized");
        Ok(())
    }
}

fn read_kind(operation: Operation) -> TopoResult<ReadKind> {
    Ok(match operation {
        Operation::Read => ReadKind::Read,
        Operation::ReadNext => ReadKind::ReadNext,
        Operation::ReadBulk => ReadKind::ReadBulk,
        Operation::ReadSiblingBegin => ReadKind::ReadSiblingBegin,
        Operation::ReadSibling => ReadKind::ReadSibling,
        Operation::ReadSiblingCount => ReadKind::ReadSiblingCount,
        other => {
            return Err(TopoError::InvalidRequest(format!("{other} is not a read operation")));
        }
    })
}

const fn commit_phase(round: TcRound) -> CommitPhase {
    match round {
        TcRound::Vote => CommitPhase::Vote,
        TcRound::GlobalCommit => CommitPhase::GlobalCommit,
    }
}

const fn driver_outcome(result: TcDriverResult) -> DriverOutcome {
    match result {
        TcDriverResult::Success => DriverOutcome::Success,
        TcDriverResult::Failure => DriverOutcome::Failure,
        TcDriverResult::Timeout => DriverOutcome::Timeout,
    }
}

const fn abort_phase(marker: TcAbortMarker) -> AbortPhase {
    match marker {
        TcAbortMarker::Start => AbortPhase::Start,
        TcAbortMarker::Vote => AbortPhase::Vote,
        TcAbortMarker::GlobalCommit => AbortPhase::GlobalCommit,
    }
}

const fn audit_kind(kind: TcAuditKind) -> AuditKind {
    match kind {
        TcAuditKind::Normal => AuditKind::Normal,
        TcAuditKind::RealNetwork => AuditKind::RealNetwork,
    }
}

const fn round_state(progress: RoundProgress) -> TcRoundState {
    match progress {
        RoundProgress::Waiting => TcRoundState::Waiting,
        RoundProgress::Succeeded => TcRoundState::Succeeded,
        RoundProgress::Aborted => TcRoundState::Aborted,
    }
}

/// Builds a request header for in-process callers such as the console.
#[must_use]
pub fn header(
    session_id: SessionId,
    config_id: ConfigId,
    operation: Operation,
    key_type: KeyType,
    datastore_version: DatastoreVersion,
) -> RequestHeader {
    RequestHeader {
        session_id,
        config_id,
        operation,
        max_repeat_count: 0,
        option1: 0,
        option2: 0,
        datastore_version,
        key_type,
    }
}
