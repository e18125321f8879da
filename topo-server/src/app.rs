//! Process composition root for `topo-coordinator`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use topo_common::config::RuntimeConfig;
use topo_common::error::{TopoError, TopoResult};
use topo_core::CoreModule;
use topo_core::key::TopoKey;
use topo_core::value::{OperStatus, Row};
use topo_events::EventsModule;
use topo_facade::FacadeModule;
use topo_facade::request::{Request, Response, TcCall, TcResponse};
use topo_storage::StorageModule;
use topo_transaction::TransactionModule;
use tracing::info;

use crate::console;
use crate::itc::{InternalTransactionCoordinator, StatusReport};
use crate::worker::{RequestWorkerPool, WorkItem, WorkReply};

/// Upper bound a caller waits for its worker to answer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Composition container owning every subsystem of one coordinator process.
#[derive(Debug)]
pub struct CoordinatorApp {
    /// Runtime configuration.
    pub config: RuntimeConfig,
    /// Key-type capability registry.
    pub core: CoreModule,
    /// Datastore, connection pool, fatal latch.
    pub storage: StorageModule,
    /// Northbound journal and alarm board.
    pub events: EventsModule,
    /// TC session table.
    pub facade: FacadeModule,
    /// Request router shared with the worker threads.
    pub itc: Arc<InternalTransactionCoordinator>,
    workers: RequestWorkerPool,
}

impl CoordinatorApp {
    /// Wires every subsystem from runtime config.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidConfig` for invalid config and `TopoError::Io` when a worker
    /// thread cannot be spawned.
    pub fn new(config: RuntimeConfig) -> TopoResult<Self> {
        config.validate()?;
        let core = CoreModule::new();
        let storage = StorageModule::new(&config);
        let events = EventsModule::new();
        let facade = FacadeModule::new();
        let transaction = TransactionModule::new(
            &config,
            &storage,
            Arc::new(core.registry.clone()),
            events.northbound(),
            events.alarm_sink(),
        );
        let itc = Arc::new(InternalTransactionCoordinator::new(
            &config,
            transaction,
            facade.authority(),
        ));
        let workers = RequestWorkerPool::for_coordinator(config.worker_threads, Arc::clone(&itc))?;
        Ok(Self {
            config,
            core,
            storage,
            events,
            facade,
            itc,
            workers,
        })
    }

    /// Loads STARTUP into CANDIDATE and RUNNING. A standby node skips the load.
    ///
    /// # Errors
    ///
    /// Returns the failing step's datastore error.
    pub fn boot(&self) -> TopoResult<()> {
        if self.config.is_standby() {
            info!("standby role, startup load skipped");
            return Ok(());
        }
        self.itc.load_startup()
    }

    /// Returns one-line startup summary for operator visibility.
    #[must_use]
    pub fn startup_summary(&self) -> String {
        format!(
            "topo-coordinator bootstrap: role={:?}, workers={}, max_read_connections={}, \
checkout_wait_ms={}, notification_delay_ms={}, key_types={}, commit_application={}",
            self.config.role,
            self.workers.len(),
            self.config.max_read_connections.get(),
            self.config.checkout_wait.as_millis(),
            self.config.notification_delay.as_millis(),
            self.core.registry.len(),
            self.config.commit_application
        )
    }

    /// Runs one northbound request on a worker thread.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the worker pool is closed or does not answer in
    /// time. Request failures are carried in the response header instead.
    pub fn request(&self, request: Request) -> TopoResult<Response> {
        match self.workers.execute(WorkItem::Request(request), REPLY_TIMEOUT)? {
            WorkReply::Response(response) => Ok(response),
            WorkReply::Tc(_) => Err(TopoError::InvalidState("worker answered with a tc reply")),
        }
    }

    /// Runs one TC callback on a worker thread.
    ///
    /// # Errors
    ///
    /// Same as [`CoordinatorApp::request`].
    pub fn tc(&self, call: TcCall) -> TopoResult<TcResponse> {
        match self.workers.execute(WorkItem::Tc(call), REPLY_TIMEOUT)? {
            WorkReply::Tc(response) => Ok(response),
            WorkReply::Response(_) => {
                Err(TopoError::InvalidState("worker answered with a request reply"))
            }
        }
    }

    /// Feeds one southbound operational-status event.
    ///
    /// # Errors
    ///
    /// Returns the coordinator's error for the event.
    pub fn report_oper_status(&self, key: &TopoKey, status: OperStatus) -> TopoResult<usize> {
        self.itc.report_oper_status(key, status)
    }

    /// Feeds rows a driver reports during an audit.
    ///
    /// # Errors
    ///
    /// Returns the coordinator's error for the upload.
    pub fn upload_audit_rows(&self, controller: &str, rows: Vec<Row>) -> TopoResult<usize> {
        self.itc.upload_audit_rows(controller, rows)
    }

    /// Current coordinator state.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when a coordinator mutex is poisoned.
    pub fn status(&self) -> TopoResult<StatusReport> {
        self.itc.status()
    }

    /// Stops admitting work once in-flight requests drain.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the shutdown barrier is poisoned.
    pub fn shutdown(&self) -> TopoResult<()> {
        self.itc.finalize()
    }
}

/// Starts the coordinator and serves the operator console on stdin until `quit` or EOF.
///
/// # Errors
///
/// Returns an error when bootstrap, the startup load, or console I/O fails.
pub fn run() -> TopoResult<()> {
    let app = CoordinatorApp::new(RuntimeConfig::default())?;
    app.boot()?;
    println!("{}", app.startup_summary());
    let handled = console::run_console(&app, io::stdin().lock(), io::stdout().lock())?;
    info!(commands = handled, "console closed");
    app.shutdown()
}

#[cfg(test)]
mod app_tests;
