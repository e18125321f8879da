//! Runtime configuration shared by module bootstrap code.

use std::time::Duration;

use crate::error::{TopoError, TopoResult};
use crate::ids::ConnectionLimit;

/// Process role inside an active/standby controller pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Serves configuration, audit, import, and read traffic.
    Active,
    /// Degraded role: only read operations are admitted.
    Standby,
}

/// Bootstrap configuration used by `topo-server` during process startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Upper bound of concurrently checked-out read-only connections.
    pub max_read_connections: ConnectionLimit,
    /// How long a checkout may wait at the connection ceiling before it is rejected.
    ///
    /// `Duration::ZERO` rejects immediately.
    pub checkout_wait: Duration,
    /// Active/standby role at startup.
    pub role: NodeRole,
    /// Number of request worker threads.
    pub worker_threads: u16,
    /// Delay of the per-controller notification timer started after an audit ends.
    pub notification_delay: Duration,
    /// Application label stamped on commit version records.
    pub commit_application: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_read_connections: ConnectionLimit::new(8)
                .expect("literal connection limit must be non-zero"),
            checkout_wait: Duration::from_millis(200),
            role: NodeRole::Active,
            worker_threads: 4,
            notification_delay: Duration::from_secs(5),
            commit_application: "physical".to_owned(),
        }
    }
}

impl RuntimeConfig {
    /// Checks cross-field constraints that the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidConfig` when the worker pool would be empty or the commit
    /// application label is blank.
    pub fn validate(&self) -> TopoResult<()> {
        if self.worker_threads == 0 {
            return Err(TopoError::InvalidConfig("worker_threads must be non-zero"));
        }
        if self.commit_application.trim().is_empty() {
            return Err(TopoError::InvalidConfig("commit_application must not be blank"));
        }
        Ok(())
    }

    /// Returns whether only read operations may be admitted.
    #[must_use]
    pub fn is_standby(&self) -> bool {
        self.role == NodeRole::Standby
    }
}
