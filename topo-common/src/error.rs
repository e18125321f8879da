//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in the coordinator.
pub type TopoResult<T> = Result<T, TopoError>;

/// Error categories surfaced by the coordination core.
///
/// Admission errors (`InvalidConfigId`, `InvalidSessionId`, `OperationNotAllowed`,
/// `InvalidRequest`) are raised before any state is touched. `DbAccess` is reserved for
/// connection-level datastore failures and is treated as fatal by callers; query-level
/// problems use `DbQuery` and stay local to the failing request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopoError {
    /// Config id presented by the caller is not the one the TC handed out.
    #[error("invalid config id {0}")]
    InvalidConfigId(u32),

    /// Session id presented by the caller is unknown to the TC.
    #[error("invalid session id {0}")]
    InvalidSessionId(u32),

    /// Candidate datastore still carries uncommitted or uncleared changes.
    #[error("candidate datastore is dirty")]
    CandidateIsDirty,

    /// Request is well-formed but not admitted right now.
    #[error("operation not allowed: {0}")]
    OperationNotAllowed(&'static str),

    /// Connection-level datastore failure.
    #[error("datastore access failure: {0}")]
    DbAccess(String),

    /// Query-level datastore failure (missing row, duplicate row, bad reference).
    #[error("datastore query failure: {0}")]
    DbQuery(String),

    /// Southbound driver did not answer or answered with a failure.
    #[error("driver communication failure: {0}")]
    DriverCommunication(String),

    /// Northbound notification path failed.
    #[error("logical layer communication failure: {0}")]
    LogicalCommunication(String),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Request payload is malformed or semantically invalid.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Filesystem or terminal I/O failed.
    #[error("io error: {0}")]
    Io(String),
}

impl TopoError {
    /// Returns whether this error is a connection-level datastore failure.
    #[must_use]
    pub const fn is_fatal_db(&self) -> bool {
        matches!(self, Self::DbAccess(_))
    }
}
