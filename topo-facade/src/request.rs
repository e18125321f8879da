//! Typed request and response bodies, and TC callback calls.

use std::collections::BTreeMap;

use topo_common::ids::{ConfigId, SessionId};
use topo_core::key::TopoKey;
use topo_core::record::CommitVersionRecord;
use topo_core::value::{DriverType, OperStatus, Row, TopoValue};

use crate::protocol::{RequestHeader, ResponseHeader, ResultCode};

/// Payload following a request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// Keyed configuration or read; `value` is present for CREATE and UPDATE.
    Keyed {
        key: TopoKey,
        value: Option<TopoValue>,
    },
    /// Controller-scoped import operation.
    Controller { controller: String, rows: Vec<Row> },
    /// No payload.
    Empty,
}

/// One northbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub header: RequestHeader,
    pub body: RequestBody,
}

/// Payload following a response header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResponseBody {
    #[default]
    Empty,
    /// Rows in key order.
    Rows(Vec<Row>),
    /// Counter such as a sibling count or a merged-row count.
    Count(usize),
    /// Answer of IS_CANDIDATE_DIRTY.
    Dirty(bool),
}

/// One northbound response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: ResponseHeader,
    pub body: ResponseBody,
}

impl Response {
    /// Error response answering `request`.
    #[must_use]
    pub fn rejected(request: &RequestHeader, code: ResultCode) -> Self {
        Self {
            header: ResponseHeader::answering(request, code),
            body: ResponseBody::Empty,
        }
    }

    #[must_use]
    pub const fn result_code(&self) -> ResultCode {
        self.header.result_code
    }
}

/// Round named by a TC driver-result callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcRound {
    Vote,
    GlobalCommit,
}

/// Driver result reported by the TC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcDriverResult {
    Success,
    Failure,
    Timeout,
}

/// Abort marker carried by a TC abort callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcAbortMarker {
    Start,
    Vote,
    GlobalCommit,
}

/// Audit flavour requested by the TC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcAuditKind {
    Normal,
    RealNetwork,
}

/// Callback invoked by the external transaction coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcCall {
    CommitTransactionStart {
        session: SessionId,
        config: ConfigId,
    },
    CommitVoteRequest {
        session: SessionId,
        config: ConfigId,
    },
    CommitGlobalCommit {
        session: SessionId,
        config: ConfigId,
    },
    CommitDriverResult {
        session: SessionId,
        config: ConfigId,
        round: TcRound,
        driver: DriverType,
        result: TcDriverResult,
    },
    CommitTransactionEnd {
        session: SessionId,
        config: ConfigId,
        committed: bool,
    },
    AbortTransaction {
        session: SessionId,
        config: ConfigId,
        marker: TcAbortMarker,
    },
    AbortCandidate {
        session: SessionId,
        config: ConfigId,
    },
    SaveConfiguration {
        session: SessionId,
        config: ConfigId,
    },
    ClearStartup {
        session: SessionId,
        config: ConfigId,
    },
    AuditStart {
        controller: String,
        driver: DriverType,
        kind: TcAuditKind,
    },
    AuditTransactionStart {
        controller: String,
        driver: DriverType,
    },
    AuditVoteRequest {
        controller: String,
        driver: DriverType,
    },
    AuditGlobalCommit {
        controller: String,
        driver: DriverType,
    },
    AuditDriverResult {
        controller: String,
        driver: DriverType,
        round: TcRound,
        result: TcDriverResult,
    },
    AuditTransactionEnd {
        controller: String,
        driver: DriverType,
    },
    AuditEnd {
        controller: String,
        driver: DriverType,
        succeeded: bool,
        commit_version: Option<CommitVersionRecord>,
    },
    AuditCancel {
        controller: String,
        driver: DriverType,
    },
}

impl TcCall {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CommitTransactionStart { .. } => "CommitTransactionStart",
            Self::CommitVoteRequest { .. } => "CommitVoteRequest",
            Self::CommitGlobalCommit { .. } => "CommitGlobalCommit",
            Self::CommitDriverResult { .. } => "CommitDriverResult",
            Self::CommitTransactionEnd { .. } => "CommitTransactionEnd",
            Self::AbortTransaction { .. } => "AbortTransaction",
            Self::AbortCandidate { .. } => "AbortCandidate",
            Self::SaveConfiguration { .. } => "SaveConfiguration",
            Self::ClearStartup { .. } => "ClearStartup",
            Self::AuditStart { .. } => "AuditStart",
            Self::AuditTransactionStart { .. } => "AuditTransactionStart",
            Self::AuditVoteRequest { .. } => "AuditVoteRequest",
            Self::AuditGlobalCommit { .. } => "AuditGlobalCommit",
            Self::AuditDriverResult { .. } => "AuditDriverResult",
            Self::AuditTransactionEnd { .. } => "AuditTransactionEnd",
            Self::AuditEnd { .. } => "AuditEnd",
            Self::AuditCancel { .. } => "AuditCancel",
        }
    }

    /// Returns whether the call belongs to a commit cycle rather than an audit.
    #[must_use]
    pub const fn is_commit_scoped(&self) -> bool {
        matches!(
            self,
            Self::CommitTransactionStart { .. }
                | Self::CommitVoteRequest { .. }
                | Self::CommitGlobalCommit { .. }
                | Self::CommitDriverResult { .. }
                | Self::CommitTransactionEnd { .. }
                | Self::AbortTransaction { .. }
                | Self::AbortCandidate { .. }
                | Self::SaveConfiguration { .. }
                | Self::ClearStartup { .. }
        )
    }
}

/// Round state after a driver result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcRoundState {
    Waiting,
    Succeeded,
    Aborted,
}

/// Payload of a successful TC callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcReply {
    Ack,
    /// Drivers taking part in the commit cycle.
    Participants(Vec<DriverType>),
    /// Controllers each driver has to act on.
    Instructions(BTreeMap<DriverType, Vec<String>>),
    Round(TcRoundState),
    Committed { applied: usize, notified: usize },
    CandidateAborted { notified: usize },
    AuditMerged { created: usize, updated: usize, deleted: usize },
    AuditClosed { succeeded: bool, status: OperStatus },
}

/// Answer to one TC callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcResponse {
    pub result: ResultCode,
    pub reply: TcReply,
}

impl TcResponse {
    #[must_use]
    pub const fn ok(reply: TcReply) -> Self {
        Self {
            result: ResultCode::Success,
            reply,
        }
    }

    #[must_use]
    pub const fn failed(result: ResultCode) -> Self {
        Self {
            result,
            reply: TcReply::Ack,
        }
    }
}
