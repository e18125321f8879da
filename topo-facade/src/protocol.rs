//! Control-channel headers, operation codes, and result codes.

use std::fmt;

use topo_common::error::TopoError;
use topo_common::ids::{ConfigId, SessionId};
use topo_core::key::KeyType;
use topo_core::version::DatastoreVersion;

/// Service a request is carried on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceId {
    /// Configuration CRUD.
    Configuration,
    /// Read family.
    Read,
    /// Out-of-band datastore and import operations.
    OutOfBand,
}

/// Operation code of one northbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Read,
    ReadNext,
    ReadBulk,
    ReadSiblingBegin,
    ReadSibling,
    ReadSiblingCount,
    IsCandidateDirty,
    ImportControllerConfig,
    MergeControllerConfig,
    ClearImportConfig,
}

impl Operation {
    /// Every operation, in wire-code order.
    pub const ALL: [Self; 13] = [
        Self::Create,
        Self::Update,
        Self::Delete,
        Self::Read,
        Self::ReadNext,
        Self::ReadBulk,
        Self::ReadSiblingBegin,
        Self::ReadSibling,
        Self::ReadSiblingCount,
        Self::IsCandidateDirty,
        Self::ImportControllerConfig,
        Self::MergeControllerConfig,
        Self::ClearImportConfig,
    ];

    /// Numeric wire code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Create => 1,
            Self::Update => 2,
            Self::Delete => 3,
            Self::Read => 4,
            Self::ReadNext => 5,
            Self::ReadBulk => 6,
            Self::ReadSiblingBegin => 7,
            Self::ReadSibling => 8,
            Self::ReadSiblingCount => 9,
            Self::IsCandidateDirty => 101,
            Self::ImportControllerConfig => 102,
            Self::MergeControllerConfig => 103,
            Self::ClearImportConfig => 104,
        }
    }

    /// Decodes a numeric wire code.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|operation| operation.code() == code)
    }

    /// Service the operation belongs to.
    #[must_use]
    pub const fn service(self) -> ServiceId {
        match self {
            Self::Create | Self::Update | Self::Delete => ServiceId::Configuration,
            Self::Read
            | Self::ReadNext
            | Self::ReadBulk
            | Self::ReadSiblingBegin
            | Self::ReadSibling
            | Self::ReadSiblingCount => ServiceId::Read,
            Self::IsCandidateDirty
            | Self::ImportControllerConfig
            | Self::MergeControllerConfig
            | Self::ClearImportConfig => ServiceId::OutOfBand,
        }
    }

    /// Uppercase label used in logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Read => "READ",
            Self::ReadNext => "READ_NEXT",
            Self::ReadBulk => "READ_BULK",
            Self::ReadSiblingBegin => "READ_SIBLING_BEGIN",
            Self::ReadSibling => "READ_SIBLING",
            Self::ReadSiblingCount => "READ_SIBLING_COUNT",
            Self::IsCandidateDirty => "IS_CANDIDATE_DIRTY",
            Self::ImportControllerConfig => "IMPORT_CONTROLLER_CONFIG",
            Self::MergeControllerConfig => "MERGE_CONTROLLER_CONFIG",
            Self::ClearImportConfig => "CLEAR_IMPORT_CONFIG",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Northbound request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub session_id: SessionId,
    pub config_id: ConfigId,
    pub operation: Operation,
    pub max_repeat_count: u32,
    pub option1: u32,
    pub option2: u32,
    pub datastore_version: DatastoreVersion,
    pub key_type: KeyType,
}

/// Northbound response header; mirrors the request with a result code in place of the key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub session_id: SessionId,
    pub config_id: ConfigId,
    pub operation: Operation,
    pub max_repeat_count: u32,
    pub option1: u32,
    pub option2: u32,
    pub datastore_version: DatastoreVersion,
    pub result_code: ResultCode,
}

impl ResponseHeader {
    /// Builds the response header answering `request`.
    #[must_use]
    pub const fn answering(request: &RequestHeader, result_code: ResultCode) -> Self {
        Self {
            session_id: request.session_id,
            config_id: request.config_id,
            operation: request.operation,
            max_repeat_count: request.max_repeat_count,
            option1: request.option1,
            option2: request.option2,
            datastore_version: request.datastore_version,
            result_code,
        }
    }
}

/// Southbound request header, scoped to one controller/domain pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverRequestHeader {
    pub controller_id: String,
    pub domain_id: String,
    pub common: RequestHeader,
}

/// Southbound response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverResponseHeader {
    pub controller_id: String,
    pub domain_id: String,
    pub common: ResponseHeader,
}

impl DriverResponseHeader {
    /// Builds the driver response answering `request`.
    #[must_use]
    pub fn answering(request: &DriverRequestHeader, result_code: ResultCode) -> Self {
        Self {
            controller_id: request.controller_id.clone(),
            domain_id: request.domain_id.clone(),
            common: ResponseHeader::answering(&request.common, result_code),
        }
    }
}

/// Result categories returned to northbound clients and the TC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    InvalidConfigId,
    InvalidSessionId,
    CandidateIsDirty,
    OperationNotAllowed,
    DbAccess,
    NoSuchInstance,
    DriverCommunicationFailure,
    LogicalCommunicationFailure,
    InvalidState,
    BadRequest,
    InternalError,
}

impl ResultCode {
    /// Numeric wire code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::InvalidConfigId => 1,
            Self::InvalidSessionId => 2,
            Self::CandidateIsDirty => 3,
            Self::OperationNotAllowed => 4,
            Self::DbAccess => 5,
            Self::NoSuchInstance => 6,
            Self::DriverCommunicationFailure => 7,
            Self::LogicalCommunicationFailure => 8,
            Self::InvalidState => 9,
            Self::BadRequest => 10,
            Self::InternalError => 99,
        }
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<&TopoError> for ResultCode {
    fn from(error: &TopoError) -> Self {
        match error {
            TopoError::InvalidConfigId(_) => Self::InvalidConfigId,
            TopoError::InvalidSessionId(_) => Self::InvalidSessionId,
            TopoError::CandidateIsDirty => Self::CandidateIsDirty,
            TopoError::OperationNotAllowed(_) => Self::OperationNotAllowed,
            TopoError::DbAccess(_) => Self::DbAccess,
            TopoError::DbQuery(_) => Self::NoSuchInstance,
            TopoError::DriverCommunication(_) => Self::DriverCommunicationFailure,
            TopoError::LogicalCommunication(_) => Self::LogicalCommunicationFailure,
            TopoError::InvalidState(_) => Self::InvalidState,
            TopoError::InvalidRequest(_) => Self::BadRequest,
            TopoError::InvalidConfig(_) | TopoError::Io(_) => Self::InternalError,
        }
    }
}

impl<T> From<&Result<T, TopoError>> for ResultCode {
    fn from(result: &Result<T, TopoError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(error) => Self::from(error),
        }
    }
}
