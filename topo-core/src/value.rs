//! Row values and row metadata.

use std::fmt;

use topo_common::error::{TopoError, TopoResult};

use crate::key::{KeyType, TopoKey};

/// Southbound driver flavour that owns a controller connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DriverType {
    /// Programmable flow controller driver.
    Pfc,
    /// Virtual network platform driver.
    Vnp,
    /// Policy controller driver.
    Polc,
    /// OpenDaylight controller driver.
    Odc,
}

impl DriverType {
    /// Lowercase label used in logs and responses.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pfc => "pfc",
            Self::Vnp => "vnp",
            Self::Polc => "polc",
            Self::Odc => "odc",
        }
    }
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Operational status of one topology entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperStatus {
    /// Entity is reachable and healthy.
    Up,
    /// Entity is known to be down.
    Down,
    /// Status cannot be derived.
    Unknown,
    /// Controller is being reconciled by an audit.
    Auditing,
}

/// Per-row configuration status inside the candidate container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RowStatus {
    /// Created since the last commit.
    Created,
    /// Updated since the last commit.
    Updated,
    /// Deleted since the last commit; kept until commit so the change can be notified.
    Deleted,
    /// Matches the committed configuration.
    Applied,
}

impl RowStatus {
    /// Returns whether the row carries a change that the next commit must apply.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        !matches!(self, Self::Applied)
    }
}

/// Controller attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerValue {
    /// Driver owning this controller.
    pub driver_type: DriverType,
    /// Management address.
    pub ip_address: String,
    /// Free-form description.
    pub description: String,
    /// Whether audit is enabled after reconnects.
    pub enable_audit: bool,
    /// Operational status.
    pub oper_status: OperStatus,
}

/// Domain attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainValue {
    /// Free-form description.
    pub description: String,
    /// Operational status.
    pub oper_status: OperStatus,
}

/// Logical port attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalPortValue {
    /// Free-form description.
    pub description: String,
    /// Operational status.
    pub oper_status: OperStatus,
}

/// Switch attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchValue {
    /// Free-form description.
    pub description: String,
    /// Hardware model.
    pub model: String,
    /// Management address.
    pub ip_address: String,
    /// Operational status.
    pub oper_status: OperStatus,
}

/// Physical port attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortValue {
    /// Port number on the switch.
    pub port_number: u32,
    /// Free-form description.
    pub description: String,
    /// Operational status.
    pub oper_status: OperStatus,
}

/// Neighbor attributes of one physical port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortNeighborValue {
    /// Neighbor controller.
    pub connected_controller: String,
    /// Neighbor switch.
    pub connected_switch_id: String,
    /// Neighbor port.
    pub connected_port_id: String,
}

/// Link attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkValue {
    /// Free-form description.
    pub description: String,
    /// Operational status.
    pub oper_status: OperStatus,
}

/// One side of a boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoundaryEnd {
    /// Controller of this side.
    pub controller: String,
    /// Domain of this side.
    pub domain: String,
    /// Logical port of this side, when already resolved.
    pub logical_port: Option<String>,
}

/// Boundary attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryValue {
    /// Free-form description.
    pub description: String,
    /// First side.
    pub end1: BoundaryEnd,
    /// Second side.
    pub end2: BoundaryEnd,
    /// Operational status.
    pub oper_status: OperStatus,
}

/// Owned row value, one variant per key type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopoValue {
    /// Controller value.
    Controller(ControllerValue),
    /// Domain value.
    Domain(DomainValue),
    /// Logical port value.
    LogicalPort(LogicalPortValue),
    /// Logical member ports carry no attributes.
    LogicalMemberPort,
    /// Switch value.
    Switch(SwitchValue),
    /// Physical port value.
    Port(PortValue),
    /// Port neighbor value.
    PortNeighbor(PortNeighborValue),
    /// Link value.
    Link(LinkValue),
    /// Boundary value.
    Boundary(BoundaryValue),
}

impl TopoValue {
    /// Key type this value belongs to.
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        match self {
            Self::Controller(_) => KeyType::Controller,
            Self::Domain(_) => KeyType::Domain,
            Self::LogicalPort(_) => KeyType::LogicalPort,
            Self::LogicalMemberPort => KeyType::LogicalMemberPort,
            Self::Switch(_) => KeyType::Switch,
            Self::Port(_) => KeyType::Port,
            Self::PortNeighbor(_) => KeyType::PortNeighbor,
            Self::Link(_) => KeyType::Link,
            Self::Boundary(_) => KeyType::Boundary,
        }
    }

    /// Operational status, when this key type carries one.
    #[must_use]
    pub const fn oper_status(&self) -> Option<OperStatus> {
        match self {
            Self::Controller(value) => Some(value.oper_status),
            Self::Domain(value) => Some(value.oper_status),
            Self::LogicalPort(value) => Some(value.oper_status),
            Self::Switch(value) => Some(value.oper_status),
            Self::Port(value) => Some(value.oper_status),
            Self::Link(value) => Some(value.oper_status),
            Self::Boundary(value) => Some(value.oper_status),
            Self::LogicalMemberPort | Self::PortNeighbor(_) => None,
        }
    }

    /// Overwrites the operational status.
    ///
    /// Returns `false` when this key type has no status attribute.
    pub fn set_oper_status(&mut self, status: OperStatus) -> bool {
        let slot = match self {
            Self::Controller(value) => &mut value.oper_status,
            Self::Domain(value) => &mut value.oper_status,
            Self::LogicalPort(value) => &mut value.oper_status,
            Self::Switch(value) => &mut value.oper_status,
            Self::Port(value) => &mut value.oper_status,
            Self::Link(value) => &mut value.oper_status,
            Self::Boundary(value) => &mut value.oper_status,
            Self::LogicalMemberPort | Self::PortNeighbor(_) => return false,
        };
        *slot = status;
        true
    }

    /// Driver type, for controller values.
    #[must_use]
    pub const fn driver_type(&self) -> Option<DriverType> {
        match self {
            Self::Controller(value) => Some(value.driver_type),
            _ => None,
        }
    }

    /// Returns whether two values differ in anything other than operational status.
    #[must_use]
    pub fn differs_in_config(&self, other: &Self) -> bool {
        let mut left = self.clone();
        let mut right = other.clone();
        let _ = left.set_oper_status(OperStatus::Unknown);
        let _ = right.set_oper_status(OperStatus::Unknown);
        left != right
    }
}

/// One stored row: key, value, and candidate row status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Row key.
    pub key: TopoKey,
    /// Row value.
    pub value: TopoValue,
    /// Row status relative to the last commit.
    pub status: RowStatus,
}

impl Row {
    /// Builds a row after checking that key and value belong to the same key type.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidRequest` when key and value types differ.
    pub fn new(key: TopoKey, value: TopoValue, status: RowStatus) -> TopoResult<Self> {
        if key.key_type() != value.key_type() {
            return Err(TopoError::InvalidRequest(format!(
                "value of type {} does not match key {key}",
                value.key_type()
            )));
        }
        Ok(Self { key, value, status })
    }

    /// Builds an applied row, the shape used by every non-candidate container.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidRequest` when key and value types differ.
    pub fn applied(key: TopoKey, value: TopoValue) -> TopoResult<Self> {
        Self::new(key, value, RowStatus::Applied)
    }
}
