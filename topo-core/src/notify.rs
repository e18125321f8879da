//! Notification and alarm types plus the collaborator interfaces the core calls out to.
//!
//! The core never formats or delivers events itself. It hands typed notifications to a
//! [`NorthboundSink`], operator alarms to an [`AlarmSink`], and asks a [`SessionAuthority`]
//! whether a caller's session/config pair is the one currently holding configuration mode.

use topo_common::error::TopoResult;
use topo_common::ids::{ConfigId, SessionId};

use crate::key::TopoKey;
use crate::value::TopoValue;

/// Northbound change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Row appeared.
    Create {
        /// Row key.
        key: TopoKey,
        /// New value.
        value: TopoValue,
    },
    /// Row changed.
    Update {
        /// Row key.
        key: TopoKey,
        /// Value before the change.
        old: TopoValue,
        /// Value after the change.
        new: TopoValue,
    },
    /// Row disappeared.
    Delete {
        /// Row key.
        key: TopoKey,
        /// Value before removal.
        old: TopoValue,
    },
}

impl Notification {
    /// Key the notification is about.
    #[must_use]
    pub fn key(&self) -> &TopoKey {
        match self {
            Self::Create { key, .. } | Self::Update { key, .. } | Self::Delete { key, .. } => key,
        }
    }
}

/// Operator alarm categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlarmKind {
    /// Controller audit failed.
    AuditFailure,
    /// Final candidate-to-running copy failed.
    CommitDegraded,
    /// A northbound notification could not be delivered.
    NotificationFailure,
    /// Connection-level datastore failure.
    DatastoreFailure,
}

/// One raise or clear event for an operator alarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    /// Alarm category.
    pub kind: AlarmKind,
    /// Controller scope, when the alarm is controller specific.
    pub controller: Option<String>,
    /// `true` raises the alarm, `false` clears it.
    pub raise: bool,
    /// Human-readable detail.
    pub detail: String,
}

impl Alarm {
    /// Builds a raise event.
    #[must_use]
    pub fn raise(kind: AlarmKind, controller: Option<&str>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            controller: controller.map(str::to_owned),
            raise: true,
            detail: detail.into(),
        }
    }

    /// Builds a clear event.
    #[must_use]
    pub fn clear(kind: AlarmKind, controller: Option<&str>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            controller: controller.map(str::to_owned),
            raise: false,
            detail: detail.into(),
        }
    }
}

/// Delivery channel towards the northbound logical layer.
pub trait NorthboundSink: Send + Sync {
    /// Delivers one notification.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::LogicalCommunication` when the logical layer cannot be reached.
    fn notify(&self, notification: &Notification) -> TopoResult<()>;
}

/// Operator-facing alarm channel.
pub trait AlarmSink: Send + Sync {
    /// Publishes one alarm raise or clear event.
    fn publish(&self, alarm: Alarm);
}

/// Session/config validation owned by the external transaction coordinator.
pub trait SessionAuthority: Send + Sync {
    /// Checks that the pair currently holds configuration mode.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidSessionId` or `TopoError::InvalidConfigId`.
    fn validate(&self, session_id: SessionId, config_id: ConfigId) -> TopoResult<()>;
}
