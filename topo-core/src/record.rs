//! Commit version records and staged operational-status changes.

use crate::key::TopoKey;
use crate::value::OperStatus;

/// Commit bookkeeping stored per controller when an audit ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitVersionRecord {
    /// Monotonic commit number reported by the controller.
    pub commit_number: u64,
    /// Commit time in unix seconds.
    pub commit_date: u64,
    /// Application that produced the commit.
    pub commit_application: String,
}

impl CommitVersionRecord {
    /// Returns whether this record describes a newer commit than `other`.
    ///
    /// Commit numbers decide first; equal numbers fall back to the commit date.
    #[must_use]
    pub fn is_fresher_than(&self, other: &Self) -> bool {
        (self.commit_number, self.commit_date) > (other.commit_number, other.commit_date)
    }
}

/// One staged operational-status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperStatusPending {
    /// Affected row.
    pub key: TopoKey,
    /// Status to apply.
    pub oper_status: OperStatus,
}

/// Ordered list of staged operational-status changes for one request.
///
/// Staging the same key twice replaces the earlier entry in place, so a later key-type merge can
/// correct a status derived by an earlier one without reordering the list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperStatusPendingList {
    entries: Vec<OperStatusPending>,
}

impl OperStatusPendingList {
    /// Stages one change, replacing any previous change of the same key.
    pub fn stage(&mut self, key: TopoKey, oper_status: OperStatus) {
        if let Some(existing) = self.entries.iter_mut().find(|entry| entry.key == key) {
            existing.oper_status = oper_status;
            return;
        }
        self.entries.push(OperStatusPending { key, oper_status });
    }

    /// Returns the staged status of one key.
    #[must_use]
    pub fn get(&self, key: &TopoKey) -> Option<OperStatus> {
        self.entries
            .iter()
            .find(|entry| &entry.key == key)
            .map(|entry| entry.oper_status)
    }

    /// Removes and returns all staged changes in staging order.
    pub fn take(&mut self) -> Vec<OperStatusPending> {
        std::mem::take(&mut self.entries)
    }

    /// Number of staged changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
