//! Northbound notification journal.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use topo_common::error::{TopoError, TopoResult};
use topo_core::notify::{NorthboundSink, Notification};
use tracing::{debug, warn};

/// One delivered notification with its delivery sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Monotonic delivery sequence, starting at 1.
    pub seq: u64,
    /// Delivered notification.
    pub notification: Notification,
}

/// In-memory northbound sink recording every delivered notification in order.
///
/// Deliveries can be made to fail on purpose with [`NotificationJournal::fail_next`], which
/// stands in for an unreachable logical layer.
#[derive(Debug, Default)]
pub struct NotificationJournal {
    entries: Mutex<Vec<JournalEntry>>,
    next_seq: AtomicU64,
    failures_armed: AtomicU32,
}

impl NotificationJournal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` deliveries fail with `TopoError::LogicalCommunication`.
    pub fn fail_next(&self, count: u32) {
        self.failures_armed.store(count, Ordering::Release);
    }

    /// Returns all delivered entries in delivery order.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the journal mutex is poisoned.
    pub fn entries(&self) -> TopoResult<Vec<JournalEntry>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| TopoError::InvalidState("notification journal mutex is poisoned"))?
            .clone())
    }

    /// Returns and clears delivered entries.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the journal mutex is poisoned.
    pub fn drain(&self) -> TopoResult<Vec<JournalEntry>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| TopoError::InvalidState("notification journal mutex is poisoned"))?;
        Ok(std::mem::take(&mut *entries))
    }

    /// Number of delivered notifications still buffered.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the journal mutex is poisoned.
    pub fn len(&self) -> TopoResult<usize> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| TopoError::InvalidState("notification journal mutex is poisoned"))?
            .len())
    }

    fn consume_failure(&self) -> bool {
        self.failures_armed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |armed| armed.checked_sub(1))
            .is_ok()
    }
}

impl NorthboundSink for NotificationJournal {
    fn notify(&self, notification: &Notification) -> TopoResult<()> {
        if self.consume_failure() {
            warn!(key = %notification.key(), "northbound delivery failed");
            return Err(TopoError::LogicalCommunication(format!(
                "logical layer unreachable for {}",
                notification.key()
            )));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(seq, key = %notification.key(), "northbound notification delivered");
        self.entries
            .lock()
            .map_err(|_| TopoError::InvalidState("notification journal mutex is poisoned"))?
            .push(JournalEntry {
                seq,
                notification: notification.clone(),
            });
        Ok(())
    }
}
