//! Operator alarm board.

use std::sync::Mutex;

use topo_common::error::{TopoError, TopoResult};
use topo_core::containers::HotMap as HashMap;
use topo_core::notify::{Alarm, AlarmKind, AlarmSink};
use tracing::{info, warn};

type AlarmSlot = (AlarmKind, Option<String>);

#[derive(Debug, Default)]
struct AlarmBoardInner {
    active: HashMap<AlarmSlot, String>,
    history: Vec<Alarm>,
}

/// Records raised and cleared alarms and tracks which ones are active.
///
/// Alarms are keyed by kind and controller scope: raising the same slot twice keeps one active
/// entry with the latest detail, clearing an inactive slot is recorded but changes nothing.
#[derive(Debug, Default)]
pub struct AlarmBoard {
    inner: Mutex<AlarmBoardInner>,
}

impl AlarmBoard {
    /// Creates an empty board.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether an alarm is active for the slot.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the board mutex is poisoned.
    pub fn is_active(&self, kind: AlarmKind, controller: Option<&str>) -> TopoResult<bool> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| TopoError::InvalidState("alarm board mutex is poisoned"))?;
        Ok(inner
            .active
            .contains_key(&(kind, controller.map(str::to_owned))))
    }

    /// Number of active alarms.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the board mutex is poisoned.
    pub fn active_count(&self) -> TopoResult<usize> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| TopoError::InvalidState("alarm board mutex is poisoned"))?
            .active
            .len())
    }

    /// Every raise and clear event in publish order.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the board mutex is poisoned.
    pub fn history(&self) -> TopoResult<Vec<Alarm>> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| TopoError::InvalidState("alarm board mutex is poisoned"))?
            .history
            .clone())
    }
}

impl AlarmSink for AlarmBoard {
    fn publish(&self, alarm: Alarm) {
        let Ok(mut inner) = self.inner.lock() else {
            warn!(kind = ?alarm.kind, "alarm board mutex is poisoned, alarm dropped");
            return;
        };
        let slot = (alarm.kind, alarm.controller.clone());
        if alarm.raise {
            warn!(kind = ?alarm.kind, controller = ?alarm.controller, detail = %alarm.detail, "alarm raised");
            let _ = inner.active.insert(slot, alarm.detail.clone());
        } else if inner.active.remove(&slot).is_some() {
            info!(kind = ?alarm.kind, controller = ?alarm.controller, "alarm cleared");
        }
        inner.history.push(alarm);
    }
}
