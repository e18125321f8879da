//! Northbound notification and operator alarm delivery.

pub mod alarm;
pub mod journal;

use std::sync::Arc;

use alarm::AlarmBoard;
use journal::NotificationJournal;
use topo_core::notify::{AlarmSink, NorthboundSink};

/// Event delivery bootstrap module.
///
/// Holds the concrete sinks and hands out trait-object views of them to the coordination core.
#[derive(Debug, Clone, Default)]
pub struct EventsModule {
    /// Northbound notification journal.
    pub journal: Arc<NotificationJournal>,
    /// Operator alarm board.
    pub alarms: Arc<AlarmBoard>,
}

impl EventsModule {
    /// Creates the events module with empty sinks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Northbound sink view of the journal.
    #[must_use]
    pub fn northbound(&self) -> Arc<dyn NorthboundSink> {
        self.journal.clone()
    }

    /// Alarm sink view of the board.
    #[must_use]
    pub fn alarm_sink(&self) -> Arc<dyn AlarmSink> {
        self.alarms.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::EventsModule;
    use googletest::prelude::*;
    use rstest::rstest;
    use topo_core::notify::{Alarm, AlarmKind};

    #[rstest]
    fn sink_views_share_the_module_state() {
        let events = EventsModule::new();
        events
            .alarm_sink()
            .publish(Alarm::raise(AlarmKind::DatastoreFailure, None, "lost"));
        assert_that!(&events.alarms.active_count(), eq(&Ok(1_usize)));
    }
}
