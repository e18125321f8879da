//! Once-per-process escalation of connection-level datastore failures.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use topo_common::error::TopoError;
use tracing::{error, warn};

/// Latch that reports the first connection-level failure as fatal and later ones quietly.
#[derive(Debug, Default)]
pub struct FatalOnce {
    tripped: AtomicBool,
    repeats: AtomicU64,
}

impl FatalOnce {
    /// Creates an untripped latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one failure seen while running `context`.
    ///
    /// Returns `true` only for the first connection-level failure of the process lifetime.
    /// Errors that are not connection-level pass through without touching the latch.
    pub fn report(&self, context: &str, failure: &TopoError) -> bool {
        if !failure.is_fatal_db() {
            return false;
        }
        if self
            .tripped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            error!(context, error = %failure, "fatal datastore failure");
            return true;
        }
        let repeats = self.repeats.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(context, error = %failure, repeats, "repeated datastore failure");
        false
    }

    /// Returns whether a fatal failure was already reported.
    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Number of failures reported after the first one.
    #[must_use]
    pub fn repeat_count(&self) -> u64 {
        self.repeats.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::FatalOnce;
    use googletest::prelude::*;
    use rstest::rstest;
    use topo_common::error::TopoError;

    #[rstest]
    fn only_first_connection_failure_is_fatal() {
        let latch = FatalOnce::new();
        let failure = TopoError::DbAccess("connection reset".to_owned());

        assert_that!(latch.report("commit", &failure), eq(true));
        assert_that!(latch.report("commit", &failure), eq(false));
        assert_that!(latch.report("audit", &failure), eq(false));
        assert_that!(latch.is_tripped(), eq(true));
        assert_that!(latch.repeat_count(), eq(2_u64));
    }

    #[rstest]
    fn query_failures_never_trip_the_latch() {
        let latch = FatalOnce::new();
        assert_that!(
            latch.report("read", &TopoError::DbQuery("row missing".to_owned())),
            eq(false)
        );
        assert_that!(latch.is_tripped(), eq(false));
    }
}
