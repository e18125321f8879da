//! Collaborators shared by every request handler of this crate.

use std::fmt;
use std::sync::Arc;

use topo_common::error::TopoResult;
use topo_common::ids::{OwnerTag, SessionId};
use topo_core::notify::{Alarm, AlarmKind, AlarmSink, NorthboundSink, Notification};
use topo_core::registry::KeyTypeRegistry;
use topo_storage::fatal::FatalOnce;
use topo_storage::pool::{ConnectionPool, ConnectionPurpose, PooledConnection};
use tracing::warn;

/// Session id used for work the process starts on its own (startup load, southbound audit).
pub const SYSTEM_SESSION: SessionId = 0;

/// Handles to the pool, registry, and event sinks.
#[derive(Clone)]
pub struct TxContext {
    /// Datastore connection pool.
    pub pool: ConnectionPool,
    /// Key-type capabilities.
    pub registry: Arc<KeyTypeRegistry>,
    /// Northbound notification channel.
    pub northbound: Arc<dyn NorthboundSink>,
    /// Operator alarm channel.
    pub alarms: Arc<dyn AlarmSink>,
    /// Fatal datastore failure latch.
    pub fatal: Arc<FatalOnce>,
}

impl fmt::Debug for TxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxContext")
            .field("pool", &self.pool)
            .field("registry", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl TxContext {
    /// Checks out a connection for `session` on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::DbAccess` when no connection is available; the failure is escalated
    /// through the fatal latch first.
    pub fn checkout(
        &self,
        purpose: ConnectionPurpose,
        session: SessionId,
    ) -> TopoResult<PooledConnection> {
        let owner = OwnerTag::for_current_thread(session);
        self.escalate("connection checkout", self.pool.checkout(purpose, owner))
    }

    /// Passes `result` through, escalating connection-level failures.
    ///
    /// The first connection-level failure of the process also raises a datastore alarm.
    ///
    /// # Errors
    ///
    /// Returns the error carried by `result` unchanged.
    pub fn escalate<T>(&self, context: &str, result: TopoResult<T>) -> TopoResult<T> {
        if let Err(error) = &result
            && self.fatal.report(context, error)
        {
            self.alarms.publish(Alarm::raise(
                AlarmKind::DatastoreFailure,
                None,
                format!("{context}: {error}"),
            ));
        }
        result
    }

    /// Delivers notifications in order, returning how many failed.
    ///
    /// Delivery failures are logged and raise a notification alarm; they never undo the
    /// datastore change being reported.
    pub fn deliver(&self, notifications: &[Notification]) -> usize {
        let mut failed = 0_usize;
        for notification in notifications {
            if let Err(error) = self.northbound.notify(notification) {
                failed += 1;
                warn!(key = %notification.key(), %error, "northbound notification dropped");
                self.alarms.publish(Alarm::raise(
                    AlarmKind::NotificationFailure,
                    notification.key().controller_name(),
                    error.to_string(),
                ));
            }
        }
        failed
    }
}
