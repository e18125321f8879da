//! Configuration-mode session table.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use topo_common::error::{TopoError, TopoResult};
use topo_common::ids::{ConfigId, SessionId};
use topo_core::containers::HotMap as HashMap;
use topo_core::notify::SessionAuthority;
use tracing::{debug, info};

/// Sessions currently holding configuration mode, with the config id handed to each.
///
/// Stands in for the transaction coordinator's own bookkeeping: configuration requests present
/// the pair and are admitted only while it is registered here.
#[derive(Debug, Default)]
pub struct TcSessionTable {
    sessions: Mutex<HashMap<SessionId, ConfigId>>,
    next_config: AtomicU32,
}

impl TcSessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants configuration mode to `session` and returns its config id.
    ///
    /// Acquiring twice returns the id already held.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the table mutex is poisoned.
    pub fn acquire(&self, session: SessionId) -> TopoResult<ConfigId> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| TopoError::InvalidState("session table mutex is poisoned"))?;
        if let Some(config) = sessions.get(&session) {
            return Ok(*config);
        }
        let config = self.next_config.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = sessions.insert(session, config);
        info!(session, config, "configuration mode acquired");
        Ok(config)
    }

    /// Releases configuration mode; returns whether the session held it.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the table mutex is poisoned.
    pub fn release(&self, session: SessionId) -> TopoResult<bool> {
        let released = self
            .sessions
            .lock()
            .map_err(|_| TopoError::InvalidState("session table mutex is poisoned"))?
            .remove(&session)
            .is_some();
        debug!(session, released, "configuration mode released");
        Ok(released)
    }
}

impl SessionAuthority for TcSessionTable {
    fn validate(&self, session_id: SessionId, config_id: ConfigId) -> TopoResult<()> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| TopoError::InvalidState("session table mutex is poisoned"))?;
        match sessions.get(&session_id) {
            None => Err(TopoError::InvalidSessionId(session_id)),
            Some(held) if *held != config_id => Err(TopoError::InvalidConfigId(config_id)),
            Some(_) => Ok(()),
        }
    }
}
