//! Control-channel surface: headers, codes, typed requests, and TC callbacks.

pub mod protocol;
pub mod request;
pub mod session;

use std::sync::Arc;

use session::TcSessionTable;
use topo_core::notify::SessionAuthority;

/// Facade subsystem bootstrap module.
#[derive(Debug, Clone, Default)]
pub struct FacadeModule {
    /// Configuration-mode sessions granted by the TC.
    pub sessions: Arc<TcSessionTable>,
}

impl FacadeModule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Session authority view used by request admission.
    #[must_use]
    pub fn authority(&self) -> Arc<dyn SessionAuthority> {
        self.sessions.clone()
    }
}
