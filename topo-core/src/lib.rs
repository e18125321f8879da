//! Topology data model shared by storage, transaction, and coordinator layers.

pub mod containers;
pub mod key;
pub mod notify;
pub mod record;
pub mod registry;
pub mod value;
pub mod version;

use registry::KeyTypeRegistry;

/// Core module bootstrap object.
///
/// Holds the key-type capability registry consulted by admission checks, the candidate writer,
/// and the audit merge.
#[derive(Debug, Clone)]
pub struct CoreModule {
    /// Capabilities of every topology key type.
    pub registry: KeyTypeRegistry,
}

impl CoreModule {
    /// Creates the core module with the builtin key types.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: KeyTypeRegistry::with_builtin_key_types(),
        }
    }
}

impl Default for CoreModule {
    fn default() -> Self {
        Self::new()
    }
}
