//! Key-type capability registry.
//!
//! Every key type declares its capabilities explicitly: which containers accept configuration
//! and reads, its place in the audit merge order, and how its operational status follows a
//! controller going down. A key type missing from the registry is an error, never a silent
//! "accept everything" default.

use topo_common::error::{TopoError, TopoResult};

use crate::containers::HotMap as HashMap;
use crate::key::KeyType;
use crate::value::OperStatus;
use crate::version::DatastoreVersion;

/// Status rule applied to dependents when the owning controller changes status.
///
/// Returns `None` when the dependent keeps its current status.
pub type CascadeRule = fn(OperStatus) -> Option<OperStatus>;

/// Capabilities of one key type.
#[derive(Debug, Clone, Copy)]
pub struct KeyTypeSpec {
    /// Key type these capabilities belong to.
    pub key_type: KeyType,
    /// Key type that must exist before rows of this type.
    pub parent: Option<KeyType>,
    /// Whether northbound clients may create/update/delete rows of this type.
    pub configurable: bool,
    /// Containers that serve reads of this type.
    pub read_versions: &'static [DatastoreVersion],
    /// Position in the audit import merge, `None` when the type is not merged.
    pub audit_merge_rank: Option<u8>,
    /// Reaction to the owning controller's status.
    pub cascade: CascadeRule,
}

const CONFIG_READ_VERSIONS: &[DatastoreVersion] = &[
    DatastoreVersion::Candidate,
    DatastoreVersion::Running,
    DatastoreVersion::Startup,
    DatastoreVersion::State,
];

const STATE_READ_VERSIONS: &[DatastoreVersion] =
    &[DatastoreVersion::Running, DatastoreVersion::State];

fn no_cascade(_controller: OperStatus) -> Option<OperStatus> {
    None
}

fn down_follows_controller(controller: OperStatus) -> Option<OperStatus> {
    (controller == OperStatus::Down).then_some(OperStatus::Down)
}

fn unknown_follows_controller(controller: OperStatus) -> Option<OperStatus> {
    (controller == OperStatus::Down).then_some(OperStatus::Unknown)
}

/// Registry mapping each key type to its capabilities.
#[derive(Debug, Clone, Default)]
pub struct KeyTypeRegistry {
    entries: HashMap<KeyType, KeyTypeSpec>,
}

impl KeyTypeRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Builds a registry preloaded with every topology key type.
    #[must_use]
    pub fn with_builtin_key_types() -> Self {
        let mut registry = Self::new();
        registry.register_config_key_types();
        registry.register_state_key_types();
        registry
    }

    fn register_config_key_types(&mut self) {
        self.register(KeyTypeSpec {
            key_type: KeyType::Controller,
            parent: None,
            configurable: true,
            read_versions: CONFIG_READ_VERSIONS,
            audit_merge_rank: None,
            cascade: no_cascade,
        });
        self.register(KeyTypeSpec {
            key_type: KeyType::Domain,
            parent: Some(KeyType::Controller),
            configurable: true,
            read_versions: CONFIG_READ_VERSIONS,
            audit_merge_rank: Some(0),
            cascade: down_follows_controller,
        });
        self.register(KeyTypeSpec {
            key_type: KeyType::Boundary,
            parent: Some(KeyType::Domain),
            configurable: true,
            read_versions: CONFIG_READ_VERSIONS,
            audit_merge_rank: None,
            cascade: down_follows_controller,
        });
    }

    fn register_state_key_types(&mut self) {
        self.register(KeyTypeSpec {
            key_type: KeyType::LogicalPort,
            parent: Some(KeyType::Domain),
            configurable: false,
            read_versions: STATE_READ_VERSIONS,
            audit_merge_rank: Some(1),
            cascade: down_follows_controller,
        });
        self.register(KeyTypeSpec {
            key_type: KeyType::LogicalMemberPort,
            parent: Some(KeyType::LogicalPort),
            configurable: false,
            read_versions: STATE_READ_VERSIONS,
            audit_merge_rank: Some(2),
            cascade: no_cascade,
        });
        self.register(KeyTypeSpec {
            key_type: KeyType::Switch,
            parent: Some(KeyType::Controller),
            configurable: false,
            read_versions: STATE_READ_VERSIONS,
            audit_merge_rank: Some(3),
            cascade: unknown_follows_controller,
        });
        self.register(KeyTypeSpec {
            key_type: KeyType::Port,
            parent: Some(KeyType::Switch),
            configurable: false,
            read_versions: STATE_READ_VERSIONS,
            audit_merge_rank: Some(4),
            cascade: unknown_follows_controller,
        });
        self.register(KeyTypeSpec {
            key_type: KeyType::PortNeighbor,
            parent: Some(KeyType::Port),
            configurable: false,
            read_versions: STATE_READ_VERSIONS,
            audit_merge_rank: Some(5),
            cascade: no_cascade,
        });
        self.register(KeyTypeSpec {
            key_type: KeyType::Link,
            parent: Some(KeyType::Switch),
            configurable: false,
            read_versions: STATE_READ_VERSIONS,
            audit_merge_rank: Some(6),
            cascade: unknown_follows_controller,
        });
    }

    /// Registers or replaces one key type.
    pub fn register(&mut self, spec: KeyTypeSpec) {
        let _ = self.entries.insert(spec.key_type, spec);
    }

    /// Looks up one key type.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidRequest` when the key type was never registered.
    pub fn spec(&self, key_type: KeyType) -> TopoResult<&KeyTypeSpec> {
        self.entries.get(&key_type).ok_or_else(|| {
            TopoError::InvalidRequest(format!("key type {key_type} is not registered"))
        })
    }

    /// Checks that a configuration write of `key_type` may target `version`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidRequest` when the key type is read-only or the version is not
    /// the candidate container.
    pub fn check_config_target(
        &self,
        key_type: KeyType,
        version: DatastoreVersion,
    ) -> TopoResult<()> {
        let spec = self.spec(key_type)?;
        if !spec.configurable {
            return Err(TopoError::InvalidRequest(format!(
                "key type {key_type} does not accept configuration"
            )));
        }
        if version != DatastoreVersion::Candidate {
            return Err(TopoError::InvalidRequest(format!(
                "configuration of {key_type} is only accepted in CANDIDATE, got {version}"
            )));
        }
        Ok(())
    }

    /// Checks that `key_type` can be read from `version`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidRequest` when the version does not serve this key type.
    pub fn check_read_target(&self, key_type: KeyType, version: DatastoreVersion) -> TopoResult<()> {
        let spec = self.spec(key_type)?;
        if spec.read_versions.contains(&version) {
            return Ok(());
        }
        Err(TopoError::InvalidRequest(format!(
            "key type {key_type} cannot be read from {version}"
        )))
    }

    /// Key types merged by a controller audit, in dependency order.
    #[must_use]
    pub fn audit_merge_order(&self) -> Vec<KeyType> {
        let mut ranked = self
            .entries
            .values()
            .filter_map(|spec| spec.audit_merge_rank.map(|rank| (rank, spec.key_type)))
            .collect::<Vec<_>>();
        ranked.sort_unstable();
        ranked.into_iter().map(|(_, key_type)| key_type).collect()
    }

    /// Status a dependent of `key_type` takes when its controller changes to `controller`.
    #[must_use]
    pub fn cascade_status(&self, key_type: KeyType, controller: OperStatus) -> Option<OperStatus> {
        self.entries
            .get(&key_type)
            .and_then(|spec| (spec.cascade)(controller))
    }

    /// Number of registered key types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
