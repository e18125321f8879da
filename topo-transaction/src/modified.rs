//! Rows changed in CANDIDATE relative to RUNNING.

use std::collections::{BTreeMap, BTreeSet};

use topo_common::error::TopoResult;
use topo_core::containers::HotMap as HashMap;
use topo_core::key::{KeyType, TopoKey};
use topo_core::notify::Notification;
use topo_core::value::{DriverType, RowStatus, TopoValue};
use topo_core::version::DatastoreVersion;
use topo_storage::pool::DbConnection;

/// Configurable key types in dependency order.
pub const CONFIG_KEY_TYPES: [KeyType; 3] = [KeyType::Controller, KeyType::Domain, KeyType::Boundary];

/// Changed keys of one key type, each list in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyTypeChanges {
    /// Keys absent from RUNNING.
    pub created: Vec<TopoKey>,
    /// Keys present in RUNNING with a changed value.
    pub updated: Vec<TopoKey>,
    /// Keys deleted from CANDIDATE but still in RUNNING.
    pub deleted: Vec<TopoKey>,
}

impl KeyTypeChanges {
    fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Per-key-type created/updated/deleted keys plus the values needed to notify or undo them.
#[derive(Debug, Clone, Default)]
pub struct ModifiedRowSet {
    changes: BTreeMap<KeyType, KeyTypeChanges>,
    pre_images: HashMap<TopoKey, TopoValue>,
    candidate_values: HashMap<TopoKey, TopoValue>,
}

impl ModifiedRowSet {
    /// Scans CANDIDATE for pending rows of every configurable key type.
    ///
    /// # Errors
    ///
    /// Returns datastore errors from the scan.
    pub fn collect(connection: &DbConnection) -> TopoResult<Self> {
        let mut set = Self::default();
        for key_type in CONFIG_KEY_TYPES {
            let pending = connection.scan(DatastoreVersion::Candidate, |row| {
                row.key.key_type() == key_type && row.status.is_pending()
            })?;
            let mut changes = KeyTypeChanges::default();
            for row in pending {
                let running = connection.get(DatastoreVersion::Running, &row.key)?;
                match (row.status, running) {
                    (RowStatus::Deleted, Some(committed)) => {
                        changes.deleted.push(row.key.clone());
                        let _ = set.pre_images.insert(row.key, committed.value);
                    }
                    // Created and deleted again before any commit: nothing to apply.
                    (RowStatus::Deleted, None) => {}
                    (_, Some(committed)) => {
                        changes.updated.push(row.key.clone());
                        let _ = set.pre_images.insert(row.key.clone(), committed.value);
                        let _ = set.candidate_values.insert(row.key, row.value);
                    }
                    (_, None) => {
                        changes.created.push(row.key.clone());
                        let _ = set.candidate_values.insert(row.key, row.value);
                    }
                }
            }
            if !changes.is_empty() {
                let _ = set.changes.insert(key_type, changes);
            }
        }
        Ok(set)
    }

    /// Returns whether no change was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Drops every collected change.
    pub fn clear(&mut self) {
        self.changes.clear();
        self.pre_images.clear();
        self.candidate_values.clear();
    }

    /// Changes of one key type.
    #[must_use]
    pub fn changes(&self, key_type: KeyType) -> Option<&KeyTypeChanges> {
        self.changes.get(&key_type)
    }

    /// Value the key had in RUNNING before the cycle.
    #[must_use]
    pub fn pre_image(&self, key: &TopoKey) -> Option<&TopoValue> {
        self.pre_images.get(key)
    }

    /// Total number of changed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes
            .values()
            .map(|changes| changes.created.len() + changes.updated.len() + changes.deleted.len())
            .sum()
    }

    /// Controller names touched by the changes, grouped by the owning driver.
    ///
    /// Driver types are resolved from the candidate value of a controller, from its pre-image for
    /// deleted controllers, and otherwise from `lookup`, which sees CANDIDATE and RUNNING.
    ///
    /// # Errors
    ///
    /// Returns errors raised by `lookup`.
    pub fn participants<F>(&self, mut lookup: F) -> TopoResult<BTreeMap<DriverType, BTreeSet<String>>>
    where
        F: FnMut(&str) -> TopoResult<Option<DriverType>>,
    {
        let mut controllers = BTreeSet::new();
        for changes in self.changes.values() {
            for key in changes
                .created
                .iter()
                .chain(&changes.updated)
                .chain(&changes.deleted)
            {
                controllers.extend(self.controllers_of(key));
            }
        }

        let mut participants: BTreeMap<DriverType, BTreeSet<String>> = BTreeMap::new();
        for controller in controllers {
            let key = TopoKey::controller(controller.clone());
            let driver = match self
                .candidate_values
                .get(&key)
                .or_else(|| self.pre_images.get(&key))
                .and_then(TopoValue::driver_type)
            {
                Some(driver) => Some(driver),
                None => lookup(&controller)?,
            };
            if let Some(driver) = driver {
                let _ = participants.entry(driver).or_default().insert(controller);
            }
        }
        Ok(participants)
    }

    fn controllers_of(&self, key: &TopoKey) -> Vec<String> {
        if let Some(controller) = key.controller_name() {
            return vec![controller.to_owned()];
        }
        let value = self
            .candidate_values
            .get(key)
            .or_else(|| self.pre_images.get(key));
        match value {
            Some(TopoValue::Boundary(boundary)) => {
                vec![boundary.end1.controller.clone(), boundary.end2.controller.clone()]
            }
            _ => Vec::new(),
        }
    }

    /// Notifications describing the committed changes.
    ///
    /// `committed` returns the value a key holds after the commit. Creates and updates follow
    /// dependency order, deletes follow reverse dependency order. An update whose committed value
    /// equals its pre-image produces no notification.
    pub fn commit_notifications<F>(&self, mut committed: F) -> Vec<Notification>
    where
        F: FnMut(&TopoKey) -> Option<TopoValue>,
    {
        let mut notifications = Vec::new();
        for changes in self.changes.values() {
            for key in &changes.created {
                if let Some(value) = committed(key) {
                    notifications.push(Notification::Create {
                        key: key.clone(),
                        value,
                    });
                }
            }
            for key in &changes.updated {
                let (Some(old), Some(new)) = (self.pre_images.get(key), committed(key)) else {
                    continue;
                };
                if old != &new {
                    notifications.push(Notification::Update {
                        key: key.clone(),
                        old: old.clone(),
                        new,
                    });
                }
            }
        }
        for changes in self.changes.values().rev() {
            for key in &changes.deleted {
                if let Some(old) = self.pre_images.get(key) {
                    notifications.push(Notification::Delete {
                        key: key.clone(),
                        old: old.clone(),
                    });
                }
            }
        }
        notifications
    }

    /// Notifications describing the rollback of these changes, CANDIDATE back to RUNNING.
    #[must_use]
    pub fn rollback_notifications(&self) -> Vec<Notification> {
        let mut notifications = Vec::new();
        for changes in self.changes.values().rev() {
            for key in &changes.created {
                if let Some(value) = self.candidate_values.get(key) {
                    notifications.push(Notification::Delete {
                        key: key.clone(),
                        old: value.clone(),
                    });
                }
            }
        }
        for changes in self.changes.values() {
            for key in &changes.updated {
                if let (Some(discarded), Some(restored)) =
                    (self.candidate_values.get(key), self.pre_images.get(key))
                    && discarded != restored
                {
                    notifications.push(Notification::Update {
                        key: key.clone(),
                        old: discarded.clone(),
                        new: restored.clone(),
                    });
                }
            }
            for key in &changes.deleted {
                if let Some(value) = self.pre_images.get(key) {
                    notifications.push(Notification::Create {
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        notifications
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::ModifiedRowSet;
    use googletest::prelude::*;
    use rstest::rstest;
    use topo_common::config::RuntimeConfig;
    use topo_common::ids::OwnerTag;
    use topo_core::key::{KeyType, TopoKey};
    use topo_core::notify::Notification;
    use topo_core::value::{
        ControllerValue, DomainValue, DriverType, OperStatus, Row, RowStatus, TopoValue,
    };
    use topo_core::version::DatastoreVersion;
    use topo_storage::datastore::InMemoryDatastore;
    use topo_storage::pool::{ConnectionPool, ConnectionPurpose};

    fn controller(driver: DriverType, ip: &str) -> TopoValue {
        TopoValue::Controller(ControllerValue {
            driver_type: driver,
            ip_address: ip.to_owned(),
            description: String::new(),
            enable_audit: true,
            oper_status: OperStatus::Unknown,
        })
    }

    fn domain() -> TopoValue {
        TopoValue::Domain(DomainValue {
            description: "default".to_owned(),
            oper_status: OperStatus::Unknown,
        })
    }

    fn seeded() -> (Arc<InMemoryDatastore>, ConnectionPool) {
        let store = Arc::new(InMemoryDatastore::new());
        let pool = ConnectionPool::new(Arc::clone(&store), &RuntimeConfig::default());
        let put = |version, key: TopoKey, value: TopoValue, status| {
            let _ = store.put(version, Row { key, value, status });
        };
        put(
            DatastoreVersion::Running,
            TopoKey::controller("c1"),
            controller(DriverType::Pfc, "10.0.0.1"),
            RowStatus::Applied,
        );
        put(
            DatastoreVersion::Running,
            TopoKey::controller("c2"),
            controller(DriverType::Odc, "10.0.0.2"),
            RowStatus::Applied,
        );
        put(
            DatastoreVersion::Candidate,
            TopoKey::controller("c1"),
            controller(DriverType::Pfc, "10.0.0.9"),
            RowStatus::Updated,
        );
        put(
            DatastoreVersion::Candidate,
            TopoKey::controller("c2"),
            controller(DriverType::Odc, "10.0.0.2"),
            RowStatus::Deleted,
        );
        put(
            DatastoreVersion::Candidate,
            TopoKey::controller("c3"),
            controller(DriverType::Vnp, "10.0.0.3"),
            RowStatus::Created,
        );
        put(
            DatastoreVersion::Candidate,
            TopoKey::domain("c3", "d1"),
            domain(),
            RowStatus::Created,
        );
        (store, pool)
    }

    #[rstest]
    fn collect_classifies_pending_rows_against_running() {
        let (_, pool) = seeded();
        let Ok(connection) = pool.checkout(ConnectionPurpose::ReadOnly, OwnerTag::new(1, 1)) else {
            panic!("checkout failed");
        };
        let set = ModifiedRowSet::collect(&connection).unwrap_or_default();

        let controllers = set.changes(KeyType::Controller).cloned().unwrap_or_default();
        assert_eq!(controllers.created, vec![TopoKey::controller("c3")]);
        assert_eq!(controllers.updated, vec![TopoKey::controller("c1")]);
        assert_eq!(controllers.deleted, vec![TopoKey::controller("c2")]);
        assert_that!(set.len(), eq(4_usize));
        assert_that!(
            set.pre_image(&TopoKey::controller("c1")).is_some(),
            eq(true)
        );
    }

    #[rstest]
    fn participants_group_controllers_by_driver() {
        let (_, pool) = seeded();
        let Ok(connection) = pool.checkout(ConnectionPurpose::ReadOnly, OwnerTag::new(1, 1)) else {
            panic!("checkout failed");
        };
        let set = ModifiedRowSet::collect(&connection).unwrap_or_default();
        let participants = set.participants(|_| Ok(None)).unwrap_or_default();

        assert_that!(participants.len(), eq(3_usize));
        assert_that!(
            participants
                .get(&DriverType::Vnp)
                .is_some_and(|names| names.contains("c3")),
            eq(true)
        );
    }

    #[rstest]
    fn unchanged_update_is_not_notified_and_deletes_come_last() {
        let (_, pool) = seeded();
        let Ok(connection) = pool.checkout(ConnectionPurpose::ReadOnly, OwnerTag::new(1, 1)) else {
            panic!("checkout failed");
        };
        let set = ModifiedRowSet::collect(&connection).unwrap_or_default();
        let running_c1 = set.pre_image(&TopoKey::controller("c1")).cloned();

        let notifications = set.commit_notifications(|key| {
            if key == &TopoKey::controller("c1") {
                running_c1.clone()
            } else {
                Some(domain())
            }
        });

        assert_that!(
            notifications
                .iter()
                .any(|notification| matches!(notification, Notification::Update { .. })),
            eq(false)
        );
        assert_that!(
            matches!(notifications.last(), Some(Notification::Delete { .. })),
            eq(true)
        );
    }

    #[rstest]
    fn rollback_inverts_every_change() {
        let (_, pool) = seeded();
        let Ok(connection) = pool.checkout(ConnectionPurpose::ReadOnly, OwnerTag::new(1, 1)) else {
            panic!("checkout failed");
        };
        let set = ModifiedRowSet::collect(&connection).unwrap_or_default();
        let rollback = set.rollback_notifications();

        let deletes = rollback
            .iter()
            .filter(|notification| matches!(notification, Notification::Delete { .. }))
            .count();
        let creates = rollback
            .iter()
            .filter(|notification| matches!(notification, Notification::Create { .. }))
            .count();
        assert_that!(deletes, eq(2_usize));
        assert_that!(creates, eq(1_usize));
        assert_that!(rollback.len(), eq(4_usize));
    }
}
