//! Commit, audit, and datastore lifecycle state machines.

pub mod audit;
pub mod candidate;
pub mod context;
pub mod dbconfig;
pub mod import;
pub mod modified;
pub mod phase;
pub mod read;
pub mod timer;
pub mod transaction;

use std::sync::Arc;

use audit::AuditRequest;
use candidate::CandidateWriter;
use context::TxContext;
use dbconfig::DbConfigurationRequest;
use import::ImportRequest;
use read::ReadRequest;
use timer::NotificationTimers;
use topo_common::config::RuntimeConfig;
use topo_core::notify::{AlarmSink, NorthboundSink};
use topo_core::registry::KeyTypeRegistry;
use topo_storage::StorageModule;
use transaction::TransactionRequest;

/// Transaction subsystem bootstrap module.
#[derive(Debug)]
pub struct TransactionModule {
    /// Collaborators shared by every handler below.
    pub ctx: TxContext,
    /// Commit state machine; owned by whoever holds the single-flight flag.
    pub transaction: TransactionRequest,
    /// Per-controller audits.
    pub audit: Arc<AuditRequest>,
    /// Whole-container lifecycle operations.
    pub dbconfig: DbConfigurationRequest,
    /// Configuration writes into CANDIDATE.
    pub candidate: CandidateWriter,
    /// Read family.
    pub reads: ReadRequest,
    /// Controller configuration import.
    pub import: ImportRequest,
}

impl TransactionModule {
    /// Wires every handler over one shared context.
    #[must_use]
    pub fn new(
        config: &RuntimeConfig,
        storage: &StorageModule,
        registry: Arc<KeyTypeRegistry>,
        northbound: Arc<dyn NorthboundSink>,
        alarms: Arc<dyn AlarmSink>,
    ) -> Self {
        let ctx = TxContext {
            pool: storage.pool.clone(),
            registry,
            northbound,
            alarms,
            fatal: Arc::clone(&storage.fatal),
        };
        let audit = Arc::new(AuditRequest::new(
            ctx.clone(),
            NotificationTimers::new(config.notification_delay),
            config.commit_application.clone(),
        ));
        Self {
            transaction: TransactionRequest::new(ctx.clone()),
            dbconfig: DbConfigurationRequest::new(ctx.clone()),
            candidate: CandidateWriter::new(ctx.clone()),
            reads: ReadRequest::new(ctx.clone()),
            import: ImportRequest::new(ctx.clone(), Arc::clone(&audit)),
            audit,
            ctx,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use topo_common::config::RuntimeConfig;
    use topo_core::key::TopoKey;
    use topo_core::registry::KeyTypeRegistry;
    use topo_core::value::{
        BoundaryEnd, BoundaryValue, ControllerValue, DomainValue, DriverType, LogicalPortValue,
        OperStatus, PortValue, Row, RowStatus, SwitchValue, TopoValue,
    };
    use topo_core::version::DatastoreVersion;
    use topo_events::alarm::AlarmBoard;
    use topo_events::journal::NotificationJournal;
    use topo_storage::StorageModule;
    use topo_storage::datastore::InMemoryDatastore;
    use topo_storage::fatal::FatalOnce;

    use crate::audit::AuditRequest;
    use crate::candidate::CandidateWriter;
    use crate::context::TxContext;
    use crate::dbconfig::DbConfigurationRequest;
    use crate::read::ReadRequest;
    use crate::timer::NotificationTimers;
    use crate::transaction::TransactionRequest;

    pub(crate) struct Harness {
        pub(crate) store: Arc<InMemoryDatastore>,
        pub(crate) ctx: TxContext,
        pub(crate) journal: Arc<NotificationJournal>,
        pub(crate) alarms: Arc<AlarmBoard>,
        pub(crate) fatal: Arc<FatalOnce>,
        pub(crate) dbconfig: DbConfigurationRequest,
        notification_delay: Duration,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            Self::with_notification_delay(Duration::from_millis(20))
        }

        pub(crate) fn with_notification_delay(notification_delay: Duration) -> Self {
            let storage = StorageModule::new(&RuntimeConfig::default());
            let journal = Arc::new(NotificationJournal::new());
            let alarms = Arc::new(AlarmBoard::new());
            let ctx = TxContext {
                pool: storage.pool.clone(),
                registry: Arc::new(KeyTypeRegistry::with_builtin_key_types()),
                northbound: journal.clone(),
                alarms: alarms.clone(),
                fatal: Arc::clone(&storage.fatal),
            };
            Self {
                store: storage.datastore,
                dbconfig: DbConfigurationRequest::new(ctx.clone()),
                ctx,
                journal,
                alarms,
                fatal: storage.fatal,
                notification_delay,
            }
        }

        pub(crate) fn put(&self, version: DatastoreVersion, row: Row) {
            self.store
                .put(version, row)
                .expect("test datastore accepts writes");
        }

        pub(crate) fn rows(&self, version: DatastoreVersion) -> Vec<Row> {
            self.store
                .snapshot(version)
                .expect("test datastore is readable")
        }

        pub(crate) fn keys(&self, version: DatastoreVersion) -> Vec<TopoKey> {
            self.rows(version).into_iter().map(|row| row.key).collect()
        }

        pub(crate) fn running_status(&self, key: &TopoKey) -> Option<OperStatus> {
            self.store
                .get(DatastoreVersion::Running, key)
                .ok()
                .flatten()
                .and_then(|row| row.value.oper_status())
        }

        pub(crate) fn state_status(&self, controller: &str) -> Option<OperStatus> {
            self.store
                .get(DatastoreVersion::State, &TopoKey::controller(controller))
                .ok()
                .flatten()
                .and_then(|row| row.value.oper_status())
        }

        pub(crate) fn transaction(&self) -> TransactionRequest {
            TransactionRequest::new(self.ctx.clone())
        }

        pub(crate) fn audit(&self) -> AuditRequest {
            AuditRequest::new(
                self.ctx.clone(),
                NotificationTimers::new(self.notification_delay),
                "physical".to_owned(),
            )
        }

        pub(crate) fn candidate(&self) -> CandidateWriter {
            CandidateWriter::new(self.ctx.clone())
        }

        pub(crate) fn reads(&self) -> ReadRequest {
            ReadRequest::new(self.ctx.clone())
        }
    }

    fn row(key: TopoKey, value: TopoValue, status: RowStatus) -> Row {
        Row::new(key, value, status).expect("test key and value types match")
    }

    pub(crate) fn controller_row(name: &str, status: RowStatus) -> Row {
        row(
            TopoKey::controller(name),
            TopoValue::Controller(ControllerValue {
                driver_type: DriverType::Pfc,
                ip_address: "192.0.2.1".to_owned(),
                description: format!("controller {name}"),
                enable_audit: true,
                oper_status: OperStatus::Up,
            }),
            status,
        )
    }

    pub(crate) fn domain_row(controller: &str, domain: &str, status: RowStatus) -> Row {
        row(
            TopoKey::domain(controller, domain),
            TopoValue::Domain(DomainValue {
                description: format!("domain {domain}"),
                oper_status: OperStatus::Up,
            }),
            status,
        )
    }

    pub(crate) fn boundary_row(
        boundary: &str,
        end1: (&str, &str),
        end2: (&str, &str),
        status: RowStatus,
    ) -> Row {
        let end = |(controller, domain): (&str, &str)| BoundaryEnd {
            controller: controller.to_owned(),
            domain: domain.to_owned(),
            logical_port: None,
        };
        row(
            TopoKey::boundary(boundary),
            TopoValue::Boundary(BoundaryValue {
                description: format!("boundary {boundary}"),
                end1: end(end1),
                end2: end(end2),
                oper_status: OperStatus::Up,
            }),
            status,
        )
    }

    pub(crate) fn switch_row(controller: &str, switch_id: &str, oper_status: OperStatus) -> Row {
        row(
            TopoKey::switch(controller, switch_id),
            TopoValue::Switch(SwitchValue {
                description: format!("switch {switch_id}"),
                model: "generic".to_owned(),
                ip_address: "198.51.100.1".to_owned(),
                oper_status,
            }),
            RowStatus::Applied,
        )
    }

    pub(crate) fn port_row(
        controller: &str,
        switch_id: &str,
        port_id: &str,
        oper_status: OperStatus,
    ) -> Row {
        row(
            TopoKey::port(controller, switch_id, port_id),
            TopoValue::Port(PortValue {
                port_number: 1,
                description: format!("port {port_id}"),
                oper_status,
            }),
            RowStatus::Applied,
        )
    }

    pub(crate) fn logical_port_row(
        controller: &str,
        domain: &str,
        port_id: &str,
        oper_status: OperStatus,
    ) -> Row {
        row(
            TopoKey::logical_port(controller, domain, port_id),
            TopoValue::LogicalPort(LogicalPortValue {
                description: format!("logical port {port_id}"),
                oper_status,
            }),
            RowStatus::Applied,
        )
    }

    pub(crate) fn logical_member_row(
        controller: &str,
        domain: &str,
        port_id: &str,
        switch_id: &str,
        physical_port_id: &str,
    ) -> Row {
        row(
            TopoKey::LogicalMemberPort {
                controller: controller.to_owned(),
                domain: domain.to_owned(),
                port_id: port_id.to_owned(),
                switch_id: switch_id.to_owned(),
                physical_port_id: physical_port_id.to_owned(),
            },
            TopoValue::LogicalMemberPort,
            RowStatus::Applied,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use googletest::prelude::*;
    use rstest::rstest;
    use topo_common::config::RuntimeConfig;
    use topo_core::registry::KeyTypeRegistry;
    use topo_events::EventsModule;
    use topo_storage::StorageModule;

    use super::TransactionModule;
    use crate::phase::TransactionPhase;

    #[rstest]
    fn module_starts_idle_with_no_audits() {
        let config = RuntimeConfig::default();
        let events = EventsModule::new();
        let module = TransactionModule::new(
            &config,
            &StorageModule::new(&config),
            Arc::new(KeyTypeRegistry::with_builtin_key_types()),
            events.northbound(),
            events.alarm_sink(),
        );

        assert_that!(module.transaction.phase(), eq(TransactionPhase::End));
        assert_that!(module.audit.active_audits().unwrap_or_default().is_empty(), eq(true));
        assert_that!(&module.dbconfig.is_candidate_dirty(1), eq(&Ok(false)));
    }
}
