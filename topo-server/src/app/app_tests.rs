use super::CoordinatorApp;
use crate::itc::header;
use googletest::prelude::*;
use rstest::rstest;
use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use topo_common::config::{NodeRole, RuntimeConfig};
use topo_common::error::TopoError;
use topo_common::ids::{ConfigId, SessionId};
use topo_core::key::{KeyType, TopoKey};
use topo_core::notify::Notification;
use topo_core::value::{
    ControllerValue, DomainValue, DriverType, OperStatus, Row, SwitchValue, TopoValue,
};
use topo_core::version::DatastoreVersion;
use topo_facade::protocol::{Operation, ResultCode};
use topo_facade::request::{
    Request, RequestBody, Response, ResponseBody, TcAbortMarker, TcAuditKind, TcCall,
    TcDriverResult, TcReply, TcResponse, TcRound, TcRoundState,
};
use topo_storage::datastore::FaultPoint;
use topo_transaction::phase::TransactionPhase;

mod audit;
mod commit;
mod testkit;

#[rstest]
fn startup_summary_names_role_and_workers() {
    let app = CoordinatorApp::new(RuntimeConfig::default()).expect("app should start");
    let summary = app.startup_summary();
    assert_that!(summary.contains("role=Active"), eq(true));
    assert_that!(summary.contains("workers=4"), eq(true));
    assert_that!(summary.contains("key_types=9"), eq(true));
}

#[rstest]
fn zero_workers_is_rejected_before_wiring() {
    let config = RuntimeConfig {
        worker_threads: 0,
        ..RuntimeConfig::default()
    };
    assert_eq!(
        CoordinatorApp::new(config).err(),
        Some(TopoError::InvalidConfig("worker_threads must be non-zero"))
    );
}
