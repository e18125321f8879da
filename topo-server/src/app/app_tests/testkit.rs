use super::*;

pub(super) const SESSION: SessionId = 7;

pub(super) fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        checkout_wait: Duration::from_millis(50),
        notification_delay: Duration::from_millis(20),
        ..RuntimeConfig::default()
    }
}

pub(super) fn app() -> CoordinatorApp {
    CoordinatorApp::new(test_config()).expect("app should start")
}

pub(super) fn open_session(app: &CoordinatorApp) -> ConfigId {
    app.facade
        .sessions
        .acquire(SESSION)
        .expect("session should be granted")
}

pub(super) fn controller_value() -> TopoValue {
    TopoValue::Controller(ControllerValue {
        driver_type: DriverType::Pfc,
        ip_address: "192.0.2.10".to_owned(),
        description: "lab controller".to_owned(),
        enable_audit: true,
        oper_status: OperStatus::Up,
    })
}

pub(super) fn keyed(
    config: ConfigId,
    operation: Operation,
    version: DatastoreVersion,
    key: TopoKey,
    value: Option<TopoValue>,
) -> Request {
    Request {
        header: header(SESSION, config, operation, key.key_type(), version),
        body: RequestBody::Keyed { key, value },
    }
}

pub(super) fn controller_scoped(
    config: ConfigId,
    operation: Operation,
    controller: &str,
    rows: Vec<Row>,
) -> Request {
    Request {
        header: header(
            SESSION,
            config,
            operation,
            KeyType::Controller,
            DatastoreVersion::Import,
        ),
        body: RequestBody::Controller {
            controller: controller.to_owned(),
            rows,
        },
    }
}

pub(super) fn send(app: &CoordinatorApp, request: Request) -> Response {
    app.request(request).expect("worker should answer")
}

pub(super) fn tc(app: &CoordinatorApp, call: TcCall) -> TcResponse {
    app.tc(call).expect("worker should answer")
}

pub(super) fn create_controller(app: &CoordinatorApp, config: ConfigId, name: &str) -> Response {
    send(
        app,
        keyed(
            config,
            Operation::Create,
            DatastoreVersion::Candidate,
            TopoKey::controller(name),
            Some(controller_value()),
        ),
    )
}

pub(super) fn driver_result(config: ConfigId, round: TcRound, result: TcDriverResult) -> TcCall {
    TcCall::CommitDriverResult {
        session: SESSION,
        config,
        round,
        driver: DriverType::Pfc,
        result,
    }
}

/// Drives one full commit cycle in which the single PFC driver succeeds twice.
pub(super) fn commit_cycle(app: &CoordinatorApp, config: ConfigId) -> Vec<TcResponse> {
    [
        TcCall::CommitTransactionStart {
            session: SESSION,
            config,
        },
        TcCall::CommitVoteRequest {
            session: SESSION,
            config,
        },
        driver_result(config, TcRound::Vote, TcDriverResult::Success),
        TcCall::CommitGlobalCommit {
            session: SESSION,
            config,
        },
        driver_result(config, TcRound::GlobalCommit, TcDriverResult::Success),
        TcCall::CommitTransactionEnd {
            session: SESSION,
            config,
            committed: true,
        },
    ]
    .into_iter()
    .map(|call| tc(app, call))
    .collect()
}

/// Creates and commits one controller per name.
pub(super) fn committed_app(names: &[&str]) -> (CoordinatorApp, ConfigId) {
    let app = app();
    let config = open_session(&app);
    for name in names {
        let created = create_controller(&app, config, name);
        assert_that!(created.result_code(), eq(ResultCode::Success));
    }
    let replies = commit_cycle(&app, config);
    assert_that!(
        replies.iter().all(|reply| reply.result.is_success()),
        eq(true)
    );
    (app, config)
}

pub(super) fn rows(app: &CoordinatorApp, version: DatastoreVersion) -> Vec<Row> {
    app.storage
        .datastore
        .snapshot(version)
        .expect("test datastore is readable")
}

pub(super) fn keys(app: &CoordinatorApp, version: DatastoreVersion) -> Vec<TopoKey> {
    rows(app, version).into_iter().map(|row| row.key).collect()
}

pub(super) fn state_status(app: &CoordinatorApp, controller: &str) -> Option<OperStatus> {
    app.storage
        .datastore
        .get(DatastoreVersion::State, &TopoKey::controller(controller))
        .ok()
        .flatten()
        .and_then(|row| row.value.oper_status())
}

pub(super) fn notifications(app: &CoordinatorApp) -> Vec<Notification> {
    app.events
        .journal
        .entries()
        .expect("journal is readable")
        .into_iter()
        .map(|entry| entry.notification)
        .collect()
}

pub(super) fn switch_row(controller: &str, switch_id: &str) -> Row {
    Row::applied(
        TopoKey::switch(controller, switch_id),
        TopoValue::Switch(SwitchValue {
            description: format!("switch {switch_id}"),
            model: "generic".to_owned(),
            ip_address: "198.51.100.20".to_owned(),
            oper_status: OperStatus::Up,
        }),
    )
    .expect("switch key and value match")
}

pub(super) fn domain_row(controller: &str, domain: &str) -> Row {
    Row::applied(
        TopoKey::domain(controller, domain),
        TopoValue::Domain(DomainValue {
            description: format!("domain {domain}"),
            oper_status: OperStatus::Up,
        }),
    )
    .expect("domain key and value match")
}

pub(super) fn audit_start(controller: &str) -> TcCall {
    TcCall::AuditStart {
        controller: controller.to_owned(),
        driver: DriverType::Pfc,
        kind: TcAuditKind::Normal,
    }
}

pub(super) fn audit_cancel(controller: &str) -> TcCall {
    TcCall::AuditCancel {
        controller: controller.to_owned(),
        driver: DriverType::Pfc,
    }
}
