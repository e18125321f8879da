use super::testkit::*;
use super::*;

#[rstest]
fn second_audit_of_a_controller_is_refused_while_another_controller_proceeds() {
    let (app, _) = committed_app(&["c1", "c2"]);
    let app = Arc::new(app);

    let first = tc(&app, audit_start("c1"));
    assert_that!(&first, eq(&TcResponse::ok(TcReply::Ack)));
    let again = tc(&app, audit_start("c1"));
    assert_that!(again.result, eq(ResultCode::InvalidState));

    let other = {
        let app = Arc::clone(&app);
        thread::spawn(move || tc(&app, audit_start("c2")))
    };
    let other = other.join().expect("audit thread should not panic");
    assert_that!(other.result, eq(ResultCode::Success));

    let audits = app.status().map(|status| status.active_audits);
    assert_that!(
        &audits,
        eq(&Ok(vec!["c1".to_owned(), "c2".to_owned()]))
    );
    assert_that!(state_status(&app, "c1"), eq(Some(OperStatus::Auditing)));

    for controller in ["c1", "c2"] {
        let cancelled = tc(&app, audit_cancel(controller));
        assert_that!(
            &cancelled.reply,
            eq(&TcReply::AuditClosed {
                succeeded: false,
                status: OperStatus::Down
            })
        );
    }
    assert_that!(state_status(&app, "c1"), eq(Some(OperStatus::Down)));
    assert_that!(
        &app.status().map(|status| status.active_audits.is_empty()),
        eq(&Ok(true))
    );
}

#[rstest]
fn completed_audit_merges_reported_rows_into_running() {
    let (app, _) = committed_app(&["c1"]);
    let driver = DriverType::Pfc;
    let controller = "c1".to_owned();

    let _ = tc(&app, audit_start("c1"));
    let started = tc(
        &app,
        TcCall::AuditTransactionStart {
            controller: controller.clone(),
            driver,
        },
    );
    assert_that!(started.result, eq(ResultCode::Success));
    assert_that!(
        &app.upload_audit_rows("c1", vec![switch_row("c1", "sw1")]),
        eq(&Ok(1_usize))
    );

    let calls = [
        TcCall::AuditVoteRequest {
            controller: controller.clone(),
            driver,
        },
        TcCall::AuditDriverResult {
            controller: controller.clone(),
            driver,
            round: TcRound::Vote,
            result: TcDriverResult::Success,
        },
        TcCall::AuditGlobalCommit {
            controller: controller.clone(),
            driver,
        },
        TcCall::AuditDriverResult {
            controller: controller.clone(),
            driver,
            round: TcRound::GlobalCommit,
            result: TcDriverResult::Success,
        },
        TcCall::AuditTransactionEnd {
            controller: controller.clone(),
            driver,
        },
        TcCall::AuditEnd {
            controller: controller.clone(),
            driver,
            succeeded: true,
            commit_version: None,
        },
    ];
    let replies = calls
        .into_iter()
        .map(|call| tc(&app, call).reply)
        .collect::<Vec<_>>();

    let instructions = BTreeMap::from([(driver, vec![controller.clone()])]);
    assert_that!(
        &replies,
        eq(&vec![
            TcReply::Instructions(instructions.clone()),
            TcReply::Round(TcRoundState::Succeeded),
            TcReply::Instructions(instructions),
            TcReply::Round(TcRoundState::Succeeded),
            TcReply::AuditMerged {
                created: 1,
                updated: 0,
                deleted: 0
            },
            TcReply::AuditClosed {
                succeeded: true,
                status: OperStatus::Up
            },
        ])
    );
    let switch = TopoKey::switch("c1", "sw1");
    assert_that!(
        keys(&app, DatastoreVersion::Running).contains(&switch),
        eq(true)
    );
    assert_that!(
        keys(&app, DatastoreVersion::Candidate).contains(&switch),
        eq(true)
    );
    assert_that!(keys(&app, DatastoreVersion::Import).is_empty(), eq(true));
    assert_that!(state_status(&app, "c1"), eq(Some(OperStatus::Up)));
    assert_that!(
        notifications(&app)
            .iter()
            .any(|notification| matches!(notification, Notification::Create { key, .. } if *key == switch)),
        eq(true)
    );
}

#[rstest]
fn failed_audit_vote_restores_the_controller_status() {
    let (app, _) = committed_app(&["c1"]);
    let controller = "c1".to_owned();
    let driver = DriverType::Pfc;
    let _ = tc(&app, audit_start("c1"));
    let _ = tc(
        &app,
        TcCall::AuditTransactionStart {
            controller: controller.clone(),
            driver,
        },
    );
    let _ = tc(
        &app,
        TcCall::AuditVoteRequest {
            controller: controller.clone(),
            driver,
        },
    );
    let vote = tc(
        &app,
        TcCall::AuditDriverResult {
            controller: controller.clone(),
            driver,
            round: TcRound::Vote,
            result: TcDriverResult::Timeout,
        },
    );
    assert_that!(&vote.reply, eq(&TcReply::Round(TcRoundState::Aborted)));

    let ended = tc(
        &app,
        TcCall::AuditEnd {
            controller,
            driver,
            succeeded: true,
            commit_version: None,
        },
    );
    assert_that!(
        &ended.reply,
        eq(&TcReply::AuditClosed {
            succeeded: false,
            status: OperStatus::Down
        })
    );
    assert_that!(state_status(&app, "c1"), eq(Some(OperStatus::Down)));
}

#[rstest]
fn audit_is_refused_while_the_controller_imports() {
    let (app, config) = committed_app(&["c1"]);

    let imported = send(
        &app,
        controller_scoped(
            config,
            Operation::ImportControllerConfig,
            "c1",
            vec![domain_row("c1", "d1")],
        ),
    );
    assert_that!(&imported.body, eq(&ResponseBody::Count(1)));

    let refused = tc(&app, audit_start("c1"));
    assert_that!(refused.result, eq(ResultCode::OperationNotAllowed));

    let cleared = send(
        &app,
        controller_scoped(config, Operation::ClearImportConfig, "c1", Vec::new()),
    );
    assert_that!(cleared.result_code(), eq(ResultCode::Success));
    let started = tc(&app, audit_start("c1"));
    assert_that!(started.result, eq(ResultCode::Success));
}

#[rstest]
fn merged_import_becomes_pending_candidate_changes() {
    let (app, config) = committed_app(&["c1"]);
    let _ = send(
        &app,
        controller_scoped(
            config,
            Operation::ImportControllerConfig,
            "c1",
            vec![domain_row("c1", "d1")],
        ),
    );

    let merged = send(
        &app,
        controller_scoped(config, Operation::MergeControllerConfig, "c1", Vec::new()),
    );
    assert_that!(&merged.body, eq(&ResponseBody::Count(1)));

    let dirty = send(
        &app,
        Request {
            header: header(
                SESSION,
                config,
                Operation::IsCandidateDirty,
                KeyType::Controller,
                DatastoreVersion::Candidate,
            ),
            body: RequestBody::Empty,
        },
    );
    assert_that!(&dirty.body, eq(&ResponseBody::Dirty(true)));
}

#[rstest]
fn southbound_status_outside_audit_lands_in_state() {
    let (app, _) = committed_app(&["c1"]);
    assert_that!(
        &app.report_oper_status(&TopoKey::controller("c1"), OperStatus::Up),
        eq(&Ok(1_usize))
    );
    assert_that!(state_status(&app, "c1"), eq(Some(OperStatus::Up)));
}
