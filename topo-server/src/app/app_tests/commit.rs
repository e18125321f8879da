use super::testkit::*;
use super::*;

#[rstest]
fn committed_controller_reaches_running_with_one_create_notification() {
    let app = app();
    let config = open_session(&app);
    let created = create_controller(&app, config, "c1");
    assert_that!(created.result_code(), eq(ResultCode::Success));

    let replies = commit_cycle(&app, config)
        .into_iter()
        .map(|response| response.reply)
        .collect::<Vec<_>>();

    let instructions = BTreeMap::from([(DriverType::Pfc, vec!["c1".to_owned()])]);
    assert_that!(
        &replies,
        eq(&vec![
            TcReply::Participants(vec![DriverType::Pfc]),
            TcReply::Instructions(instructions.clone()),
            TcReply::Round(TcRoundState::Succeeded),
            TcReply::Instructions(instructions),
            TcReply::Round(TcRoundState::Succeeded),
            TcReply::Committed {
                applied: 1,
                notified: 1
            },
        ])
    );
    assert_that!(
        &keys(&app, DatastoreVersion::Running),
        eq(&vec![TopoKey::controller("c1")])
    );
    assert_eq!(
        rows(&app, DatastoreVersion::Candidate),
        rows(&app, DatastoreVersion::Running)
    );
    assert_that!(
        &notifications(&app),
        eq(&vec![Notification::Create {
            key: TopoKey::controller("c1"),
            value: controller_value(),
        }])
    );
    assert_that!(state_status(&app, "c1"), eq(Some(OperStatus::Down)));
    let status = app.status().expect("status is readable");
    assert_that!(status.phase, eq(TransactionPhase::End));
    assert_that!(status.config_in_flight, eq(false));
}

#[rstest]
fn failed_vote_aborts_without_touching_running() {
    let app = app();
    let config = open_session(&app);
    let _ = create_controller(&app, config, "c1");

    let _ = tc(
        &app,
        TcCall::CommitTransactionStart {
            session: SESSION,
            config,
        },
    );
    let _ = tc(
        &app,
        TcCall::CommitVoteRequest {
            session: SESSION,
            config,
        },
    );
    let vote = tc(
        &app,
        driver_result(config, TcRound::Vote, TcDriverResult::Failure),
    );
    assert_that!(&vote.reply, eq(&TcReply::Round(TcRoundState::Aborted)));

    let late_abort = tc(
        &app,
        TcCall::AbortTransaction {
            session: SESSION,
            config,
            marker: TcAbortMarker::Vote,
        },
    );
    assert_that!(late_abort.result, eq(ResultCode::Success));
    assert_that!(keys(&app, DatastoreVersion::Running).is_empty(), eq(true));
    assert_that!(notifications(&app).is_empty(), eq(true));
    assert_that!(
        &app.status().map(|status| status.phase),
        eq(&Ok(TransactionPhase::End))
    );

    let aborted = tc(
        &app,
        TcCall::AbortCandidate {
            session: SESSION,
            config,
        },
    );
    assert_that!(
        &aborted.reply,
        eq(&TcReply::CandidateAborted { notified: 1 })
    );
    assert_that!(keys(&app, DatastoreVersion::Candidate).is_empty(), eq(true));
}

#[rstest]
fn configuration_waits_for_the_commit_cycle_but_reads_do_not() {
    let app = app();
    let config = open_session(&app);
    let _ = create_controller(&app, config, "c1");
    let started = tc(
        &app,
        TcCall::CommitTransactionStart {
            session: SESSION,
            config,
        },
    );
    assert_that!(started.result, eq(ResultCode::Success));

    let blocked = create_controller(&app, config, "c2");
    assert_that!(blocked.result_code(), eq(ResultCode::OperationNotAllowed));

    let read = send(
        &app,
        keyed(
            config,
            Operation::Read,
            DatastoreVersion::Candidate,
            TopoKey::controller("c1"),
            None,
        ),
    );
    assert_that!(read.result_code(), eq(ResultCode::Success));
    assert_that!(
        &read.body,
        eq(&ResponseBody::Rows(rows(&app, DatastoreVersion::Candidate)))
    );

    let cancelled = tc(
        &app,
        TcCall::AbortTransaction {
            session: SESSION,
            config,
            marker: TcAbortMarker::Start,
        },
    );
    assert_that!(cancelled.result, eq(ResultCode::Success));
    let retried = create_controller(&app, config, "c2");
    assert_that!(retried.result_code(), eq(ResultCode::Success));
}

#[rstest]
fn concurrent_configuration_requests_never_overlap() {
    let app = Arc::new(app());
    let config = open_session(&app);
    let start = Arc::new(Barrier::new(8));
    let writers = (0..8)
        .map(|index| {
            let app = Arc::clone(&app);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let _ = start.wait();
                create_controller(&app, config, &format!("c{index}")).result_code()
            })
        })
        .collect::<Vec<_>>();
    let codes = writers
        .into_iter()
        .map(|writer| writer.join().expect("writer should not panic"))
        .collect::<Vec<_>>();

    let accepted = codes
        .iter()
        .filter(|code| **code == ResultCode::Success)
        .count();
    let busy = codes
        .iter()
        .filter(|code| **code == ResultCode::OperationNotAllowed)
        .count();
    assert_that!(accepted + busy, eq(8_usize));
    assert_that!(accepted >= 1, eq(true));
    assert_that!(rows(&app, DatastoreVersion::Candidate).len(), eq(accepted));
}

#[rstest]
#[case::unknown_session(99, None, ResultCode::InvalidSessionId)]
#[case::stale_config(SESSION, Some(1000), ResultCode::InvalidConfigId)]
fn configuration_requires_the_granted_session(
    #[case] session: SessionId,
    #[case] config_override: Option<ConfigId>,
    #[case] expected: ResultCode,
) {
    let app = app();
    let granted = open_session(&app);
    let mut request = keyed(
        config_override.unwrap_or(granted),
        Operation::Create,
        DatastoreVersion::Candidate,
        TopoKey::controller("c1"),
        Some(controller_value()),
    );
    request.header.session_id = session;

    let response = send(&app, request);
    assert_that!(response.result_code(), eq(expected));
    assert_that!(rows(&app, DatastoreVersion::Candidate).is_empty(), eq(true));
}

#[rstest]
fn standby_serves_reads_only() {
    let app = CoordinatorApp::new(RuntimeConfig {
        role: NodeRole::Standby,
        ..test_config()
    })
    .expect("app should start");
    let config = open_session(&app);

    let created = create_controller(&app, config, "c1");
    assert_that!(created.result_code(), eq(ResultCode::OperationNotAllowed));
    let started = tc(
        &app,
        TcCall::CommitTransactionStart {
            session: SESSION,
            config,
        },
    );
    assert_that!(started.result, eq(ResultCode::OperationNotAllowed));

    let read = send(
        &app,
        keyed(
            config,
            Operation::ReadSiblingCount,
            DatastoreVersion::Running,
            TopoKey::controller("c1"),
            None,
        ),
    );
    assert_that!(read.result_code(), eq(ResultCode::Success));
    assert_that!(&read.body, eq(&ResponseBody::Count(0)));
}

#[rstest]
fn failed_copy_into_running_marks_the_commit_degraded() {
    let app = app();
    let config = open_session(&app);
    let _ = create_controller(&app, config, "c1");
    app.storage
        .datastore
        .inject_fault(FaultPoint::CommitCandidate)
        .expect("fault should arm");

    let replies = commit_cycle(&app, config);
    assert_that!(
        replies.last().map(|reply| reply.result),
        eq(Some(ResultCode::DbAccess))
    );
    let status = app.status().expect("status is readable");
    assert_that!(status.phase, eq(TransactionPhase::End));
    assert_that!(status.last_commit_degraded, eq(true));
    assert_that!(keys(&app, DatastoreVersion::Running).is_empty(), eq(true));

    let retried = commit_cycle(&app, config);
    assert_that!(
        retried.last().map(|reply| reply.result),
        eq(Some(ResultCode::Success))
    );
    assert_that!(
        &app.status().map(|status| status.last_commit_degraded),
        eq(&Ok(false))
    );
}

#[rstest]
fn startup_load_stops_at_failed_step_and_can_be_rerun() {
    let app = app();
    let startup = Row::applied(TopoKey::controller("c1"), controller_value())
        .expect("controller key and value match");
    app.storage
        .datastore
        .put(DatastoreVersion::Startup, startup)
        .expect("startup accepts writes");
    app.storage
        .datastore
        .inject_fault(FaultPoint::Clear(DatastoreVersion::Running))
        .expect("fault should arm");

    let failed = app.boot();
    assert_that!(matches!(failed, Err(TopoError::DbAccess(_))), eq(true));
    assert_that!(
        &keys(&app, DatastoreVersion::Candidate),
        eq(&vec![TopoKey::controller("c1")])
    );
    assert_that!(keys(&app, DatastoreVersion::Running).is_empty(), eq(true));

    assert_that!(&app.boot(), eq(&Ok(())));
    assert_that!(
        &keys(&app, DatastoreVersion::Running),
        eq(&vec![TopoKey::controller("c1")])
    );
}

#[rstest]
fn finalize_drains_and_rejects_later_work() {
    let app = app();
    let config = open_session(&app);
    assert_that!(&app.shutdown(), eq(&Ok(())));
    assert_that!(&app.shutdown(), eq(&Ok(())));

    let read = send(
        &app,
        keyed(
            config,
            Operation::ReadBulk,
            DatastoreVersion::Running,
            TopoKey::controller("c1"),
            None,
        ),
    );
    assert_that!(read.result_code(), eq(ResultCode::OperationNotAllowed));
    let status = app.status().expect("status is readable");
    assert_that!(status.shutting_down, eq(true));
    assert_that!(status.read_connections_in_use, eq(0_usize));
}
