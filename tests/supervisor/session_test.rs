use std::time::Duration;

use decoder_supervisor::bus::{BusMessage, EventBus};
use decoder_supervisor::process::{ProcessState, SpawnError, StageSpec};
use decoder_supervisor::supervisor::{
    PipelineSession, SessionSettings, SessionState, SupervisorError,
};

use crate::common::{marked_sleeper, pid_exists, pids_with_arg, sh, ticker, within};

fn settings() -> SessionSettings {
    SessionSettings {
        grace_period: Duration::from_millis(500),
        reap_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn two_stage_pipeline_stops_in_reverse_order() {
    let bus = EventBus::new(64);
    let mut subscription = bus.subscribe();
    let stages = vec![
        ticker("capture", "frame"),
        StageSpec::new("filter", "cat").piped(),
    ];

    let session = within(PipelineSession::start("pager", &stages, bus, settings()))
        .await
        .unwrap();

    let status = session.status();
    assert_eq!(status.state, SessionState::Active);
    assert_eq!(status.stages.len(), 2);
    assert!(status
        .stages
        .iter()
        .all(|stage| stage.state == ProcessState::Running && stage.pid.is_some()));

    // Output only comes from the last stage.
    match within(subscription.recv()).await {
        Some(BusMessage::Line(event)) => {
            assert_eq!(event.stage_id, "filter");
            assert_eq!(event.raw_line, "frame");
        }
        other => panic!("expected a line, got {other:?}"),
    }

    let report = within(session.stop(Duration::from_millis(500)))
        .await
        .unwrap();

    assert_eq!(report.state, SessionState::Stopped);
    assert_eq!(report.stage_ids(), vec!["filter", "capture"]);
    for pid in report.pids() {
        assert!(!pid_exists(pid), "pid {pid} still exists");
    }

    let status = session.status();
    assert_eq!(status.state, SessionState::Stopped);
    assert!(status
        .stages
        .iter()
        .all(|stage| stage.state == ProcessState::Reaped));
}

#[tokio::test]
async fn stop_twice_returns_same_report() {
    let session = within(PipelineSession::start(
        "adsb",
        &[ticker("receiver", "*8d4840d6;")],
        EventBus::default(),
        settings(),
    ))
    .await
    .unwrap();

    let first = within(session.stop(Duration::from_millis(500))).await.unwrap();
    let second = within(session.stop(Duration::from_millis(500))).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn second_stage_spawn_failure_cleans_up_first() {
    let (capture, marker) = marked_sleeper("capture", 1);
    let stages = vec![
        capture,
        StageSpec::new("decoder", "no-such-multimon-build").piped(),
    ];

    let err = within(PipelineSession::start(
        "pager",
        &stages,
        EventBus::default(),
        settings(),
    ))
    .await
    .unwrap_err();

    match err {
        SupervisorError::Spawn { decoder, stage, source } => {
            assert_eq!(decoder, "pager");
            assert_eq!(stage, "decoder");
            assert!(matches!(source, SpawnError::NotFound { .. }));
        }
        other => panic!("expected spawn error, got {other:?}"),
    }

    // The first stage was spawned, so it must have been killed and reaped.
    assert_eq!(pids_with_arg(&marker), Vec::<u32>::new());
}

#[tokio::test]
async fn empty_pipeline_is_rejected() {
    let err = PipelineSession::start("adsb", &[], EventBus::default(), settings())
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidPipeline { .. }));
}

#[tokio::test]
async fn stage_exiting_on_its_own_fails_the_session() {
    let bus = EventBus::new(64);
    let mut subscription = bus.subscribe();
    let stages = vec![
        sh("scanner", "echo found; sleep 0.3"),
        ticker("livemon", "burst"),
    ];

    let session = within(PipelineSession::start("gsm", &stages, bus, settings()))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Active);

    let mut status_rx = session.watch_status();
    let failed = within(status_rx.wait_for(|status| status.state.is_terminal()))
        .await
        .unwrap()
        .clone();

    assert_eq!(failed.state, SessionState::Failed);
    assert!(failed.error.as_deref().unwrap_or_default().contains("scanner"));
    assert!(failed
        .stages
        .iter()
        .all(|stage| stage.state == ProcessState::Reaped));
    for stage in &failed.stages {
        assert!(!pid_exists(stage.pid.unwrap()));
    }

    // The terminal message follows the lines.
    let ended = within(async {
        loop {
            match subscription.recv().await {
                Some(message) if message.is_terminal() => break message,
                Some(_) => {}
                None => panic!("bus closed"),
            }
        }
    })
    .await;
    match ended {
        BusMessage::SessionEnded { decoder_name, state, reason, .. } => {
            assert_eq!(decoder_name, "gsm");
            assert_eq!(state, SessionState::Failed);
            assert!(reason.is_some());
        }
        BusMessage::Line(_) => unreachable!(),
    }
}

#[tokio::test]
async fn stubborn_stage_is_force_killed_within_grace() {
    let stages = vec![
        sh("stubborn", "trap '' TERM; while :; do echo still here; sleep 0.05; done"),
        sh("polite", "trap 'exit 0' TERM; while :; do echo ok; sleep 0.05; done"),
    ];
    let session = within(PipelineSession::start("bluetooth", &stages, EventBus::default(), settings()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let report = within(session.stop(Duration::from_millis(300)))
        .await
        .unwrap();

    let stubborn = report
        .killed
        .iter()
        .find(|reaped| reaped.stage_id == "stubborn")
        .unwrap();
    let polite = report
        .killed
        .iter()
        .find(|reaped| reaped.stage_id == "polite")
        .unwrap();

    assert!(stubborn.exit.forced);
    assert_eq!(stubborn.exit.signal, Some(9));
    assert!(!polite.exit.forced);
    assert_eq!(polite.exit.code, Some(0));
    assert_ne!(stubborn.exit, polite.exit);
}

#[tokio::test]
async fn failing_session_is_not_active_during_teardown() {
    let stages = vec![
        sh("scanner", "sleep 0.2"),
        sh("stubborn", "trap '' TERM; while :; do echo still here; sleep 0.05; done"),
    ];
    let slow_teardown = SessionSettings {
        grace_period: Duration::from_secs(2),
        reap_timeout: Duration::from_secs(2),
    };
    let session = within(PipelineSession::start("gsm", &stages, EventBus::default(), slow_teardown))
        .await
        .unwrap();

    let mut status_rx = session.watch_status();
    within(status_rx.wait_for(|status| status.state != SessionState::Active))
        .await
        .unwrap();
    // Well inside the stubborn stage's grace period.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let dying = session.status();
    assert_eq!(dying.state, SessionState::Stopping);
    assert!(dying.error.as_deref().unwrap_or_default().contains("scanner"));
    assert!(dying
        .stages
        .iter()
        .all(|stage| stage.state != ProcessState::Running));

    let ended = within(status_rx.wait_for(|status| status.state.is_terminal()))
        .await
        .unwrap()
        .clone();
    assert_eq!(ended.state, SessionState::Failed);
    let stubborn = ended.stages.iter().find(|stage| stage.id == "stubborn").unwrap();
    assert!(stubborn.exit.unwrap().forced);
}

#[tokio::test]
async fn dead_piped_stage_fails_the_session() {
    // The filter ignores stdin EOF, so only polling notices the dead stage.
    let stages = vec![
        sh("tuner", "sleep 0.2"),
        sh("filter", "while :; do echo idle; sleep 0.05; done").piped(),
    ];
    let session = within(PipelineSession::start("pager", &stages, EventBus::default(), settings()))
        .await
        .unwrap();

    let mut status_rx = session.watch_status();
    let ended = within(status_rx.wait_for(|status| status.state.is_terminal()))
        .await
        .unwrap()
        .clone();

    assert_eq!(ended.state, SessionState::Failed);
    assert!(ended.error.as_deref().unwrap_or_default().contains("tuner"));
    for stage in &ended.stages {
        assert_eq!(stage.state, ProcessState::Reaped);
        assert!(!pid_exists(stage.pid.unwrap()));
    }
}

#[tokio::test]
async fn stage_gone_at_startup_fails_start() {
    let stages = vec![
        StageSpec::new("oneshot", "true"),
        ticker("monitor", "tick"),
    ];

    // `true` may or may not have exited by the liveness check; either the
    // start fails or the session fails shortly after.
    match PipelineSession::start("adsb", &stages, EventBus::default(), settings()).await {
        Err(err) => assert!(matches!(err, SupervisorError::StageExited { ref stage, .. } if stage == "oneshot")),
        Ok(session) => {
            let mut status_rx = session.watch_status();
            let status = within(status_rx.wait_for(|status| status.state.is_terminal()))
                .await
                .unwrap()
                .clone();
            assert_eq!(status.state, SessionState::Failed);
        }
    }
}
