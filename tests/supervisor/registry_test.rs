use std::sync::Arc;
use std::time::Duration;

use decoder_supervisor::bus::EventBus;
use decoder_supervisor::process::{ProcessState, StageSpec};
use decoder_supervisor::supervisor::{
    SessionSettings, SessionState, StopOutcome, SupervisorError, SupervisorRegistry,
};

use crate::common::{marked_sleeper, pid_exists, pids_with_arg, sh, ticker, within};

const GRACE: Duration = Duration::from_millis(500);

fn registry() -> Arc<SupervisorRegistry> {
    Arc::new(SupervisorRegistry::new(
        EventBus::new(64),
        SessionSettings {
            grace_period: GRACE,
            reap_timeout: Duration::from_secs(2),
        },
    ))
}

#[tokio::test]
async fn start_is_idempotent() {
    let registry = registry();
    let stages = [ticker("receiver", "frame")];

    let first = within(registry.start_decoder("adsb", &stages)).await.unwrap();
    let second = within(registry.start_decoder("adsb", &stages)).await.unwrap();

    assert!(!first.already_running);
    assert!(second.already_running);
    assert!(Arc::ptr_eq(&first.session, &second.session));
    assert_eq!(registry.list().len(), 1);

    within(registry.stop_decoder("adsb", GRACE)).await.unwrap();
}

#[tokio::test]
async fn concurrent_starts_share_one_session() {
    let registry = registry();
    let stages = vec![ticker("receiver", "frame")];

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let stages = stages.clone();
            tokio::spawn(async move { registry.start_decoder("adsb", &stages).await })
        })
        .collect();

    let mut sessions = Vec::new();
    for task in tasks {
        sessions.push(within(task).await.unwrap().unwrap().session);
    }

    assert!(sessions.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    within(registry.stop_decoder("adsb", GRACE)).await.unwrap();
}

#[tokio::test]
async fn stop_removes_session_and_reaps_everything() {
    let registry = registry();
    let stages = [
        ticker("capture", "iq"),
        StageSpec::new("decoder", "cat").piped(),
    ];
    within(registry.start_decoder("pager", &stages)).await.unwrap();

    let outcome = within(registry.stop_decoder("pager", GRACE)).await.unwrap();
    let StopOutcome::Stopped(report) = outcome else {
        panic!("expected the session to be stopped");
    };

    assert_eq!(report.killed.len(), 2);
    assert!(report.pids().into_iter().all(|pid| !pid_exists(pid)));
    assert!(registry.status("pager").is_none());

    let again = within(registry.stop_decoder("pager", GRACE)).await.unwrap();
    assert_eq!(again, StopOutcome::NotRunning);
}

#[tokio::test]
async fn failed_start_leaves_nothing_registered() {
    let registry = registry();
    let (capture, marker) = marked_sleeper("capture", 2);
    let stages = [
        capture,
        StageSpec::new("decoder", "no-such-multimon-build").piped(),
    ];

    let err = within(registry.start_decoder("pager", &stages))
        .await
        .unwrap_err();

    assert!(matches!(err, SupervisorError::Spawn { ref stage, .. } if stage == "decoder"));
    assert!(registry.status("pager").is_none());
    assert!(registry.list().is_empty());
    assert_eq!(pids_with_arg(&marker), Vec::<u32>::new());
}

#[tokio::test]
async fn failed_session_stays_visible_until_replaced() {
    let registry = registry();
    let short_lived = [sh("scanner", "echo found; sleep 0.2")];

    let started = within(registry.start_decoder("gsm", &short_lived))
        .await
        .unwrap();
    let mut status_rx = started.session.watch_status();
    within(status_rx.wait_for(|status| status.state.is_terminal()))
        .await
        .unwrap();

    let status = registry.status("gsm").unwrap();
    assert_eq!(status.state, SessionState::Failed);

    // A new start replaces the failed session.
    let restarted = within(registry.start_decoder("gsm", &[ticker("scanner", "again")]))
        .await
        .unwrap();
    assert!(!restarted.already_running);
    assert!(!Arc::ptr_eq(&started.session, &restarted.session));
    assert_eq!(registry.status("gsm").unwrap().state, SessionState::Active);

    within(registry.stop_decoder("gsm", GRACE)).await.unwrap();
}

#[tokio::test]
async fn start_waits_for_failing_session_to_finish() {
    let registry = Arc::new(SupervisorRegistry::new(
        EventBus::new(64),
        SessionSettings {
            grace_period: Duration::from_secs(1),
            reap_timeout: Duration::from_secs(2),
        },
    ));
    let dying = [
        sh("scanner", "sleep 0.2"),
        sh("stubborn", "trap '' TERM; while :; do sleep 0.05; done"),
    ];
    let started = within(registry.start_decoder("gsm", &dying)).await.unwrap();

    let mut status_rx = started.session.watch_status();
    within(status_rx.wait_for(|status| status.state != SessionState::Active))
        .await
        .unwrap();

    let restarted = within(registry.start_decoder("gsm", &[ticker("scanner", "again")]))
        .await
        .unwrap();

    assert!(!restarted.already_running);
    assert!(!Arc::ptr_eq(&started.session, &restarted.session));
    let old = started.session.status();
    assert_eq!(old.state, SessionState::Failed);
    assert!(old
        .stages
        .iter()
        .all(|stage| stage.state == ProcessState::Reaped));

    within(registry.stop_decoder("gsm", GRACE)).await.unwrap();
}

#[tokio::test]
async fn decoders_run_independently() {
    let registry = registry();
    within(registry.start_decoder("adsb", &[ticker("receiver", "a")]))
        .await
        .unwrap();
    within(registry.start_decoder("pager", &[ticker("capture", "p")]))
        .await
        .unwrap();

    within(registry.stop_decoder("adsb", GRACE)).await.unwrap();

    assert!(registry.status("adsb").is_none());
    assert_eq!(registry.status("pager").unwrap().state, SessionState::Active);

    within(registry.stop_decoder("pager", GRACE)).await.unwrap();
}

#[tokio::test]
async fn reset_all_stops_every_decoder() {
    let registry = registry();
    for name in ["adsb", "bluetooth", "pager"] {
        within(registry.start_decoder(name, &[ticker("main", name)]))
            .await
            .unwrap();
    }

    let results = within(registry.reset_all(GRACE)).await;

    let names: Vec<&str> = results.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["adsb", "bluetooth", "pager"]);
    assert!(results
        .iter()
        .all(|(_, result)| matches!(result, Ok(StopOutcome::Stopped(_)))));
    assert!(registry.list().is_empty());
}
