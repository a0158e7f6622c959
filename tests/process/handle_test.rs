use std::process::Stdio;
use std::time::{Duration, Instant};

use decoder_supervisor::process::{ProcessHandle, ProcessState, SpawnError, StageSpec};

use crate::common::{pid_exists, pid_running, sh, within};

#[tokio::test]
async fn spawn_missing_executable_reports_not_found() {
    let spec = StageSpec::new("capture", "no-such-sdr-tool-on-this-host");
    let err = ProcessHandle::spawn(&spec, Stdio::null()).unwrap_err();

    assert!(matches!(err, SpawnError::NotFound { ref command } if command == "no-such-sdr-tool-on-this-host"));
}

#[tokio::test]
async fn graceful_stop_exits_on_sigterm() {
    let spec = sh("monitor", "trap 'exit 0' TERM; while :; do sleep 0.05; done");
    let mut handle = ProcessHandle::spawn(&spec, Stdio::null()).unwrap();
    let pid = handle.pid().unwrap();
    assert_eq!(handle.state(), ProcessState::Running);
    assert!(handle.is_alive());
    tokio::time::sleep(Duration::from_millis(100)).await;

    within(handle.request_stop(Duration::from_secs(5))).await.unwrap();
    assert_eq!(handle.state(), ProcessState::Exited);

    let reaped = within(handle.reap(Duration::from_secs(2))).await.unwrap();
    assert_eq!(reaped.stage_id, "monitor");
    assert_eq!(reaped.pid, Some(pid));
    assert_eq!(reaped.exit.code, Some(0));
    assert!(!reaped.exit.forced);
    assert!(!pid_exists(pid));
}

#[tokio::test]
async fn stage_ignoring_sigterm_is_force_killed() {
    let spec = sh("stubborn", "trap '' TERM; while :; do sleep 0.05; done");
    let mut handle = ProcessHandle::spawn(&spec, Stdio::null()).unwrap();
    let pid = handle.pid().unwrap();

    // Give the shell time to install its trap.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    within(handle.request_stop(Duration::from_millis(300)))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));

    let reaped = within(handle.reap(Duration::from_secs(2))).await.unwrap();
    assert!(reaped.exit.forced);
    assert_eq!(reaped.exit.signal, Some(9));
    assert_eq!(reaped.exit.code, None);
    assert!(!pid_exists(pid));
}

#[tokio::test]
async fn reap_after_natural_exit_keeps_exit_code() {
    let spec = sh("oneshot", "exit 3");
    let mut handle = ProcessHandle::spawn(&spec, Stdio::null()).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!handle.is_alive());
    assert_eq!(handle.state(), ProcessState::Exited);

    let reaped = within(handle.reap(Duration::from_secs(1))).await.unwrap();
    assert_eq!(reaped.exit.code, Some(3));
    assert_eq!(reaped.exit.describe(), "exit 3");
}

#[tokio::test]
async fn reap_kills_a_stage_that_was_never_stopped() {
    let spec = StageSpec::new("sleeper", "sleep").arg("30");
    let handle = ProcessHandle::spawn(&spec, Stdio::null()).unwrap();
    let pid = handle.pid().unwrap();

    let reaped = within(handle.reap(Duration::from_millis(200))).await.unwrap();
    assert!(reaped.exit.forced);
    assert!(!pid_exists(pid));
}

#[tokio::test]
async fn stop_reaches_forked_children() {
    // The shell forks `sleep`; the whole group must be gone afterwards.
    let spec = sh("forker", "sleep 30 & echo $!; wait");
    let mut handle = ProcessHandle::spawn(&spec, Stdio::null()).unwrap();

    let mut stdout = handle.take_stdout().unwrap();
    let mut buf = Vec::new();
    within(async {
        use tokio::io::AsyncReadExt;
        let mut byte = [0u8; 1];
        while stdout.read(&mut byte).await.unwrap() == 1 && byte[0] != b'\n' {
            buf.push(byte[0]);
        }
    })
    .await;
    let child_pid: u32 = String::from_utf8(buf).unwrap().trim().parse().unwrap();
    assert!(pid_running(child_pid));

    within(handle.request_stop(Duration::from_secs(2))).await.unwrap();
    within(handle.reap(Duration::from_secs(2))).await.unwrap();

    within(async {
        while pid_running(child_pid) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn piped_stdout_feeds_next_stage() {
    let producer = StageSpec::new("producer", "echo").arg("hello");
    let consumer = StageSpec::new("consumer", "cat").piped();

    let mut first = ProcessHandle::spawn(&producer, Stdio::null()).unwrap();
    let stdin: Stdio = first.take_stdout().unwrap().try_into().unwrap();
    let mut second = ProcessHandle::spawn(&consumer, stdin).unwrap();

    let mut out = String::new();
    {
        use tokio::io::AsyncReadExt;
        let mut stdout = second.take_stdout().unwrap();
        within(stdout.read_to_string(&mut out)).await.unwrap();
    }
    assert_eq!(out, "hello\n");

    within(second.reap(Duration::from_secs(1))).await.unwrap();
    within(first.reap(Duration::from_secs(1))).await.unwrap();
}
