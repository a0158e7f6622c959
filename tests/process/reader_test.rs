use std::process::Stdio;
use std::time::Duration;

use decoder_supervisor::bus::{BusMessage, EventBus};
use decoder_supervisor::process::{LineReader, ProcessHandle};

use crate::common::{sh, within};

fn lines_of(messages: Vec<BusMessage>) -> Vec<String> {
    messages
        .into_iter()
        .map(|message| match message {
            BusMessage::Line(event) => event.raw_line,
            other => panic!("unexpected message: {other:?}"),
        })
        .collect()
}

#[tokio::test]
async fn reads_process_output_until_exit() {
    let bus = EventBus::new(64);
    let mut subscription = bus.subscribe();

    let spec = sh(
        "decoder",
        r"printf 'POCSAG1200: Address: 1234567\r\n\nFLEX: 929.6125\nno newline'",
    );
    let mut handle = ProcessHandle::spawn(&spec, Stdio::null()).unwrap();
    let stdout = handle.take_stdout().unwrap();

    let count = within(LineReader::new("pager", "decoder", stdout, bus.clone()).run())
        .await
        .unwrap();
    assert_eq!(count, 2);

    let mut received = Vec::new();
    while let Some(message) = subscription.try_recv() {
        assert_eq!(message.decoder_name(), "pager");
        received.push(message);
    }
    assert_eq!(
        lines_of(received),
        vec!["POCSAG1200: Address: 1234567", "FLEX: 929.6125"]
    );

    within(handle.reap(Duration::from_secs(1))).await.unwrap();
}

#[tokio::test]
async fn tags_events_with_stage() {
    let bus = EventBus::new(8);
    let mut subscription = bus.subscribe();

    let mut handle = ProcessHandle::spawn(&sh("monitor", "echo tmsi=0x1a2b"), Stdio::null()).unwrap();
    let stdout = handle.take_stdout().unwrap();
    within(LineReader::new("gsm", "monitor", stdout, bus.clone()).run())
        .await
        .unwrap();

    match subscription.try_recv() {
        Some(BusMessage::Line(event)) => {
            assert_eq!(event.decoder_name, "gsm");
            assert_eq!(event.stage_id, "monitor");
            assert_eq!(event.raw_line, "tmsi=0x1a2b");
        }
        other => panic!("expected a line, got {other:?}"),
    }

    within(handle.reap(Duration::from_secs(1))).await.unwrap();
}

#[tokio::test]
async fn returns_when_process_is_killed() {
    let bus = EventBus::new(8);
    let mut handle = ProcessHandle::spawn(&sh("capture", "echo ready; exec sleep 30"), Stdio::null()).unwrap();
    let stdout = handle.take_stdout().unwrap();
    let reader = tokio::spawn(LineReader::new("pager", "capture", stdout, bus).run());

    tokio::time::sleep(Duration::from_millis(100)).await;
    within(handle.request_stop(Duration::from_secs(1))).await.unwrap();

    let count = within(reader).await.unwrap().unwrap();
    assert_eq!(count, 1);
    within(handle.reap(Duration::from_secs(1))).await.unwrap();
}
