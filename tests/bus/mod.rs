//! Event bus tests.

use std::time::Duration;

use decoder_supervisor::bus::{BusMessage, DecodedEvent, EventBus};
use decoder_supervisor::supervisor::SessionState;
use futures_util::StreamExt;

use crate::common::within;

fn line(decoder: &str, n: usize) -> BusMessage {
    BusMessage::Line(DecodedEvent::new(decoder, "decoder", format!("msg {n}")))
}

#[tokio::test]
async fn slow_subscriber_keeps_only_most_recent() {
    let bus = EventBus::new(8);
    let mut slow = bus.subscribe();
    let mut fast = bus.subscribe();

    for n in 0..20 {
        bus.publish(line("pager", n));
        // The fast subscriber keeps up.
        assert!(fast.try_recv().is_some());
    }

    let mut seen = Vec::new();
    while let Some(BusMessage::Line(event)) = slow.try_recv() {
        seen.push(event.raw_line);
    }

    let expected: Vec<String> = (12..20).map(|n| format!("msg {n}")).collect();
    assert_eq!(seen, expected);
    assert_eq!(slow.dropped(), 12);
    assert_eq!(fast.dropped(), 0);
}

#[tokio::test]
async fn publish_never_blocks_without_readers() {
    let bus = EventBus::new(2);
    let _idle = bus.subscribe();

    within(async {
        for n in 0..10_000 {
            bus.publish(line("adsb", n));
        }
    })
    .await;
}

#[tokio::test]
async fn stream_yields_in_publish_order() {
    let bus = EventBus::new(16);
    let stream = bus.subscribe().into_stream();

    let publisher = bus.clone();
    tokio::spawn(async move {
        for n in 0..3 {
            publisher.publish(line("pager", n));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        publisher.publish(BusMessage::session_ended("pager", SessionState::Stopped, None));
    });

    let messages: Vec<BusMessage> = within(
        stream
            .take_while(|message| {
                let terminal = message.is_terminal();
                async move { !terminal }
            })
            .collect(),
    )
    .await;

    let lines: Vec<String> = messages
        .into_iter()
        .filter_map(|message| match message {
            BusMessage::Line(event) => Some(event.raw_line),
            BusMessage::SessionEnded { .. } => None,
        })
        .collect();
    assert_eq!(lines, vec!["msg 0", "msg 1", "msg 2"]);
}

#[test]
fn unsubscribe_reduces_count() {
    let bus = EventBus::new(4);
    let first = bus.subscribe();
    let _second = bus.subscribe();
    assert_eq!(bus.subscriber_count(), 2);

    bus.unsubscribe(first);
    assert_eq!(bus.subscriber_count(), 1);
}
