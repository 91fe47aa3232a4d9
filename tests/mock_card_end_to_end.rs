//! End-to-end tests driving a [`k8090::Driver`] against the in-process mock
//! card, exercising the scenarios the protocol engine is designed around:
//! connect handshake, timer round-trips with coalesced expiry, opposite
//! cancellation converging relay state, and the retry/disconnect path.

use std::sync::mpsc;
use std::time::Duration;

use k8090::engine::Event;
use k8090::transport::MOCK_PORT_NAME;
use k8090::{Driver, EngineSettings, EventSink, RelaySet};

struct ChannelSink(mpsc::Sender<Event>);

impl EventSink for ChannelSink {
    fn handle(&self, event: Event) {
        let _ = self.0.send(event);
    }
}

fn new_driver(settings: EngineSettings) -> (Driver, mpsc::Receiver<Event>) {
    let _ = env_logger::try_init();
    let (tx, rx) = mpsc::channel();
    let driver = Driver::new(Box::new(ChannelSink(tx)), settings);
    (driver, rx)
}

fn wait_for<F: Fn(&Event) -> bool>(rx: &mpsc::Receiver<Event>, timeout: Duration, pred: F) -> Option<Event> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match rx.recv_timeout(remaining) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

#[test]
fn connect_runs_seed_queries_and_reports_firmware() {
    let (driver, rx) = new_driver(EngineSettings::default());
    driver.connect(MOCK_PORT_NAME);

    // The firmware response is what triggers Connected, and arrives first.
    let firmware = wait_for(&rx, Duration::from_secs(2), |e| matches!(e, Event::FirmwareVersion { .. }));
    match firmware {
        Some(Event::FirmwareVersion { year, week }) => {
            assert_eq!(year, 2018);
            assert_eq!(week, 26);
        }
        other => panic!("expected a FirmwareVersion event, got {other:?}"),
    }

    let connected = wait_for(&rx, Duration::from_secs(2), |e| matches!(e, Event::Connected));
    assert!(connected.is_some(), "expected a Connected event right after the firmware response");
}

#[test]
fn switch_on_then_overlapping_switch_off_converges_to_the_difference() {
    let (driver, rx) = new_driver(EngineSettings::default());
    driver.connect(MOCK_PORT_NAME);
    assert!(wait_for(&rx, Duration::from_secs(2), |e| matches!(e, Event::Connected)).is_some());

    driver.switch_on(RelaySet::relay(1) | RelaySet::relay(2) | RelaySet::relay(3));
    driver.switch_off(RelaySet::relay(2) | RelaySet::relay(3) | RelaySet::relay(4));
    driver.query_relay_status();

    // Whether or not the queue merges the two commands before either reaches
    // the wire, applying them in enqueue order converges on the same relay
    // state: only relay 1 ends up on.
    let status = wait_for(&rx, Duration::from_secs(2), |e| {
        matches!(e, Event::RelayStatus { .. })
    });
    let mut last_status = status;
    while let Some(next) = wait_for(&rx, Duration::from_millis(200), |e| matches!(e, Event::RelayStatus { .. })) {
        last_status = Some(next);
    }
    match last_status {
        Some(Event::RelayStatus { current, .. }) => assert_eq!(current, RelaySet::relay(1)),
        other => panic!("expected a RelayStatus event, got {other:?}"),
    }
}

#[test]
fn start_timer_fires_relay_off_after_expiry() {
    let (driver, rx) = new_driver(EngineSettings::default());
    driver.connect(MOCK_PORT_NAME);
    assert!(wait_for(&rx, Duration::from_secs(2), |e| matches!(e, Event::Connected)).is_some());

    driver.set_timer_delay(RelaySet::relay(5), 1);
    driver.start_timer(RelaySet::relay(5), 0); // 0 => use the stored default (1s)

    let switched_on = wait_for(&rx, Duration::from_secs(2), |e| {
        matches!(e, Event::RelayStatus { current, .. } if current.contains(5))
    });
    assert!(switched_on.is_some(), "expected relay 5 to switch on first");

    let switched_off = wait_for(&rx, Duration::from_secs(3), |e| {
        matches!(e, Event::RelayStatus { current, .. } if !current.contains(5))
    });
    assert!(switched_off.is_some(), "expected relay 5 to switch off once its timer expires");
}

#[test]
fn coalesced_timers_emit_a_single_relay_status() {
    let (driver, rx) = new_driver(EngineSettings::default());
    driver.connect(MOCK_PORT_NAME);
    assert!(wait_for(&rx, Duration::from_secs(2), |e| matches!(e, Event::Connected)).is_some());

    let relays = RelaySet::relay(1) | RelaySet::relay(2);
    driver.start_timer(relays, 1);

    let on = wait_for(&rx, Duration::from_secs(2), |e| {
        matches!(e, Event::RelayStatus { current, .. } if *current == relays)
    });
    assert!(on.is_some(), "expected both relays to switch on together");

    let off = wait_for(&rx, Duration::from_secs(3), |e| {
        matches!(e, Event::RelayStatus { previous, current, .. } if *previous == relays && current.is_empty())
    });
    assert!(off.is_some(), "expected a single coalesced RelayStatus turning both relays off");
}

#[test]
fn exhausting_retries_after_link_loss_reports_connection_failed() {
    let mut settings = EngineSettings::default();
    settings.failure_delay = Duration::from_millis(20);
    settings.max_failures = 2;
    let (driver, rx) = new_driver(settings);
    driver.connect(MOCK_PORT_NAME);
    assert!(wait_for(&rx, Duration::from_secs(2), |e| matches!(e, Event::Connected)).is_some());

    driver.query_relay_status();
    // Sever the link right after the command is written but before any
    // response can arrive, forcing the failure-timer retry path and then a
    // write failure on the retry attempt.
    driver.transport().close();

    let failed = wait_for(&rx, Duration::from_secs(2), |e| matches!(e, Event::ConnectionFailed));
    assert!(failed.is_some(), "expected ConnectionFailed once the retry budget is exhausted");
    assert!(!driver.is_connected());
}

#[test]
fn enqueue_while_disconnected_reports_not_connected() {
    let (driver, rx) = new_driver(EngineSettings::default());
    driver.query_relay_status();
    let not_connected = wait_for(&rx, Duration::from_millis(500), |e| matches!(e, Event::NotConnected));
    assert!(not_connected.is_some());
}

#[test]
fn remaining_timer_query_keeps_its_delay_type_across_trailing_frames() {
    // A single QueryTimer(mask=ALL) elicits up to eight Timer response
    // frames, trickled in over several chunked deliveries. By the time the
    // later frames arrive the in-flight command has typically already moved
    // on to whatever was queued behind it; every frame must still be
    // reported as "remaining", never misclassified as "total" just because
    // an unrelated command became in-flight in the meantime.
    let (driver, rx) = new_driver(EngineSettings::default());
    driver.connect(MOCK_PORT_NAME);
    assert!(wait_for(&rx, Duration::from_secs(2), |e| matches!(e, Event::Connected)).is_some());

    driver.query_remaining_timer_delay(RelaySet::ALL);
    driver.query_jumper_status();

    let mut remaining_count = 0;
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok(Event::RemainingTimerDelay { .. }) => remaining_count += 1,
            Ok(Event::TotalTimerDelay { relay, seconds }) => {
                panic!("got a TotalTimerDelay({relay}, {seconds}) from a remaining-delay query")
            }
            Ok(Event::JumperStatus { .. }) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    assert_eq!(remaining_count, 8, "expected one RemainingTimerDelay per relay");
}
