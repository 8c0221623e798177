mod common;

use common::MockTransport;
use printlink_communication::{
    Instruction, LineRouter, QueueConfig, SerialQueue, StallWatchdog, Transport, WatchdogConfig,
    WatchdogState,
};
use printlink_core::EventBus;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(50);

fn setup() -> (StallWatchdog, Arc<SerialQueue>, Arc<MockTransport>) {
    let transport = MockTransport::new();
    let queue = SerialQueue::new(
        QueueConfig::default(),
        transport.clone(),
        Arc::new(LineRouter::new()),
        Arc::new(EventBus::new()),
    );
    let watchdog = StallWatchdog::new(
        WatchdogConfig {
            timeout: TIMEOUT,
            check_interval: Duration::from_millis(10),
            max_stalls: 2,
        },
        queue.clone(),
        transport.clone(),
    );
    (watchdog, queue, transport)
}

fn outlast_timeout() {
    thread::sleep(TIMEOUT + Duration::from_millis(30));
}

#[test]
fn test_idle_queue_is_healthy() {
    let (watchdog, _, _) = setup();
    outlast_timeout();
    assert_eq!(watchdog.check(), WatchdogState::Healthy);
}

#[test]
fn test_stall_resends_in_flight() {
    let (watchdog, queue, transport) = setup();
    queue.enqueue(Instruction::plain("M105").unwrap(), false);
    outlast_timeout();

    assert_eq!(watchdog.check(), WatchdogState::Stalled(1));
    assert_eq!(transport.written(), vec!["M105\n", "M105\n"]);
    assert_eq!(watchdog.check(), WatchdogState::Healthy);
}

#[test]
fn test_confirmation_resets_stalls() {
    let (watchdog, queue, _) = setup();
    queue.enqueue(Instruction::plain("M105").unwrap(), false);
    queue.enqueue(Instruction::plain("M114").unwrap(), false);
    outlast_timeout();
    assert_eq!(watchdog.check(), WatchdogState::Stalled(1));

    queue.confirm(false);
    outlast_timeout();
    assert_eq!(watchdog.check(), WatchdogState::Stalled(1));
}

#[test]
fn test_repeated_stalls_fail_communication() {
    let (watchdog, queue, transport) = setup();
    queue.enqueue(Instruction::plain("M105").unwrap(), false);

    for expected in [WatchdogState::Stalled(1), WatchdogState::Stalled(2)] {
        outlast_timeout();
        assert_eq!(watchdog.check(), expected);
    }
    outlast_timeout();
    assert_eq!(watchdog.check(), WatchdogState::Failed);
    assert!(!transport.is_open());
    assert!(queue.has_failed());
}

#[test]
fn test_resend_keeps_stall_count() {
    let (_, queue, transport) = setup();
    queue.enqueue(Instruction::plain("M105").unwrap(), false);

    assert_eq!(queue.record_stall(), 1);
    assert_eq!(queue.record_stall(), 2);
    assert_eq!(transport.write_count(), 3);

    // Firmware chatter proves it is still listening
    queue.renew_timeout();
    assert_eq!(queue.record_stall(), 1);
}

#[test]
fn test_chatter_keeps_plain_instruction_alive() {
    let (watchdog, queue, _) = setup();
    queue.enqueue(Instruction::plain("G28").unwrap(), false);
    outlast_timeout();
    queue.renew_timeout();
    assert_eq!(watchdog.check(), WatchdogState::Healthy);
}

#[test]
fn test_strict_timeout_ignores_chatter() {
    let (watchdog, queue, _) = setup();
    queue.enqueue(
        Instruction::plain("M603").unwrap().with_strict_timeout(),
        false,
    );
    outlast_timeout();
    queue.renew_timeout();
    assert_eq!(watchdog.check(), WatchdogState::Stalled(1));
}

#[tokio::test]
async fn test_periodic_check() {
    let (watchdog, queue, transport) = setup();
    watchdog.start().await.unwrap();
    assert!(watchdog.start().await.is_err());

    queue.enqueue(Instruction::plain("M105").unwrap(), false);
    tokio::time::sleep(Duration::from_millis(500)).await;
    watchdog.stop().await;

    assert_eq!(watchdog.state(), WatchdogState::Failed);
    assert!(queue.has_failed());
    assert!(!transport.is_open());
}
