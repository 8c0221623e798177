mod common;

use common::MockTransport;
use printlink_communication::{Instruction, LinkConfig, PrinterLink, RecoveryConfig, Transport};
use printlink_core::{
    ConnectionEvent, EventFilter, LinkEvent, PrinterEvent, PrinterState, Source, StateEvent,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn link_with(config: LinkConfig) -> (PrinterLink, Arc<MockTransport>, Arc<Mutex<Vec<LinkEvent>>>) {
    let transport = MockTransport::new();
    let link = PrinterLink::with_transport(config, transport.clone());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    link.subscribe(EventFilter::All, move |event| sink.lock().unwrap().push(event));
    (link, transport, events)
}

fn link() -> (PrinterLink, Arc<MockTransport>, Arc<Mutex<Vec<LinkEvent>>>) {
    link_with(LinkConfig::default())
}

#[test]
fn test_ok_confirms_in_flight() {
    let (link, transport, _) = link();
    let handle = link.enqueue(Instruction::plain("M105").unwrap(), false);
    link.enqueue(Instruction::plain("M114").unwrap(), false);

    assert!(link.handle_line("ok T:20.0 /0.0 B:20.0 /0.0\r\n"));
    assert!(handle.is_confirmed());
    assert!(link.wait_for_confirmation(&handle, || false));
    assert_eq!(transport.written(), vec!["M105\n", "M114\n"]);
}

#[test]
fn test_words_starting_with_ok_do_not_confirm() {
    let (link, transport, _) = link();
    let handle = link.enqueue(Instruction::plain("M105").unwrap(), false);

    link.handle_line("okay then");
    assert!(!handle.is_confirmed());
    assert_eq!(transport.write_count(), 1);

    link.handle_line("ok");
    assert!(handle.is_confirmed());
}

#[test]
fn test_temperature_report_is_published() {
    let (link, _, events) = link();
    assert!(link.handle_line("T:210.0 /215.0 B:60.0 /60.0 @:0"));

    let events = events.lock().unwrap();
    let reported = events.iter().any(|event| {
        matches!(
            event,
            LinkEvent::Printer(PrinterEvent::Temperature { nozzle, bed_target, .. })
                if *nozzle == 210.0 && *bed_target == 60.0
        )
    });
    assert!(reported);
}

#[test]
fn test_resend_line_replays() {
    let (link, transport, _) = link();
    for x in 1..=3 {
        link.enqueue(
            Instruction::plain(format!("G1 X{}", x)).unwrap().with_checksum(),
            false,
        );
    }
    link.handle_line("ok");
    link.handle_line("ok");
    assert_eq!(transport.write_count(), 3);

    link.handle_line("Resend: 2");
    link.handle_line("ok");

    let written = transport.written();
    assert_eq!(written.len(), 4);
    assert_eq!(written[3], written[1]);
}

#[test]
fn test_rx_discarded_resends() {
    let (link, transport, events) = link();
    link.enqueue(Instruction::plain("M105").unwrap(), false);
    link.handle_line("echo:Now fresh file: x.gco");

    assert_eq!(transport.written(), vec!["M105\n", "M105\n"]);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, LinkEvent::Printer(PrinterEvent::RxDiscarded))));
}

#[test]
fn test_boot_during_print() {
    let (link, transport, events) = link();
    link.handle_line("echo:enqueing \"M24\"");
    assert_eq!(link.get_state(), PrinterState::Printing);

    link.handle_line("start");
    let snapshot = link.snapshot();
    assert_eq!(snapshot.state, PrinterState::Busy);
    assert_eq!(snapshot.printing, None);
    assert_eq!(transport.last_written().as_deref(), Some("M603\n"));
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, LinkEvent::Printer(PrinterEvent::Booted))));

    // The line numbering restarts after the interrupted-print G-codes
    link.handle_line("ok");
    assert_eq!(transport.last_written().as_deref(), Some("M400\n"));
    link.handle_line("ok");
    assert_eq!(transport.last_written().as_deref(), Some("M110 N0\n"));
    assert_eq!(link.get_state(), PrinterState::Ready);
}

#[test]
fn test_attention_then_ok() {
    let (link, _, events) = link();
    link.state_manager().resolve_printing_uncertainty(false);

    link.handle_line("echo:busy: paused for user");
    assert_eq!(link.get_state(), PrinterState::Attention);
    link.handle_line("ok");
    assert_eq!(link.get_state(), PrinterState::Ready);

    let events = events.lock().unwrap();
    let last = events
        .iter()
        .filter_map(|event| match event {
            LinkEvent::State(StateEvent::Changed(transition)) => Some(transition),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(last.source, Some(Source::User));
}

#[test]
fn test_stop_print() {
    let (link, _, _) = link();
    link.handle_line("echo:enqueing \"M24\"");
    for x in 1..=2 {
        link.enqueue(
            Instruction::plain(format!("G1 X{}", x)).unwrap().with_checksum(),
            false,
        );
    }

    assert_eq!(link.stop_print(), 2);
    assert_eq!(link.get_state(), PrinterState::Stopped);
}

#[tokio::test]
async fn test_reader_feeds_router() {
    let (link, transport, events) = link();
    link.start().await.unwrap();

    let handle = link.enqueue(Instruction::plain("M105").unwrap(), false);
    transport.push_incoming("Not SD printing");
    transport.push_incoming("ok");
    transport.push_incoming("ok");
    let confirmed = tokio::task::spawn_blocking(move || {
        handle.wait_for_confirmation_timeout(Duration::from_secs(2))
    })
    .await
    .unwrap();
    assert!(confirmed);

    link.stop().await;
    assert!(!transport.is_open());
    assert!(link.queue().is_closed());
    assert!(events.lock().unwrap().iter().any(|event| matches!(
        event,
        LinkEvent::Connection(ConnectionEvent::Closed { .. })
    )));
}

async fn wait_until_settled(link: &PrinterLink) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while link.state_manager().is_unsure_whether_printing() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_startup_query_settles_idle_printer() {
    let (link, transport, _) = link();
    link.start().await.unwrap();
    assert_eq!(transport.last_written().as_deref(), Some("M27\n"));

    transport.push_incoming("Not SD printing");
    transport.push_incoming("ok");
    wait_until_settled(&link).await;
    assert!(!link.state_manager().is_unsure_whether_printing());

    link.handle_line("echo:busy: processing");
    assert_eq!(link.get_state(), PrinterState::Busy);
    link.handle_line("ok");
    link.handle_line("echo:busy: paused for user");
    link.handle_line("ok");
    assert_eq!(link.get_state(), PrinterState::Ready);

    link.stop().await;
}

#[tokio::test]
async fn test_startup_query_detects_running_print() {
    let (link, transport, _) = link();
    link.start().await.unwrap();

    transport.push_incoming("SD printing byte 2048/90000");
    transport.push_incoming("ok");
    wait_until_settled(&link).await;

    assert!(!link.state_manager().is_unsure_whether_printing());
    assert_eq!(link.get_state(), PrinterState::Printing);

    link.stop().await;
}

#[tokio::test]
async fn test_connection_events_drive_serial_error() {
    let (link, _, _) = link();
    link.start().await.unwrap();

    link.bus()
        .publish(LinkEvent::Connection(ConnectionEvent::Lost {
            port: "mock".to_string(),
            reason: "unplugged".to_string(),
        }))
        .ok();
    assert_eq!(link.get_state(), PrinterState::Error);

    link.bus()
        .publish(LinkEvent::Connection(ConnectionEvent::Opened {
            port: "mock".to_string(),
        }))
        .ok();
    assert_eq!(link.get_state(), PrinterState::Ready);

    link.stop().await;
}

#[tokio::test]
async fn test_failure_triggers_recovery() {
    let (link, transport, _) = link_with(LinkConfig {
        recovery: RecoveryConfig {
            reset_printer: true,
            boot_grace_period: Duration::from_millis(50),
        },
        ..LinkConfig::default()
    });
    link.start().await.unwrap();

    let lost = link.enqueue(
        Instruction::plain("G1 X1").unwrap().with_checksum(),
        false,
    );
    link.queue().declare_failure("test");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(lost.outcome().unwrap().forced);
    assert_eq!(transport.resets.load(Ordering::SeqCst), 1);
    assert!(!link.queue().is_blocked());
    assert!(!link.is_recovering());

    link.stop().await;
}
