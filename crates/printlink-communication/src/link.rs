//! Printer Link
//!
//! Wires one printer together: transport, line router, serial queue, state
//! manager, reader thread and stall watchdog, all sharing one event bus.
//! The link registers the handlers for the firmware's control lines and
//! runs the recovery sequence after a communication failure.

use parking_lot::Mutex;
use printlink_core::{
    ConnectionEvent, EventBus, EventCategory, EventFilter, LinkEvent, PrinterEvent,
    PrinterState, QueueEvent, Result, StateChange, StateSnapshot, SubscriptionId,
};
use regex::Captures;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;

use crate::helpers;
use crate::instruction::{Instruction, InstructionHandle};
use crate::printer::StateManager;
use crate::protocol::patterns;
use crate::queue::{QueueConfig, SerialQueue, CONFIRMATION_PRIORITY};
use crate::reader::LineReader;
use crate::router::LineRouter;
use crate::transport::{SerialConfig, SerialTransport, Transport};
use crate::watchdog::{StallWatchdog, WatchdogConfig};

/// What happens after a communication failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Pulse the printer's reset line
    pub reset_printer: bool,
    /// Sending stays blocked this long after the reset
    pub boot_grace_period: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            reset_printer: true,
            boot_grace_period: Duration::from_secs(8),
        }
    }
}

/// Runtime configuration of a [`PrinterLink`]
#[derive(Debug, Clone, Default)]
pub struct LinkConfig {
    /// Serial port settings
    pub serial: SerialConfig,
    /// Queue settings, including the planner estimator
    pub queue: QueueConfig,
    /// Stall watchdog settings
    pub watchdog: WatchdogConfig,
    /// Failure recovery settings
    pub recovery: RecoveryConfig,
}

/// One printer, reachable through the caller-facing API
pub struct PrinterLink {
    config: LinkConfig,
    transport: Arc<dyn Transport>,
    bus: Arc<EventBus>,
    router: Arc<LineRouter>,
    queue: Arc<SerialQueue>,
    state: Arc<StateManager>,
    watchdog: StallWatchdog,
    reader: Mutex<Option<LineReader>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    recovering: Arc<AtomicBool>,
}

impl PrinterLink {
    /// Create a link talking to the configured serial port
    pub fn new(config: LinkConfig) -> Self {
        let transport = Arc::new(SerialTransport::new(config.serial.clone()));
        Self::with_transport(config, transport)
    }

    /// Create a link over any transport
    ///
    /// Handlers are registered right away, so lines can be routed before
    /// [`start`](Self::start) is called.
    pub fn with_transport(config: LinkConfig, transport: Arc<dyn Transport>) -> Self {
        let bus = Arc::new(EventBus::new());
        let router = Arc::new(LineRouter::new());
        let queue = SerialQueue::new(
            config.queue.clone(),
            transport.clone(),
            router.clone(),
            bus.clone(),
        );
        let state = Arc::new(StateManager::new(bus.clone()));
        let watchdog = StallWatchdog::new(config.watchdog.clone(), queue.clone(), transport.clone());

        let link = Self {
            config,
            transport,
            bus,
            router,
            queue,
            state,
            watchdog,
            reader: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            recovering: Arc::new(AtomicBool::new(false)),
        };
        link.register_handlers();
        link
    }

    fn register_handlers(&self) {
        let queue = self.queue.clone();
        let state = self.state.clone();
        self.router
            .register(patterns::confirmation(), CONFIRMATION_PRIORITY, move |_, captures| {
                let extra = captures.name("extra").map_or("", |extra| extra.as_str());
                queue.handle_confirmation(extra);
                state.instruction_confirmed();
            });

        let queue = self.queue.clone();
        self.router
            .register(patterns::resend(), CONFIRMATION_PRIORITY, move |line, captures| {
                match captures
                    .name("cmd_number")
                    .and_then(|number| number.as_str().parse::<u64>().ok())
                {
                    Some(line_number) => queue.note_resend_requested(line_number),
                    None => tracing::warn!("Unreadable resend request {:?}", line),
                }
            });

        let queue = self.queue.clone();
        let bus = self.bus.clone();
        self.router
            .register(patterns::rx_discarded(), CONFIRMATION_PRIORITY, move |_, _| {
                queue.assume_rx_lost();
                bus.publish(LinkEvent::Printer(PrinterEvent::RxDiscarded)).ok();
            });

        let queue = self.queue.clone();
        let state = self.state.clone();
        let bus = self.bus.clone();
        self.router
            .register(patterns::printer_boot(), CONFIRMATION_PRIORITY, move |_, _| {
                let was_printing = matches!(
                    state.snapshot().printing,
                    Some(PrinterState::Printing | PrinterState::Paused)
                );
                tracing::info!("Printer booted, was printing: {}", was_printing);
                state.reset();
                queue.printer_reconnected(was_printing);
                queue.reset_line_numbering();
                bus.publish(LinkEvent::Printer(PrinterEvent::Booted)).ok();
            });

        self.state.register(&self.router);

        for pattern in [
            patterns::busy(),
            patterns::attention(),
            patterns::heating(),
            patterns::heating_hotend(),
        ] {
            let queue = self.queue.clone();
            self.router
                .register_non_exclusive(pattern, 0, move |_, _| queue.renew_timeout());
        }

        let bus = self.bus.clone();
        self.router
            .register_non_exclusive(patterns::temperature(), 0, move |line, captures| {
                match parse_temperature(captures) {
                    Some(event) => {
                        bus.publish(LinkEvent::Printer(event)).ok();
                    }
                    None => tracing::debug!("Unreadable temperature report {:?}", line),
                }
            });
    }

    /// Start the reader thread and the watchdog
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(&self) -> Result<()> {
        {
            let mut reader = self.reader.lock();
            if reader.is_none() {
                *reader = Some(LineReader::spawn(
                    self.transport.clone(),
                    self.router.clone(),
                    self.bus.clone(),
                    self.config.serial.reopen_interval,
                )?);
            }
        }
        self.watchdog.start().await?;
        self.subscribe_internal(Handle::current());
        if self.state.is_unsure_whether_printing() {
            self.query_print_progress();
        }
        tracing::info!("Printer link on {} started", self.transport.name());
        Ok(())
    }

    /// Ask the printer whether it is already printing from SD
    ///
    /// The answer settles the state manager's startup uncertainty, unless a
    /// boot or a print marker settled it first.
    fn query_print_progress(&self) {
        let instruction =
            match Instruction::mandatory_matchable("M27", patterns::sd_print_status().clone()) {
                Ok(instruction) => instruction,
                Err(e) => {
                    tracing::warn!("Cannot query the print progress: {}", e);
                    return;
                }
            };
        let handle = self.queue.enqueue(instruction, true);
        let queue = self.queue.clone();
        let state = self.state.clone();

        tokio::task::spawn_blocking(move || {
            if !helpers::wait_for_instruction(&handle, || !queue.is_closed()) {
                return;
            }
            match handle.outcome() {
                Some(outcome) if !outcome.forced => {
                    let printing = outcome
                        .captured
                        .iter()
                        .any(|captured| captured.group("sdn").is_some());
                    if state.is_unsure_whether_printing() {
                        tracing::info!("Printer reports printing from SD: {}", printing);
                        state.resolve_printing_uncertainty(printing);
                    }
                }
                _ => tracing::debug!("Print progress query was dropped"),
            }
        });
    }

    fn subscribe_internal(&self, runtime: Handle) {
        let queue = self.queue.clone();
        let transport = self.transport.clone();
        let recovering = self.recovering.clone();
        let recovery = self.config.recovery.clone();
        let failures = self.bus.subscribe(
            EventFilter::Categories(vec![EventCategory::Queue]),
            move |event| {
                if let LinkEvent::Queue(QueueEvent::CommunicationFailed { .. }) = event {
                    spawn_recovery(
                        &runtime,
                        queue.clone(),
                        transport.clone(),
                        recovery.clone(),
                        recovering.clone(),
                    );
                }
            },
        );

        let state = self.state.clone();
        let connection = self.bus.subscribe(
            EventFilter::Categories(vec![EventCategory::Connection]),
            move |event| match event {
                LinkEvent::Connection(ConnectionEvent::Lost { .. }) => state.serial_error(),
                LinkEvent::Connection(ConnectionEvent::Opened { .. }) => {
                    state.serial_error_resolved()
                }
                _ => {}
            },
        );

        self.subscriptions.lock().extend([failures, connection]);
    }

    /// Stop everything and persist the planner threshold
    pub async fn stop(&self) {
        self.watchdog.stop().await;

        let reader = self.reader.lock().take();
        if let Some(mut reader) = reader {
            if let Err(e) = tokio::task::spawn_blocking(move || reader.stop()).await {
                tracing::warn!("Reader shutdown failed: {}", e);
            }
        }

        for id in self.subscriptions.lock().drain(..) {
            self.bus.unsubscribe(id);
        }

        self.queue.stop();
        self.transport.close();
        self.bus
            .publish(LinkEvent::Connection(ConnectionEvent::Closed {
                port: self.transport.name(),
            }))
            .ok();

        if let Some(path) = &self.config.queue.planner.threshold_path {
            match self.queue.save_planner_threshold(path) {
                Ok(true) => tracing::debug!("Planner threshold saved to {}", path.display()),
                Ok(false) => {}
                Err(e) => tracing::warn!("Cannot save the planner threshold: {}", e),
            }
        }
        tracing::info!("Printer link on {} stopped", self.transport.name());
    }

    /// Queue an instruction
    pub fn enqueue(&self, instruction: Instruction, to_front: bool) -> InstructionHandle {
        self.queue.enqueue(instruction, to_front)
    }

    /// Block until `handle` is confirmed or `should_keep_waiting` gives up
    pub fn wait_for_confirmation<F>(&self, handle: &InstructionHandle, should_keep_waiting: F) -> bool
    where
        F: Fn() -> bool,
    {
        helpers::wait_for_instruction(handle, should_keep_waiting)
    }

    /// Stop the running print on the caller's behalf
    ///
    /// Returns the number of print instructions dropped.
    pub fn stop_print(&self) -> usize {
        self.state.stopped();
        self.queue.flush_print_queue()
    }

    /// The reported printer state
    pub fn get_state(&self) -> PrinterState {
        self.state.get_state()
    }

    /// All state layers at once
    pub fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot()
    }

    /// Announce an expected state change
    pub fn expect_change(&self, change: StateChange) {
        self.state.expect_change(change);
    }

    /// Withdraw the announced state change
    pub fn stop_expecting_change(&self) {
        self.state.stop_expecting_change();
    }

    /// Subscribe a synchronous handler to link events
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(LinkEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(filter, handler)
    }

    /// Receiver for consuming link events from a tokio task
    pub fn receiver(&self) -> broadcast::Receiver<LinkEvent> {
        self.bus.receiver()
    }

    /// Feed one received line through the router
    pub fn handle_line(&self, line: &str) -> bool {
        self.router.route(line.trim())
    }

    /// Whether a failure recovery is in progress
    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// The serial queue
    pub fn queue(&self) -> &Arc<SerialQueue> {
        &self.queue
    }

    /// The state manager
    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// The line router
    pub fn router(&self) -> &Arc<LineRouter> {
        &self.router
    }

    /// The event bus
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The stall watchdog
    pub fn watchdog(&self) -> &StallWatchdog {
        &self.watchdog
    }

    /// The link configuration
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }
}

impl std::fmt::Debug for PrinterLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrinterLink")
            .field("port", &self.transport.name())
            .field("state", &self.get_state())
            .field("queue", &self.queue)
            .finish()
    }
}

fn parse_temperature(captures: &Captures<'_>) -> Option<PrinterEvent> {
    let value = |name: &str| captures.name(name)?.as_str().parse::<f64>().ok();
    Some(PrinterEvent::Temperature {
        nozzle: value("ntemp")?,
        nozzle_target: value("set_ntemp")?,
        bed: value("btemp")?,
        bed_target: value("set_btemp")?,
    })
}

fn spawn_recovery(
    runtime: &Handle,
    queue: Arc<SerialQueue>,
    transport: Arc<dyn Transport>,
    recovery: RecoveryConfig,
    recovering: Arc<AtomicBool>,
) {
    if recovering.swap(true, Ordering::SeqCst) {
        tracing::debug!("Recovery already in progress");
        return;
    }

    runtime.spawn(async move {
        let dropped = queue.flush_print_queue();
        queue.block_sending();
        tracing::warn!(
            "Recovering from a communication failure, {} print instructions dropped",
            dropped
        );

        if recovery.reset_printer {
            let reset = tokio::task::spawn_blocking(move || transport.reset_printer()).await;
            match reset {
                Ok(Ok(())) => tracing::info!("Printer reset requested"),
                Ok(Err(e)) => tracing::warn!("Cannot reset the printer: {}", e),
                Err(e) => tracing::warn!("Printer reset task failed: {}", e),
            }
        }

        tokio::time::sleep(recovery.boot_grace_period).await;
        queue.unblock_sending();
        recovering.store(false, Ordering::SeqCst);
        tracing::debug!("Recovery finished");
    });
}
