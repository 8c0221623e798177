//! Serial Queue
//!
//! Decides which instruction is written next, frames checksummed lines,
//! keeps the history needed to honour resend requests and keeps at most one
//! instruction in flight. All of that state lives behind one mutex. Sends
//! happen while it is held; events are published after it is released.
//!
//! Selection order, highest first:
//! 1. the line-reset workaround slot
//! 2. the RX-lost slot
//! 3. the recovery list
//! 4. the priority queue, except that one normal entry is let through while
//!    the planner is fed
//! 5. the normal queue

use parking_lot::Mutex;
use printlink_core::{EventBus, LinkEvent, ProtocolError, QueueEvent};
use regex::Regex;
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::instruction::{Instruction, InstructionHandle};
use crate::planner::{PlannerConfig, PlannerFedEstimator};
use crate::protocol::patterns;
use crate::router::{HandlerId, LineRouter};
use crate::transport::Transport;

/// Router priority of the acknowledgement handler
pub const CONFIRMATION_PRIORITY: i32 = i32::MAX;

/// Router priority of the in-flight instruction's capture handlers
pub const CAPTURE_PRIORITY: i32 = i32::MAX - 1;

/// Serial queue settings
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Number of checksummed sends kept for resends
    pub history_length: usize,
    /// Firmware receive buffer size in bytes
    pub rx_size: usize,
    /// Line numbers are reset before reaching this value
    pub line_number_modulus: u64,
    /// Sent after reconnecting from a communication failure
    pub failure_gcodes: Vec<String>,
    /// Sent after reconnecting while a print was running
    pub interrupted_print_gcodes: Vec<String>,
    /// Planner-fed estimator settings
    pub planner: PlannerConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            history_length: 100,
            rx_size: 128,
            line_number_modulus: 2_147_483_647,
            failure_gcodes: vec![
                "M300 S880 P200".to_string(),
                "M603".to_string(),
                "M1 FW COMM ERR. Aborted".to_string(),
            ],
            interrupted_print_gcodes: vec!["M603".to_string()],
            planner: PlannerConfig::default(),
        }
    }
}

/// A checksummed line as it went over the wire
#[derive(Debug, Clone)]
struct SentLine {
    message: String,
    payload: Vec<u8>,
}

struct QueueInner {
    queue: VecDeque<Instruction>,
    priority_queue: VecDeque<Instruction>,
    recovery_list: Vec<Instruction>,
    rx_lost_slot: Option<Instruction>,
    workaround_slot: Option<Instruction>,
    worked_around_line_reset: bool,
    current: Option<Instruction>,
    capture_handlers: Vec<(Regex, HandlerId)>,
    history: VecDeque<SentLine>,
    line_number: u64,
    planner: PlannerFedEstimator,
    blocked: bool,
    closed: bool,
    has_failed: bool,
    last_activity: Instant,
    last_progress: Instant,
    stalls: u32,
    outbox: Vec<LinkEvent>,
}

impl QueueInner {
    fn is_empty(&self) -> bool {
        self.queue.is_empty()
            && self.priority_queue.is_empty()
            && self.recovery_list.is_empty()
            && self.rx_lost_slot.is_none()
            && self.workaround_slot.is_none()
    }

    fn lets_normal_through(&self) -> bool {
        self.planner.is_fed() && !self.queue.is_empty()
    }

    fn peek_next(&self) -> Option<&Instruction> {
        if let Some(instruction) = &self.workaround_slot {
            return Some(instruction);
        }
        if let Some(instruction) = &self.rx_lost_slot {
            return Some(instruction);
        }
        if let Some(instruction) = self.recovery_list.last() {
            return Some(instruction);
        }
        if !self.priority_queue.is_empty() {
            if self.lets_normal_through() {
                return self.queue.front();
            }
            return self.priority_queue.front();
        }
        self.queue.front()
    }

    fn next_instruction(&mut self) -> Option<Instruction> {
        if let Some(instruction) = self.workaround_slot.take() {
            return Some(instruction);
        }
        if let Some(instruction) = self.rx_lost_slot.take() {
            return Some(instruction);
        }
        if let Some(instruction) = self.recovery_list.pop() {
            return Some(instruction);
        }
        if !self.priority_queue.is_empty() {
            if self.lets_normal_through() {
                // One at a time, the next needs a fresh fed verdict
                self.planner.invalidate();
                tracing::debug!("Allowing a non-important instruction through");
                return self.queue.pop_front();
            }
            return self.priority_queue.pop_front();
        }
        self.queue.pop_front()
    }

    fn renew_activity(&mut self, unstuck: bool) {
        self.last_activity = Instant::now();
        if unstuck {
            self.stalls = 0;
        }
    }

    fn renew_progress(&mut self, unstuck: bool) {
        self.last_progress = Instant::now();
        self.renew_activity(unstuck);
    }

    fn push_history(&mut self, line: SentLine, limit: usize) {
        self.history.push_back(line);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

/// Transmission queue for one printer
pub struct SerialQueue {
    inner: Mutex<QueueInner>,
    transport: Arc<dyn Transport>,
    router: Arc<LineRouter>,
    bus: Arc<EventBus>,
    config: QueueConfig,
    me: Weak<SerialQueue>,
}

impl SerialQueue {
    /// Create a queue writing to `transport`
    ///
    /// Capture handlers of in-flight instructions are registered on
    /// `router`. The persisted planner threshold is loaded if configured.
    pub fn new(
        config: QueueConfig,
        transport: Arc<dyn Transport>,
        router: Arc<LineRouter>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let mut planner = PlannerFedEstimator::new(config.planner.clone());
        if let Some(path) = &config.planner.threshold_path {
            planner.load_default_threshold(path);
        }
        let now = Instant::now();

        Arc::new_cyclic(|me| Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                priority_queue: VecDeque::new(),
                recovery_list: Vec::new(),
                rx_lost_slot: None,
                workaround_slot: None,
                worked_around_line_reset: false,
                current: None,
                capture_handlers: Vec::new(),
                history: VecDeque::new(),
                line_number: 0,
                planner,
                blocked: false,
                closed: false,
                has_failed: false,
                last_activity: now,
                last_progress: now,
                stalls: 0,
                outbox: Vec::new(),
            }),
            transport,
            router,
            bus,
            config,
            me: me.clone(),
        })
    }

    /// The queue configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Run `f` under the queue lock, then publish whatever it queued up
    fn locked<R>(&self, f: impl FnOnce(&mut QueueInner) -> R) -> R {
        let (result, events) = {
            let mut inner = self.inner.lock();
            let result = f(&mut inner);
            (result, std::mem::take(&mut inner.outbox))
        };
        for event in events {
            self.bus.publish(event).ok();
        }
        result
    }

    /// Queue an instruction and try to send
    ///
    /// `to_front` puts it into the priority queue.
    pub fn enqueue(&self, mut instruction: Instruction, to_front: bool) -> InstructionHandle {
        let handle = instruction.handle();
        if self.inner.lock().closed {
            tracing::debug!("{} dropped, the queue is closed", instruction);
            instruction.mark_sent();
            instruction.confirm(true);
            return handle;
        }
        tracing::debug!(
            "{} enqueued{}",
            instruction,
            if to_front { " to the front" } else { "" }
        );
        self.locked(|inner| {
            if to_front {
                inner.priority_queue.push_back(instruction);
            } else {
                inner.queue.push_back(instruction);
            }
            self.try_send(inner);
        });
        handle
    }

    /// Queue several instructions without interleaving other callers
    pub fn enqueue_list(
        &self,
        instructions: Vec<Instruction>,
        to_front: bool,
    ) -> Vec<InstructionHandle> {
        let handles = instructions.iter().map(Instruction::handle).collect();
        self.locked(|inner| {
            let target = if to_front {
                &mut inner.priority_queue
            } else {
                &mut inner.queue
            };
            target.extend(instructions);
            self.try_send(inner);
        });
        handles
    }

    /// Queue `M110 N0` ahead of everything already queued
    pub fn reset_line_numbering(&self) {
        self.locked(|inner| {
            inner
                .priority_queue
                .push_front(Instruction::internal("M110 N0"));
            self.try_send(inner);
        });
    }

    fn try_send(&self, inner: &mut QueueInner) {
        if inner.current.is_some() || inner.blocked || inner.closed || inner.is_empty() {
            return;
        }

        if !inner.worked_around_line_reset
            && inner
                .peek_next()
                .is_some_and(|next| patterns::line_reset().is_match(next.message()))
        {
            // The firmware needs its buffers drained before a line reset
            inner.workaround_slot = Some(Instruction::internal("M400"));
            inner.worked_around_line_reset = true;
        }

        let Some(mut instruction) = inner.next_instruction() else {
            return;
        };

        if !instruction.is_rendered() && instruction.is_checksummed() {
            inner.line_number += 1;
            let line_number = inner.line_number;
            let payload = instruction.render(line_number).to_vec();
            inner.push_history(
                SentLine {
                    message: instruction.message().to_string(),
                    payload,
                },
                self.config.history_length,
            );
            if inner.line_number >= self.config.line_number_modulus {
                inner
                    .priority_queue
                    .push_front(Instruction::internal("M110 N0"));
            }
        } else {
            instruction.render(inner.line_number);
        }

        if let Some(captures) = patterns::line_reset().captures(instruction.message()) {
            inner.worked_around_line_reset = false;
            inner.history.clear();
            inner.line_number = captures
                .name("cmd_number")
                .and_then(|number| number.as_str().parse::<u64>().ok())
                .unwrap_or(0);
            tracing::debug!("Line number reset to {}", inner.line_number);
            inner.outbox.push(LinkEvent::Queue(QueueEvent::LineNumberChanged {
                line_number: inner.line_number,
            }));
        }

        let payload = instruction.payload().map(<[u8]>::to_vec).unwrap_or_default();
        if payload.len() > self.config.rx_size {
            tracing::warn!(
                "{}",
                ProtocolError::PayloadTooLarge {
                    size: payload.len(),
                    limit: self.config.rx_size,
                }
            );
        }

        self.hookup_capture(inner, &instruction);
        instruction.mark_sent();
        // Stalls only clear on a confirmation or firmware chatter
        inner.renew_progress(false);
        tracing::debug!("Sending {:?}", String::from_utf8_lossy(&payload));
        inner.current = Some(instruction);

        if let Err(e) = self.transport.write(&payload) {
            tracing::info!(
                "Serial write failed, waiting for the reader to recover: {}",
                e
            );
        }
    }

    fn hookup_capture(&self, inner: &mut QueueInner, instruction: &Instruction) {
        for pattern in instruction.capture_patterns() {
            let queue = self.me.clone();
            let id = self
                .router
                .register(pattern, CAPTURE_PRIORITY, move |line, _| {
                    if let Some(queue) = queue.upgrade() {
                        queue.output_captured(line);
                    }
                });
            inner.capture_handlers.push((pattern.clone(), id));
        }
    }

    fn teardown_capture(&self, inner: &mut QueueInner) {
        for (pattern, id) in inner.capture_handlers.drain(..) {
            self.router.unregister(&pattern, id);
        }
    }

    /// Hand an output line to the in-flight instruction
    pub fn output_captured(&self, line: &str) {
        let mut inner = self.inner.lock();
        if let Some(current) = inner.current.as_mut() {
            current.output_captured(line);
        }
    }

    /// Handle an acknowledgement line with its glued-on `extra` text
    ///
    /// Informational output glued after `ok` is captured first, but only
    /// when the in-flight instruction asked for it.
    pub fn handle_confirmation(&self, extra: &str) -> bool {
        let extra = extra.trim();
        if !extra.is_empty() {
            let fan_out = [patterns::temperature()];
            let wanted = {
                let inner = self.inner.lock();
                inner.current.as_ref().is_some_and(|current| {
                    fan_out
                        .iter()
                        .any(|pattern| current.captures_pattern(pattern) && pattern.is_match(extra))
                })
            };
            if wanted {
                self.router.route(extra);
            } else {
                tracing::trace!("Ignoring text after ok: {:?}", extra);
            }
        }
        self.confirm(false)
    }

    /// Confirm the in-flight instruction
    ///
    /// The instruction may refuse unless `force` is set. A confirmed
    /// instruction is retired and the next one is sent.
    pub fn confirm(&self, force: bool) -> bool {
        self.locked(|inner| {
            let confirmed = match inner.current.as_mut() {
                Some(current) if current.is_sent() => current.confirm(force),
                _ => {
                    tracing::warn!("{}", ProtocolError::UnexpectedConfirmation);
                    false
                }
            };

            if confirmed {
                self.teardown_capture(inner);
                if let Some(instruction) = inner.current.take() {
                    tracing::debug!("{} confirmed", instruction);
                    if instruction.is_checksummed() && !force {
                        if let Some(latency) = instruction.time_to_confirm() {
                            inner.planner.observe(latency);
                        }
                    }
                    inner
                        .outbox
                        .push(LinkEvent::Queue(QueueEvent::InstructionConfirmed {
                            message: instruction.message().to_string(),
                            latency: instruction.time_to_confirm(),
                            forced: force,
                        }));
                }
                inner.renew_progress(true);
            } else if let Some(current) = &inner.current {
                tracing::debug!(
                    "{}",
                    ProtocolError::RefusedConfirmation {
                        message: current.message().to_string(),
                    }
                );
            }

            self.try_send(inner);
            confirmed
        })
    }

    /// The firmware lost everything from `line_number` on
    ///
    /// The lost lines are re-sent from history with their original payloads,
    /// oldest first. Asking for more than the history holds is a
    /// communication failure.
    pub fn note_resend_requested(&self, line_number: u64) {
        self.locked(|inner| {
            tracing::info!(
                "Resend of {} requested, current is {}",
                line_number,
                inner.line_number
            );
            if line_number > inner.line_number {
                tracing::warn!(
                    "{}",
                    ProtocolError::UnknownResendLine {
                        requested: line_number,
                        current: inner.line_number,
                    }
                );
                return;
            }

            if !inner
                .current
                .as_ref()
                .is_some_and(Instruction::is_checksummed)
            {
                tracing::warn!("Resend requested for a non-numbered instruction");
                self.rx_lost(inner);
            }

            let count = inner.line_number - line_number + 1;
            if count > inner.history.len() as u64 {
                let error = ProtocolError::ImpossibleResend {
                    requested: count,
                    available: inner.history.len(),
                };
                self.fail(inner, error.to_string());
                return;
            }

            // Newest first, so popping from the end replays in send order
            inner.recovery_list = inner
                .history
                .iter()
                .rev()
                .take(count as usize)
                .map(|line| Instruction::recovered(&line.message, line.payload.clone()))
                .collect();
            self.try_send(inner);
        });
    }

    /// The firmware dropped its receive buffer
    ///
    /// The in-flight instruction, if any, is re-sent ahead of everything
    /// else. Without one this does nothing.
    pub fn assume_rx_lost(&self) {
        self.locked(|inner| self.rx_lost(inner));
    }

    fn rx_lost(&self, inner: &mut QueueInner) {
        let Some(mut instruction) = inner.current.take() else {
            return;
        };
        tracing::debug!("Assuming the RX buffer was lost, re-sending {}", instruction);
        self.teardown_capture(inner);
        instruction.reset();
        inner.rx_lost_slot = Some(instruction);
        self.try_send(inner);
    }

    fn fail(&self, inner: &mut QueueInner, reason: String) {
        if inner.has_failed {
            tracing::debug!("Communication already failed: {}", reason);
            return;
        }
        tracing::error!("Communication failed: {}", reason);
        inner.has_failed = true;
        inner
            .outbox
            .push(LinkEvent::Queue(QueueEvent::CommunicationFailed { reason }));
    }

    /// Declare the conversation with the firmware broken
    pub fn declare_failure(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.locked(|inner| self.fail(inner, reason));
    }

    /// Whether a communication failure is pending recovery
    pub fn has_failed(&self) -> bool {
        self.inner.lock().has_failed
    }

    fn throw_out_current(&self, inner: &mut QueueInner) -> usize {
        match inner.current.take() {
            Some(mut instruction) => {
                instruction.confirm(true);
                self.teardown_capture(inner);
                1
            }
            None => 0,
        }
    }

    /// Drop all print instructions
    ///
    /// Checksummed instructions leave every queue and the recovery list.
    /// The in-flight instruction is force-retired whatever it is.
    pub fn flush_print_queue(&self) -> usize {
        self.locked(|inner| {
            let mut dropped = self.throw_out_current(inner);
            let mut retire = |instruction: &mut Instruction| {
                instruction.confirm(true);
                dropped += 1;
            };

            for queue in [&mut inner.queue, &mut inner.priority_queue] {
                let (mut print, keep): (VecDeque<_>, VecDeque<_>) =
                    queue.drain(..).partition(Instruction::is_checksummed);
                print.iter_mut().for_each(&mut retire);
                *queue = keep;
            }
            inner.recovery_list.iter_mut().for_each(&mut retire);
            inner.recovery_list.clear();

            tracing::info!("Print queue flushed, {} instructions dropped", dropped);
            inner
                .outbox
                .push(LinkEvent::Queue(QueueEvent::QueueFlushed { dropped }));
            self.try_send(inner);
            dropped
        })
    }

    fn flush_all(&self, inner: &mut QueueInner) -> usize {
        let mut dropped = self.throw_out_current(inner);
        while let Some(mut instruction) = inner.next_instruction() {
            instruction.mark_sent();
            instruction.confirm(true);
            dropped += 1;
        }
        dropped
    }

    /// Recover after the printer rebooted
    ///
    /// Everything queued is force-retired. After a communication failure
    /// the failure G-codes are queued, after an interrupted print the
    /// interrupted-print G-codes. Returns the handle of the last one.
    pub fn printer_reconnected(&self, was_printing: bool) -> Option<InstructionHandle> {
        self.locked(|inner| {
            let dropped = self.flush_all(inner);
            inner.blocked = false;
            inner.worked_around_line_reset = false;

            let gcodes = if inner.has_failed {
                inner.has_failed = false;
                &self.config.failure_gcodes
            } else if was_printing {
                &self.config.interrupted_print_gcodes
            } else {
                tracing::debug!("Printer reconnected, {} dropped", dropped);
                self.try_send(inner);
                return None;
            };

            let mut last = None;
            for gcode in gcodes {
                match Instruction::plain(gcode.as_str()) {
                    Ok(instruction) => {
                        last = Some(instruction.handle());
                        inner.priority_queue.push_back(instruction);
                    }
                    Err(e) => tracing::warn!("Skipping recovery G-code: {}", e),
                }
            }
            tracing::info!(
                "Printer reconnected, {} dropped, {} recovery instructions queued",
                dropped,
                gcodes.len()
            );
            self.try_send(inner);
            last
        })
    }

    /// Hold back sending until [`unblock_sending`](Self::unblock_sending)
    pub fn block_sending(&self) {
        self.inner.lock().blocked = true;
    }

    /// Resume sending
    pub fn unblock_sending(&self) {
        self.locked(|inner| {
            if inner.blocked {
                inner.blocked = false;
                self.try_send(inner);
            }
        });
    }

    /// Whether sending is blocked
    pub fn is_blocked(&self) -> bool {
        self.inner.lock().blocked
    }

    /// Close the queue, force-retiring everything in it
    pub fn stop(&self) {
        self.locked(|inner| {
            inner.closed = true;
            let dropped = self.flush_all(inner);
            tracing::debug!("Serial queue stopped, {} dropped", dropped);
        });
    }

    /// Whether the queue was stopped
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Whether nothing waits to be sent
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Message of the instruction that would be sent next
    pub fn peek_next(&self) -> Option<String> {
        self.inner
            .lock()
            .peek_next()
            .map(|instruction| instruction.message().to_string())
    }

    /// Message of the in-flight instruction
    pub fn in_flight(&self) -> Option<String> {
        self.inner
            .lock()
            .current
            .as_ref()
            .map(|instruction| instruction.message().to_string())
    }

    /// Last line number used
    pub fn line_number(&self) -> u64 {
        self.inner.lock().line_number
    }

    /// Number of checksummed sends retained
    pub fn history_len(&self) -> usize {
        self.inner.lock().history.len()
    }

    /// Whether the planner is believed to be fed
    pub fn is_planner_fed(&self) -> bool {
        self.inner.lock().planner.is_fed()
    }

    /// Current planner-fed threshold
    pub fn planner_threshold(&self) -> Duration {
        self.inner.lock().planner.threshold()
    }

    /// Persist the planner threshold
    pub fn save_planner_threshold(&self, path: &Path) -> io::Result<bool> {
        self.inner.lock().planner.save(path)
    }

    /// Renew the liveness timer on firmware chatter
    ///
    /// Progress is not renewed, so instructions with a strict timeout still
    /// time out while the firmware only reports being busy.
    pub fn renew_timeout(&self) {
        self.inner.lock().renew_activity(true);
    }

    /// How long the queue has been waiting for the firmware
    ///
    /// Zero while idle.
    pub fn current_delay(&self) -> Duration {
        let inner = self.inner.lock();
        match &inner.current {
            None if inner.is_empty() => Duration::ZERO,
            Some(current) if current.has_strict_timeout() => inner.last_progress.elapsed(),
            _ => inner.last_activity.elapsed(),
        }
    }

    /// Count a stall and re-send the in-flight instruction
    ///
    /// Returns the number of consecutive stalls so far.
    pub fn record_stall(&self) -> u32 {
        self.locked(|inner| {
            inner.stalls += 1;
            self.rx_lost(inner);
            inner.renew_activity(false);
            inner.last_progress = Instant::now();
            inner.stalls
        })
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SerialQueue")
            .field("queue", &inner.queue.len())
            .field("priority_queue", &inner.priority_queue.len())
            .field("recovery_list", &inner.recovery_list.len())
            .field("current", &inner.current)
            .field("line_number", &inner.line_number)
            .finish()
    }
}
