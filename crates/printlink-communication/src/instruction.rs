//! Instructions
//!
//! An instruction is one G-code line travelling through the serial queue.
//! Its kind decides which printer output it captures and whether it agrees
//! to be confirmed. The caller keeps an [`InstructionHandle`] and waits on it
//! while the queue owns the instruction itself.

use parking_lot::{Condvar, Mutex};
use printlink_core::{ProtocolError, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::protocol::framing;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Pattern capturing any output line
pub fn any_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^.*$").expect("invalid regex pattern"))
}

/// A captured output line with its named groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    /// The whole line
    pub line: String,
    /// Named capture groups that participated in the match
    pub groups: HashMap<String, String>,
}

impl Captured {
    fn from_match(pattern: &Regex, line: &str) -> Option<Self> {
        let captures = pattern.captures(line)?;
        let groups = pattern
            .capture_names()
            .flatten()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|value| (name.to_string(), value.as_str().to_string()))
            })
            .collect();
        Some(Self {
            line: line.to_string(),
            groups,
        })
    }

    /// Value of a named group
    pub fn group(&self, name: &str) -> Option<&str> {
        self.groups.get(name).map(String::as_str)
    }
}

/// Progress of a collecting instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectPhase {
    /// The begin marker has not been seen
    Waiting,
    /// Between the begin and end markers
    Collecting,
    /// The end marker was seen
    Ended,
}

/// How an instruction captures output and decides it is done
#[derive(Debug, Clone)]
pub enum InstructionKind {
    /// Confirms on any acknowledgement
    Plain,
    /// Records output matching `pattern`; refuses confirmation without a
    /// capture when `mandatory`
    Matchable {
        /// Pattern of the lines to capture
        pattern: Regex,
        /// Whether an empty capture list refuses confirmation
        mandatory: bool,
    },
    /// Records `capture` matches between `begin` and `end`; refuses
    /// confirmation until `end` was seen
    Collecting {
        /// Start marker
        begin: Regex,
        /// Pattern of the lines to capture
        capture: Regex,
        /// End marker
        end: Regex,
        /// Current phase
        phase: CollectPhase,
    },
}

/// What the caller gets back once an instruction is retired
#[derive(Debug, Clone)]
pub struct ConfirmedInstruction {
    /// The instruction message
    pub message: String,
    /// Captured output, in arrival order
    pub captured: Vec<Captured>,
    /// Time from send to confirmation
    pub time_to_confirm: Option<Duration>,
    /// Whether the queue retired it without a real acknowledgement
    pub forced: bool,
}

impl ConfirmedInstruction {
    /// Captured output at `index`
    pub fn matched(&self, index: usize) -> Option<&Captured> {
        self.captured.get(index)
    }
}

#[derive(Default)]
struct CompletionState {
    sent: bool,
    outcome: Option<Arc<ConfirmedInstruction>>,
}

#[derive(Default)]
struct Completion {
    state: Mutex<CompletionState>,
    changed: Condvar,
}

impl Completion {
    fn update(&self, apply: impl FnOnce(&mut CompletionState)) {
        let mut state = self.state.lock();
        apply(&mut state);
        self.changed.notify_all();
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(&CompletionState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !done(&state) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return done(&state);
            }
        }
        true
    }
}

/// Caller-side view of an enqueued instruction
#[derive(Clone)]
pub struct InstructionHandle {
    id: u64,
    message: Arc<str>,
    completion: Arc<Completion>,
}

impl InstructionHandle {
    /// Unique instruction id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The instruction message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the payload has been written
    pub fn is_sent(&self) -> bool {
        self.completion.state.lock().sent
    }

    /// Whether the instruction has been retired
    pub fn is_confirmed(&self) -> bool {
        self.completion.state.lock().outcome.is_some()
    }

    /// The retired instruction, once confirmed
    pub fn outcome(&self) -> Option<Arc<ConfirmedInstruction>> {
        self.completion.state.lock().outcome.clone()
    }

    /// Block until sent or `timeout` passes
    pub fn wait_for_send(&self, timeout: Duration) -> bool {
        self.completion
            .wait_until(timeout, |state| state.sent || state.outcome.is_some())
    }

    /// Block until confirmed or `timeout` passes
    pub fn wait_for_confirmation_timeout(&self, timeout: Duration) -> bool {
        self.completion
            .wait_until(timeout, |state| state.outcome.is_some())
    }

    /// Block until confirmed, re-checking `should_keep_waiting` every `poll`
    ///
    /// Returns false if the predicate gave up before the confirmation.
    pub fn wait_for_confirmation<F>(&self, poll: Duration, should_keep_waiting: F) -> bool
    where
        F: Fn() -> bool,
    {
        loop {
            if self.wait_for_confirmation_timeout(poll) {
                return true;
            }
            if !should_keep_waiting() {
                return self.is_confirmed();
            }
        }
    }
}

impl fmt::Debug for InstructionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionHandle")
            .field("id", &self.id)
            .field("message", &self.message)
            .field("sent", &self.is_sent())
            .field("confirmed", &self.is_confirmed())
            .finish()
    }
}

/// One G-code line and its lifecycle
pub struct Instruction {
    id: u64,
    message: Arc<str>,
    to_checksum: bool,
    strict_timeout: bool,
    kind: InstructionKind,
    payload: Option<Vec<u8>>,
    captured: Vec<Captured>,
    sent: bool,
    confirmed: bool,
    sent_at: Option<Instant>,
    time_to_confirm: Option<Duration>,
    completion: Arc<Completion>,
}

impl Instruction {
    /// Create an instruction of the given kind
    ///
    /// Fails if the message contains a line break.
    pub fn new(message: impl Into<String>, kind: InstructionKind) -> Result<Self> {
        let message = message.into();
        if message.contains('\n') {
            return Err(ProtocolError::EmbeddedNewline { message }.into());
        }
        Ok(Self::build(&message, kind, None))
    }

    fn build(message: &str, kind: InstructionKind, payload: Option<Vec<u8>>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            message: message.into(),
            to_checksum: payload.is_some(),
            strict_timeout: false,
            kind,
            payload,
            captured: Vec::new(),
            sent: false,
            confirmed: false,
            sent_at: None,
            time_to_confirm: None,
            completion: Arc::new(Completion::default()),
        }
    }

    /// Plain instruction from a fixed, single-line message
    pub(crate) fn internal(message: &'static str) -> Self {
        debug_assert!(!message.contains('\n'));
        Self::build(message, InstructionKind::Plain, None)
    }

    /// Instruction confirmed by any acknowledgement
    pub fn plain(message: impl Into<String>) -> Result<Self> {
        Self::new(message, InstructionKind::Plain)
    }

    /// Instruction capturing output matching `pattern`
    pub fn matchable(message: impl Into<String>, pattern: Regex) -> Result<Self> {
        Self::new(
            message,
            InstructionKind::Matchable {
                pattern,
                mandatory: false,
            },
        )
    }

    /// Instruction that refuses confirmation until `pattern` matched output
    pub fn mandatory_matchable(message: impl Into<String>, pattern: Regex) -> Result<Self> {
        Self::new(
            message,
            InstructionKind::Matchable {
                pattern,
                mandatory: true,
            },
        )
    }

    /// Instruction collecting `capture` lines between `begin` and `end`
    pub fn collecting(
        message: impl Into<String>,
        begin: Regex,
        capture: Regex,
        end: Regex,
    ) -> Result<Self> {
        Self::new(
            message,
            InstructionKind::Collecting {
                begin,
                capture,
                end,
                phase: CollectPhase::Waiting,
            },
        )
    }

    /// Re-transmission of an already framed line
    pub(crate) fn recovered(message: &str, payload: Vec<u8>) -> Self {
        Self::build(message, InstructionKind::Plain, Some(payload))
    }

    /// Request line-number and checksum framing
    pub fn with_checksum(mut self) -> Self {
        self.to_checksum = true;
        self
    }

    /// Measure this instruction against the progress timer only
    pub fn with_strict_timeout(mut self) -> Self {
        self.strict_timeout = true;
        self
    }

    /// Handle for waiting on this instruction
    pub fn handle(&self) -> InstructionHandle {
        InstructionHandle {
            id: self.id,
            message: Arc::clone(&self.message),
            completion: Arc::clone(&self.completion),
        }
    }

    /// Unique instruction id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The message text
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether it is sent with a line number and checksum
    pub fn is_checksummed(&self) -> bool {
        self.to_checksum
    }

    /// Whether the watchdog measures it against the progress timer
    pub fn has_strict_timeout(&self) -> bool {
        self.strict_timeout
    }

    /// The kind of this instruction
    pub fn kind(&self) -> &InstructionKind {
        &self.kind
    }

    /// Patterns whose matches this instruction wants to see
    pub fn capture_patterns(&self) -> Vec<&Regex> {
        match &self.kind {
            InstructionKind::Plain => Vec::new(),
            InstructionKind::Matchable { pattern, .. } => vec![pattern],
            InstructionKind::Collecting {
                begin, capture, end, ..
            } => vec![begin, capture, end],
        }
    }

    /// Whether `pattern` is among the capture patterns
    pub fn captures_pattern(&self, pattern: &Regex) -> bool {
        self.capture_patterns()
            .iter()
            .any(|own| own.as_str() == pattern.as_str())
    }

    /// The rendered payload, if rendered
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Whether the payload has been rendered
    pub fn is_rendered(&self) -> bool {
        self.payload.is_some()
    }

    /// Render the payload, framed with `line_number` when checksummed
    ///
    /// Rendering happens once. Later calls keep the first payload.
    pub fn render(&mut self, line_number: u64) -> &[u8] {
        let payload = match self.payload.take() {
            Some(payload) => payload,
            None if self.to_checksum => framing::render_framed(&self.message, line_number),
            None => framing::render_plain(&self.message),
        };
        self.payload.insert(payload)
    }

    /// Output captured so far
    pub fn captured(&self) -> &[Captured] {
        &self.captured
    }

    /// Offer an output line to this instruction
    pub fn output_captured(&mut self, line: &str) {
        match &mut self.kind {
            InstructionKind::Plain => {}
            InstructionKind::Matchable { pattern, .. } => {
                if let Some(captured) = Captured::from_match(pattern, line) {
                    self.captured.push(captured);
                }
            }
            InstructionKind::Collecting {
                begin,
                capture,
                end,
                phase,
            } => {
                // The end marker is checked first so it is not collected
                if *phase == CollectPhase::Collecting && end.is_match(line) {
                    *phase = CollectPhase::Ended;
                }
                if *phase == CollectPhase::Collecting {
                    if let Some(captured) = Captured::from_match(capture, line) {
                        self.captured.push(captured);
                    }
                }
                if *phase == CollectPhase::Waiting && begin.is_match(line) {
                    *phase = CollectPhase::Collecting;
                }
            }
        }
    }

    /// Mark as written
    pub fn mark_sent(&mut self) {
        self.sent = true;
        self.sent_at = Some(Instant::now());
        self.completion.update(|state| state.sent = true);
    }

    /// Forget the send so the payload can go out again
    pub fn reset(&mut self) {
        self.sent = false;
        self.sent_at = None;
        self.completion.update(|state| state.sent = false);
    }

    /// Whether the payload has been written
    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Whether the instruction accepted a confirmation
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// When the payload was written
    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    /// Time from send to confirmation
    pub fn time_to_confirm(&self) -> Option<Duration> {
        self.time_to_confirm
    }

    fn accepts_confirmation(&self) -> bool {
        match &self.kind {
            InstructionKind::Plain => true,
            InstructionKind::Matchable { mandatory, .. } => !mandatory || !self.captured.is_empty(),
            InstructionKind::Collecting { phase, .. } => *phase == CollectPhase::Ended,
        }
    }

    /// Try to confirm
    ///
    /// Returns false if the instruction refuses. `force` always succeeds and
    /// wakes the waiters with a forced outcome.
    pub fn confirm(&mut self, force: bool) -> bool {
        if self.confirmed {
            return true;
        }
        if !force && !self.accepts_confirmation() {
            tracing::warn!(
                "Instruction {:?} did not capture its expected output, refusing confirmation",
                self.message
            );
            return false;
        }

        self.confirmed = true;
        self.time_to_confirm = self.sent_at.map(|sent_at| sent_at.elapsed());
        let outcome = Arc::new(ConfirmedInstruction {
            message: self.message.to_string(),
            captured: self.captured.clone(),
            time_to_confirm: self.time_to_confirm,
            forced: force,
        });
        self.completion.update(|state| state.outcome = Some(outcome));
        true
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instruction {:?}", self.message)
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instruction")
            .field("id", &self.id)
            .field("message", &self.message)
            .field("to_checksum", &self.to_checksum)
            .field("sent", &self.sent)
            .field("confirmed", &self.confirmed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regex(source: &str) -> Regex {
        Regex::new(source).expect("regex")
    }

    #[test]
    fn test_rejects_newline() {
        assert!(Instruction::plain("G28\nG29").is_err());
    }

    #[test]
    fn test_payload_rendered_once() {
        let mut instruction = Instruction::plain("G1 X10").expect("valid").with_checksum();
        assert!(!instruction.is_rendered());
        let first = instruction.render(5).to_vec();
        assert_eq!(first, b"N5 G1 X10 *116\n".to_vec());
        let second = instruction.render(6).to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn test_plain_payload() {
        let mut instruction = Instruction::plain("M105").expect("valid");
        assert_eq!(instruction.render(9), b"M105\n");
    }

    #[test]
    fn test_mandatory_refuses_without_capture() {
        let mut instruction =
            Instruction::mandatory_matchable("M115", regex(r"^FIRMWARE_NAME:(?P<name>.*)$"))
                .expect("valid");
        let handle = instruction.handle();
        instruction.mark_sent();
        assert!(!instruction.confirm(false));
        assert!(!handle.is_confirmed());

        instruction.output_captured("FIRMWARE_NAME:Marlin");
        assert!(instruction.confirm(false));
        let outcome = handle.outcome().expect("confirmed");
        assert_eq!(outcome.matched(0).and_then(|c| c.group("name")), Some("Marlin"));
        assert!(!outcome.forced);
    }

    #[test]
    fn test_force_overrides_refusal() {
        let mut instruction =
            Instruction::mandatory_matchable("M27", regex(r"^SD printing")).expect("valid");
        let handle = instruction.handle();
        assert!(instruction.confirm(true));
        assert!(handle.outcome().expect("confirmed").forced);
    }

    #[test]
    fn test_collecting_phases() {
        let mut instruction = Instruction::collecting(
            "M20",
            regex(r"^Begin file list$"),
            regex(r"^(?P<name>\S+) (?P<size>\d+)$"),
            regex(r"^End file list$"),
        )
        .expect("valid");

        instruction.output_captured("IGNORED 12");
        instruction.output_captured("Begin file list");
        instruction.output_captured("A.GCO 100");
        assert!(!instruction.confirm(false));
        instruction.output_captured("B.GCO 200");
        instruction.output_captured("End file list");
        instruction.output_captured("C.GCO 300");

        assert_eq!(instruction.captured().len(), 2);
        assert_eq!(instruction.captured()[1].group("size"), Some("200"));
        assert!(instruction.confirm(false));
    }

    #[test]
    fn test_wait_for_confirmation_gives_up() {
        let instruction = Instruction::plain("G4 S1").expect("valid");
        let handle = instruction.handle();
        let confirmed = handle.wait_for_confirmation(Duration::from_millis(5), || false);
        assert!(!confirmed);
    }

    #[test]
    fn test_wait_across_threads() {
        let mut instruction = Instruction::plain("G28").expect("valid");
        let handle = instruction.handle();
        let waiter = std::thread::spawn(move || {
            handle.wait_for_confirmation(Duration::from_millis(10), || true)
        });
        instruction.mark_sent();
        assert!(instruction.confirm(false));
        assert!(waiter.join().expect("waiter thread"));
    }
}
