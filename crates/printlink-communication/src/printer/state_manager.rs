//! State Manager
//!
//! Derives the printer state from what the firmware prints. Three layers
//! are kept: a base state (ready or busy), an optional printing overlay and
//! an optional override (attention or error). The reported state is the
//! topmost layer that is set.
//!
//! Each trigger installs a default expectation unless a caller already
//! installed one, so that a visible change can be attributed to a source.
//! The first visible change consumes the expectation.

use parking_lot::{Mutex, MutexGuard, ReentrantMutex};
use printlink_core::{
    EventBus, LinkEvent, PrinterState, Source, StateChange, StateEvent, StateSnapshot,
    StateTransition,
};
use regex::Regex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::protocol::patterns;
use crate::router::{HandlerId, LineRouter};

/// Number of reported states remembered
pub const STATE_HISTORY_SIZE: usize = 10;

#[derive(Debug)]
struct StateInner {
    base: PrinterState,
    printing: Option<PrinterState>,
    override_state: Option<PrinterState>,
    last: PrinterState,
    current: PrinterState,
    expected: Option<StateChange>,
    fan_error_name: Option<String>,
    unsure_whether_printing: bool,
    error_count: u32,
    history: VecDeque<PrinterState>,
}

impl StateInner {
    fn new() -> Self {
        let mut history = VecDeque::with_capacity(STATE_HISTORY_SIZE);
        history.push_back(PrinterState::Ready);
        Self {
            base: PrinterState::Ready,
            printing: None,
            override_state: None,
            last: PrinterState::Ready,
            current: PrinterState::Ready,
            expected: None,
            fan_error_name: None,
            unsure_whether_printing: true,
            error_count: 0,
            history,
        }
    }

    fn reported(&self) -> PrinterState {
        self.override_state
            .or(self.printing)
            .unwrap_or(self.base)
    }

    fn state_may_have_changed(&mut self) -> Option<StateTransition> {
        let state = self.reported();
        if state == self.current {
            return None;
        }

        self.last = self.current;
        self.current = state;
        self.history.push_back(state);
        while self.history.len() > STATE_HISTORY_SIZE {
            self.history.pop_front();
        }

        let (command_id, source, reason) = match self.expected.take() {
            Some(expected) if expected.covers(self.last, self.current) => (
                expected.command_id,
                expected.attribute(self.last, self.current),
                expected.reason,
            ),
            _ => {
                tracing::debug!(
                    "Unexpected state change from {} to {}",
                    self.last,
                    self.current
                );
                (None, None, None)
            }
        };

        Some(StateTransition {
            from: self.last,
            to: self.current,
            command_id,
            source,
            reason,
            timestamp: chrono::Utc::now(),
        })
    }
}

/// Holds the state lock with a default expectation installed
///
/// The default is installed only when no expectation is live, and removed
/// again on drop only if this guard installed it.
struct Influence<'a> {
    inner: MutexGuard<'a, StateInner>,
    installed: bool,
}

impl<'a> Influence<'a> {
    fn new(mut inner: MutexGuard<'a, StateInner>, default: StateChange) -> Self {
        let installed = inner.expected.is_none();
        if installed {
            inner.expected = Some(default);
        } else {
            tracing::trace!("Default expected state change is overridden");
        }
        Self { inner, installed }
    }
}

impl Deref for Influence<'_> {
    type Target = StateInner;

    fn deref(&self) -> &StateInner {
        &self.inner
    }
}

impl DerefMut for Influence<'_> {
    fn deref_mut(&mut self) -> &mut StateInner {
        &mut self.inner
    }
}

impl Drop for Influence<'_> {
    fn drop(&mut self) {
        if self.installed {
            self.inner.expected = None;
        }
    }
}

/// Observed printer state machine
pub struct StateManager {
    inner: Mutex<StateInner>,
    emit: ReentrantMutex<()>,
    bus: Arc<EventBus>,
}

impl StateManager {
    /// Create a manager reporting `Ready`
    ///
    /// It starts unsure whether a print is already running, see
    /// [`resolve_printing_uncertainty`](Self::resolve_printing_uncertainty).
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(StateInner::new()),
            emit: ReentrantMutex::new(()),
            bus,
        }
    }

    /// Register the firmware output handlers
    pub fn register(self: &Arc<Self>, router: &LineRouter) -> Vec<(Regex, HandlerId)> {
        type Trigger = fn(&StateManager);
        let triggers: [(&'static Regex, Trigger); 8] = [
            (patterns::busy(), StateManager::busy),
            (patterns::attention(), StateManager::attention),
            (patterns::paused(), StateManager::paused),
            (patterns::resumed(), StateManager::resumed),
            (patterns::cancel(), StateManager::not_printing),
            (patterns::print_start(), StateManager::printing),
            (patterns::print_done(), StateManager::finished),
            (patterns::error(), StateManager::error),
        ];

        let mut handlers = Vec::with_capacity(triggers.len() + 1);
        for (pattern, trigger) in triggers {
            let manager = Arc::clone(self);
            let id = router.register(pattern, 0, move |_, _| trigger(&manager));
            handlers.push((pattern.clone(), id));
        }

        let manager = Arc::clone(self);
        let id = router.register(patterns::fan_error(), 0, move |_, captures| {
            if let Some(name) = captures.name("fan_name") {
                manager.fan_error(name.as_str());
            }
        });
        handlers.push((patterns::fan_error().clone(), id));
        handlers
    }

    fn influence(&self, default: StateChange, body: impl FnOnce(&mut StateInner)) {
        let _emit = self.emit.lock();
        let transition = {
            let mut influence = Influence::new(self.inner.lock(), default);
            body(&mut influence);
            influence.state_may_have_changed()
        };

        if let Some(transition) = transition {
            tracing::info!("State changed: {}", transition);
            self.bus
                .publish(LinkEvent::State(StateEvent::Changed(transition)))
                .ok();
        }
    }

    /// The reported state
    pub fn get_state(&self) -> PrinterState {
        self.inner.lock().reported()
    }

    /// The previously reported state
    pub fn last_state(&self) -> PrinterState {
        self.inner.lock().last
    }

    /// Point-in-time copy of all layers
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock();
        StateSnapshot {
            state: inner.reported(),
            base: inner.base,
            printing: inner.printing,
            override_state: inner.override_state,
            unsure_whether_printing: inner.unsure_whether_printing,
            error_count: inner.error_count,
            history: inner.history.iter().copied().collect(),
        }
    }

    /// Install an expectation for the next visible change
    pub fn expect_change(&self, change: StateChange) {
        self.inner.lock().expected = Some(change);
    }

    /// Drop the live expectation
    pub fn stop_expecting_change(&self) {
        self.inner.lock().expected = None;
    }

    /// The live expectation, if any
    pub fn expected_change(&self) -> Option<StateChange> {
        self.inner.lock().expected.clone()
    }

    /// Whether a print may be running that was started before we attached
    pub fn is_unsure_whether_printing(&self) -> bool {
        self.inner.lock().unsure_whether_printing
    }

    /// Settle the startup uncertainty with the printer's own answer
    pub fn resolve_printing_uncertainty(&self, is_printing: bool) {
        if is_printing {
            self.printing();
        } else {
            self.not_printing();
        }
        self.inner.lock().unsure_whether_printing = false;
    }

    /// Firmware reports a long-running command
    pub fn busy(&self) {
        self.influence(
            StateChange::new().to(PrinterState::Busy, Source::Firmware),
            |inner| {
                if inner.base == PrinterState::Ready {
                    inner.base = PrinterState::Busy;
                }
            },
        );
    }

    /// An instruction was acknowledged, clearing transient states
    pub fn instruction_confirmed(&self) {
        self.influence(
            StateChange::new()
                .to(PrinterState::Ready, Source::Firmware)
                .from(PrinterState::Attention, Source::User)
                .from(PrinterState::Error, Source::User)
                .from(PrinterState::Busy, Source::Firmware),
            |inner| {
                if inner.unsure_whether_printing {
                    return;
                }
                if inner.base == PrinterState::Busy {
                    inner.base = PrinterState::Ready;
                }
                if matches!(
                    inner.printing,
                    Some(PrinterState::Finished | PrinterState::Stopped)
                ) {
                    inner.printing = None;
                }
                let keeps_error =
                    inner.override_state == Some(PrinterState::Error) && inner.error_count > 0;
                if inner.override_state.is_some() && !keeps_error {
                    tracing::debug!("No longer having state {:?}", inner.override_state);
                    inner.override_state = None;
                }
            },
        );
    }

    /// A print started
    pub fn printing(&self) {
        self.influence(
            StateChange::new().to(PrinterState::Printing, Source::User),
            |inner| {
                if inner.printing.is_none() {
                    inner.unsure_whether_printing = false;
                    inner.printing = Some(PrinterState::Printing);
                } else {
                    tracing::debug!(
                        "Ignoring switch to PRINTING, base {}, printing {:?}",
                        inner.base,
                        inner.printing
                    );
                }
            },
        );
    }

    /// The print was cancelled or there is none
    pub fn not_printing(&self) {
        self.influence(
            StateChange::new()
                .from(PrinterState::Printing, Source::Firmware)
                .from(PrinterState::Paused, Source::Firmware)
                .from(PrinterState::Finished, Source::Firmware),
            |inner| {
                inner.unsure_whether_printing = false;
                inner.printing = None;
            },
        );
    }

    /// The print completed
    pub fn finished(&self) {
        self.influence(
            StateChange::new().to(PrinterState::Finished, Source::Firmware),
            |inner| {
                if inner.printing == Some(PrinterState::Printing) {
                    inner.printing = Some(PrinterState::Finished);
                }
            },
        );
    }

    /// The print was paused
    pub fn paused(&self) {
        self.influence(
            StateChange::new().to(PrinterState::Paused, Source::User),
            |inner| {
                if matches!(inner.printing, None | Some(PrinterState::Printing)) {
                    inner.unsure_whether_printing = false;
                    inner.printing = Some(PrinterState::Paused);
                }
            },
        );
    }

    /// The print was resumed
    pub fn resumed(&self) {
        self.influence(
            StateChange::new().to(PrinterState::Printing, Source::User),
            |inner| {
                if inner.printing == Some(PrinterState::Paused) {
                    inner.unsure_whether_printing = false;
                    inner.printing = Some(PrinterState::Printing);
                }
            },
        );
    }

    /// A caller stopped the print
    pub fn stopped(&self) {
        self.influence(
            StateChange::new().from(PrinterState::Printing, Source::User),
            |inner| {
                if matches!(
                    inner.printing,
                    Some(PrinterState::Printing | PrinterState::Paused)
                ) {
                    inner.unsure_whether_printing = false;
                    inner.printing = Some(PrinterState::Stopped);
                }
            },
        );
    }

    /// A fan reported a failure; the following attention names it
    pub fn fan_error(&self, fan_name: &str) {
        self.inner.lock().fan_error_name = Some(fan_name.to_string());
    }

    /// The printer waits for the user
    pub fn attention(&self) {
        self.influence(
            StateChange::new().to(PrinterState::Attention, Source::User),
            |inner| {
                if let Some(fan) = inner.fan_error_name.take() {
                    tracing::debug!("{} fan error observed before, reporting it now", fan);
                    inner.expected = Some(
                        StateChange::new()
                            .to(PrinterState::Attention, Source::Firmware)
                            .with_reason(format!("{} fan error", fan)),
                    );
                }
                inner.override_state = Some(PrinterState::Attention);
            },
        );
    }

    /// The printer halted on an error
    pub fn error(&self) {
        self.influence(
            StateChange::new().to(PrinterState::Error, Source::External),
            |inner| inner.override_state = Some(PrinterState::Error),
        );
    }

    /// The serial link broke
    pub fn serial_error(&self) {
        self.influence(
            StateChange::new().to(PrinterState::Error, Source::Serial),
            |inner| inner.override_state = Some(PrinterState::Error),
        );
    }

    /// The serial link recovered
    pub fn serial_error_resolved(&self) {
        self.influence(
            StateChange::new().to(PrinterState::Ready, Source::Serial),
            |inner| {
                if inner.override_state == Some(PrinterState::Error) {
                    inner.override_state = None;
                }
            },
        );
    }

    /// Count a newly detected error and enter the error state
    pub fn error_detected(&self) {
        {
            let mut inner = self.inner.lock();
            inner.error_count += 1;
            tracing::debug!("Error count increased to {}", inner.error_count);
        }
        self.error();
    }

    /// Count a resolved error
    ///
    /// The error state is left by the next acknowledgement once no error
    /// remains.
    pub fn error_resolved(&self) {
        let mut inner = self.inner.lock();
        inner.error_count = inner.error_count.saturating_sub(1);
        tracing::debug!("Error count decreased to {}", inner.error_count);
    }

    /// The printer rebooted
    ///
    /// It is not ready yet and cannot be printing anymore.
    pub fn reset(&self) {
        self.busy();
        self.not_printing();
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("state", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> StateManager {
        let manager = StateManager::new(Arc::new(EventBus::new()));
        manager.resolve_printing_uncertainty(false);
        manager
    }

    #[test]
    fn test_initial_state() {
        let manager = StateManager::new(Arc::new(EventBus::new()));
        assert_eq!(manager.get_state(), PrinterState::Ready);
        assert!(manager.is_unsure_whether_printing());
    }

    #[test]
    fn test_unsure_ignores_confirmation() {
        let manager = StateManager::new(Arc::new(EventBus::new()));
        manager.busy();
        manager.instruction_confirmed();
        assert_eq!(manager.get_state(), PrinterState::Busy);

        manager.resolve_printing_uncertainty(false);
        manager.instruction_confirmed();
        assert_eq!(manager.get_state(), PrinterState::Ready);
    }

    #[test]
    fn test_layers_precedence() {
        let manager = manager();
        manager.busy();
        manager.printing();
        assert_eq!(manager.get_state(), PrinterState::Printing);
        manager.attention();
        assert_eq!(manager.get_state(), PrinterState::Attention);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.base, PrinterState::Busy);
        assert_eq!(snapshot.printing, Some(PrinterState::Printing));
        assert_eq!(snapshot.override_state, Some(PrinterState::Attention));
    }

    #[test]
    fn test_default_expectation_is_removed() {
        let manager = manager();
        manager.finished();
        assert!(manager.expected_change().is_none());
    }

    #[test]
    fn test_caller_expectation_survives_no_change() {
        let manager = manager();
        manager.expect_change(StateChange::new().with_command_id(3));
        manager.finished();
        assert_eq!(
            manager.expected_change().and_then(|change| change.command_id),
            Some(3)
        );
    }

    #[test]
    fn test_error_needs_resolution() {
        let manager = manager();
        manager.error_detected();
        assert_eq!(manager.get_state(), PrinterState::Error);

        manager.instruction_confirmed();
        assert_eq!(manager.get_state(), PrinterState::Error);

        manager.error_resolved();
        manager.instruction_confirmed();
        assert_eq!(manager.get_state(), PrinterState::Ready);
    }

    #[test]
    fn test_history_is_bounded() {
        let manager = manager();
        for _ in 0..20 {
            manager.printing();
            manager.not_printing();
        }
        let history = manager.snapshot().history;
        assert_eq!(history.len(), STATE_HISTORY_SIZE);
        assert_eq!(history.last(), Some(&PrinterState::Ready));
    }
}
