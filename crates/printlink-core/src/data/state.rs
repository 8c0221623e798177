//! Printer state vocabulary
//!
//! The observable printer state is derived from three layers kept by the
//! state manager: a base state set by the firmware, an optional printing
//! overlay and an optional override. The types here describe those layers,
//! the expectations callers install before acting, and the transitions that
//! get reported.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Externally visible printer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrinterState {
    /// Idle and accepting commands
    Ready,
    /// Firmware is processing a long-running command
    Busy,
    /// A print is running
    Printing,
    /// The running print is paused
    Paused,
    /// The last print completed
    Finished,
    /// The last print was stopped by a caller
    Stopped,
    /// The printer waits for the user
    Attention,
    /// The printer halted on an error
    Error,
}

impl PrinterState {
    /// States that may live in the base layer
    pub fn is_base(self) -> bool {
        matches!(self, PrinterState::Ready | PrinterState::Busy)
    }

    /// States that may live in the printing overlay
    pub fn is_printing_overlay(self) -> bool {
        matches!(
            self,
            PrinterState::Printing
                | PrinterState::Paused
                | PrinterState::Finished
                | PrinterState::Stopped
        )
    }

    /// States that may live in the override layer
    pub fn is_override(self) -> bool {
        matches!(self, PrinterState::Attention | PrinterState::Error)
    }
}

impl fmt::Display for PrinterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrinterState::Ready => write!(f, "READY"),
            PrinterState::Busy => write!(f, "BUSY"),
            PrinterState::Printing => write!(f, "PRINTING"),
            PrinterState::Paused => write!(f, "PAUSED"),
            PrinterState::Finished => write!(f, "FINISHED"),
            PrinterState::Stopped => write!(f, "STOPPED"),
            PrinterState::Attention => write!(f, "ATTENTION"),
            PrinterState::Error => write!(f, "ERROR"),
        }
    }
}

/// Who caused a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    /// A person at the printer or a caller acting for one
    User,
    /// The firmware on its own
    Firmware,
    /// A remote or supervising component
    External,
    /// The serial link itself
    Serial,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::User => write!(f, "USER"),
            Source::Firmware => write!(f, "FIRMWARE"),
            Source::External => write!(f, "EXTERNAL"),
            Source::Serial => write!(f, "SERIAL"),
        }
    }
}

/// An anticipated state change
///
/// Installed before an action that is likely to move the printer into
/// another state, so the resulting transition can be attributed. Built with
/// the chained setters:
///
/// ```
/// use printlink_core::{PrinterState, Source, StateChange};
///
/// let change = StateChange::new()
///     .to(PrinterState::Printing, Source::User)
///     .with_command_id(42);
/// assert_eq!(change.to_states.get(&PrinterState::Printing), Some(&Source::User));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// Command the change belongs to, if any
    pub command_id: Option<u64>,
    /// Source to report when entering a state
    pub to_states: HashMap<PrinterState, Source>,
    /// Source to report when leaving a state
    pub from_states: HashMap<PrinterState, Source>,
    /// Source to report when no state mapping applies
    pub default_source: Option<Source>,
    /// Free-form reason attached to the report
    pub reason: Option<String>,
}

impl StateChange {
    /// Create an empty expectation
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute entering `state` to `source`
    pub fn to(mut self, state: PrinterState, source: Source) -> Self {
        self.to_states.insert(state, source);
        self
    }

    /// Attribute leaving `state` to `source`
    pub fn from(mut self, state: PrinterState, source: Source) -> Self {
        self.from_states.insert(state, source);
        self
    }

    /// Set the fallback source
    pub fn with_default_source(mut self, source: Source) -> Self {
        self.default_source = Some(source);
        self
    }

    /// Tie the change to a command
    pub fn with_command_id(mut self, command_id: u64) -> Self {
        self.command_id = Some(command_id);
        self
    }

    /// Attach a reason
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Whether this expectation covers a change from `last` to `current`
    pub fn covers(&self, last: PrinterState, current: PrinterState) -> bool {
        self.to_states.contains_key(&current)
            || self.from_states.contains_key(&last)
            || self.default_source.is_some()
    }

    /// Resolve the source of a visible change from `last` to `current`
    ///
    /// Leaving a state outranks entering one when both are mapped to
    /// different sources.
    pub fn attribute(&self, last: PrinterState, current: PrinterState) -> Option<Source> {
        let to_source = self.to_states.get(&current).copied();
        let from_source = self.from_states.get(&last).copied();
        match (from_source, to_source) {
            (Some(from), Some(_)) => Some(from),
            (Some(from), None) => Some(from),
            (None, Some(to)) => Some(to),
            (None, None) => self.default_source,
        }
    }
}

/// A reported, attributed state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previously reported state
    pub from: PrinterState,
    /// Newly reported state
    pub to: PrinterState,
    /// Command that caused the transition, if known
    pub command_id: Option<u64>,
    /// Attributed source; `None` for unexpected transitions
    pub source: Option<Source>,
    /// Reason attached by the expectation
    pub reason: Option<String>,
    /// When the transition was observed
    pub timestamp: DateTime<Utc>,
}

impl StateTransition {
    /// Whether no expectation explained this transition
    pub fn is_unexpected(&self) -> bool {
        self.source.is_none()
    }
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)?;
        match self.source {
            Some(source) => write!(f, " by {}", source)?,
            None => write!(f, " (unexpected)")?,
        }
        if let Some(command_id) = self.command_id {
            write!(f, " cmd {}", command_id)?;
        }
        if let Some(reason) = &self.reason {
            write!(f, ": {}", reason)?;
        }
        Ok(())
    }
}

/// Point-in-time copy of the state manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Reported state
    pub state: PrinterState,
    /// Base layer
    pub base: PrinterState,
    /// Printing overlay
    pub printing: Option<PrinterState>,
    /// Override layer
    pub override_state: Option<PrinterState>,
    /// Whether a print may already be running unseen
    pub unsure_whether_printing: bool,
    /// Number of unresolved errors
    pub error_count: u32,
    /// Recently reported states, oldest first
    pub history: Vec<PrinterState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layers() {
        assert!(PrinterState::Ready.is_base());
        assert!(PrinterState::Busy.is_base());
        assert!(PrinterState::Finished.is_printing_overlay());
        assert!(PrinterState::Stopped.is_printing_overlay());
        assert!(PrinterState::Error.is_override());
        assert!(!PrinterState::Printing.is_override());
    }

    #[test]
    fn test_attribution_prefers_leaving() {
        let change = StateChange::new()
            .to(PrinterState::Ready, Source::Firmware)
            .from(PrinterState::Attention, Source::User);
        assert_eq!(
            change.attribute(PrinterState::Attention, PrinterState::Ready),
            Some(Source::User)
        );
        assert_eq!(
            change.attribute(PrinterState::Busy, PrinterState::Ready),
            Some(Source::Firmware)
        );
    }

    #[test]
    fn test_attribution_fallbacks() {
        let change = StateChange::new().with_default_source(Source::External);
        assert_eq!(
            change.attribute(PrinterState::Ready, PrinterState::Busy),
            Some(Source::External)
        );
        assert_eq!(
            StateChange::new().attribute(PrinterState::Ready, PrinterState::Busy),
            None
        );
    }

    #[test]
    fn test_covers() {
        let change = StateChange::new().to(PrinterState::Printing, Source::User);
        assert!(change.covers(PrinterState::Ready, PrinterState::Printing));
        assert!(!change.covers(PrinterState::Ready, PrinterState::Busy));
        assert!(StateChange::new()
            .with_default_source(Source::Serial)
            .covers(PrinterState::Ready, PrinterState::Busy));
    }

    #[test]
    fn test_transition_display() {
        let transition = StateTransition {
            from: PrinterState::Printing,
            to: PrinterState::Paused,
            command_id: Some(7),
            source: Some(Source::User),
            reason: None,
            timestamp: Utc::now(),
        };
        assert_eq!(transition.to_string(), "PRINTING -> PAUSED by USER cmd 7");
        assert!(!transition.is_unexpected());
    }
}
