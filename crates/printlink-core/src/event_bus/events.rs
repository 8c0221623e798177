//! Event type definitions for the event bus.
//!
//! Events are grouped by category and are cloneable and serializable so they
//! can be logged or forwarded as they are.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::data::StateTransition;

/// Root event enum for everything the link reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LinkEvent {
    /// Reported state transitions
    State(StateEvent),
    /// Serial queue events
    Queue(QueueEvent),
    /// Unsolicited printer signals
    Printer(PrinterEvent),
    /// Transport events
    Connection(ConnectionEvent),
}

impl LinkEvent {
    /// Get the category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            LinkEvent::State(_) => EventCategory::State,
            LinkEvent::Queue(_) => EventCategory::Queue,
            LinkEvent::Printer(_) => EventCategory::Printer,
            LinkEvent::Connection(_) => EventCategory::Connection,
        }
    }

    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            LinkEvent::State(e) => e.description(),
            LinkEvent::Queue(e) => e.description(),
            LinkEvent::Printer(e) => e.description(),
            LinkEvent::Connection(e) => e.description(),
        }
    }
}

/// Event category for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// State transitions.
    State,
    /// Serial queue events.
    Queue,
    /// Printer signals.
    Printer,
    /// Transport events.
    Connection,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::State => write!(f, "State"),
            EventCategory::Queue => write!(f, "Queue"),
            EventCategory::Printer => write!(f, "Printer"),
            EventCategory::Connection => write!(f, "Connection"),
        }
    }
}

/// State manager events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StateEvent {
    /// The reported state changed.
    Changed(StateTransition),
}

impl StateEvent {
    fn description(&self) -> String {
        match self {
            StateEvent::Changed(transition) => format!("State changed: {}", transition),
        }
    }
}

/// Serial queue events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    /// The in-flight instruction was confirmed.
    InstructionConfirmed {
        /// Message of the confirmed instruction.
        message: String,
        /// Time from send to confirmation.
        latency: Option<Duration>,
        /// Whether the confirmation was forced.
        forced: bool,
    },
    /// The line number counter was re-synchronised.
    LineNumberChanged {
        /// The new current line number.
        line_number: u64,
    },
    /// The conversation with the firmware broke down.
    CommunicationFailed {
        /// Why the queue gave up.
        reason: String,
    },
    /// Print instructions were discarded.
    QueueFlushed {
        /// Number of instructions dropped.
        dropped: usize,
    },
}

impl QueueEvent {
    fn description(&self) -> String {
        match self {
            QueueEvent::InstructionConfirmed {
                message, latency, ..
            } => match latency {
                Some(latency) => format!("Confirmed {:?} in {:?}", message, latency),
                None => format!("Confirmed {:?}", message),
            },
            QueueEvent::LineNumberChanged { line_number } => {
                format!("Line number set to {}", line_number)
            }
            QueueEvent::CommunicationFailed { reason } => {
                format!("Communication failed: {}", reason)
            }
            QueueEvent::QueueFlushed { dropped } => {
                format!("Print queue flushed, {} dropped", dropped)
            }
        }
    }
}

/// Unsolicited printer signals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PrinterEvent {
    /// The firmware announced a (re)boot.
    Booted,
    /// The firmware discarded its receive buffer.
    RxDiscarded,
    /// A temperature report arrived.
    Temperature {
        /// Nozzle temperature.
        nozzle: f64,
        /// Nozzle target.
        nozzle_target: f64,
        /// Bed temperature.
        bed: f64,
        /// Bed target.
        bed_target: f64,
    },
}

impl PrinterEvent {
    fn description(&self) -> String {
        match self {
            PrinterEvent::Booted => "Printer booted".to_string(),
            PrinterEvent::RxDiscarded => "Printer discarded its RX buffer".to_string(),
            PrinterEvent::Temperature { nozzle, bed, .. } => {
                format!("Temperature nozzle {:.1} bed {:.1}", nozzle, bed)
            }
        }
    }
}

/// Transport events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// The transport was opened.
    Opened {
        /// Port name.
        port: String,
    },
    /// The transport failed and was closed.
    Lost {
        /// Port name.
        port: String,
        /// Error message.
        reason: String,
    },
    /// The transport was closed on request.
    Closed {
        /// Port name.
        port: String,
    },
}

impl ConnectionEvent {
    fn description(&self) -> String {
        match self {
            ConnectionEvent::Opened { port } => format!("Opened {}", port),
            ConnectionEvent::Lost { port, reason } => format!("Lost {}: {}", port, reason),
            ConnectionEvent::Closed { port } => format!("Closed {}", port),
        }
    }
}
