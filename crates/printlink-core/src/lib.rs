//! # PrintLink Core
//!
//! Core types shared by the PrintLink crates: the error taxonomy, the
//! printer state vocabulary and the typed event bus.

pub mod data;
pub mod error;
pub mod event_bus;

pub use data::{PrinterState, Source, StateChange, StateSnapshot, StateTransition};

pub use error::{ConnectionError, Error, ProtocolError, Result};

pub use event_bus::{
    ConnectionEvent, EventBus, EventCategory, EventFilter, LinkEvent,
    PrinterEvent, QueueEvent, StateEvent, SubscriptionId,
};
