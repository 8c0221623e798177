//! Data models shared across the link
//!
//! This module provides:
//! - The printer state vocabulary and its layers
//! - Expected state changes used for attribution
//! - Reported transitions and state snapshots

pub mod state;

pub use state::{PrinterState, Source, StateChange, StateSnapshot, StateTransition};
