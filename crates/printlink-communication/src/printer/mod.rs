//! Printer-side bookkeeping derived from the output stream

pub mod state_manager;

pub use state_manager::{StateManager, STATE_HISTORY_SIZE};
