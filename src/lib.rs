//! # PrintLink
//!
//! Host-side serial link for Marlin-style 3D printers. G-code is streamed
//! with line numbers and checksums, lost lines are replayed on the
//! firmware's resend requests, and the printer state is derived from what
//! the firmware reports.
//!
//! ## Architecture
//!
//! PrintLink is organized as a workspace with multiple crates:
//!
//! 1. **printlink-core** - Errors, state vocabulary, event bus
//! 2. **printlink-communication** - Routing, framing, queueing, recovery, state tracking
//! 3. **printlink-settings** - Configuration files
//! 4. **printlink** - Logging setup and the command-line entry point

pub use printlink_communication::{
    enqueue_collecting, enqueue_instruction, enqueue_list, enqueue_matchable, list_ports,
    wait_for_instruction, Instruction, InstructionHandle, LineRouter, LinkConfig, PrinterLink,
    SerialConfig, SerialQueue, SerialTransport, StateManager, Transport,
};
pub use printlink_core::{
    ConnectionError, Error, EventBus, EventFilter, LinkEvent, PrinterState, ProtocolError,
    Result, Source, StateChange, StateSnapshot, StateTransition,
};
pub use printlink_settings::{Config, SettingsError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Honours `RUST_LOG` and logs at `info` otherwise. Lines carry the
/// target, thread name and line number, since the serial reader and the
/// watchdog log from their own threads.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_level(true)
        .with_thread_names(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
