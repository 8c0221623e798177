//! # PrintLink Communication
//!
//! The serial G-code protocol engine. Printer output is read line by line
//! and dispatched by the [`LineRouter`]; the [`SerialQueue`] keeps exactly
//! one [`Instruction`] in flight, frames print lines with line numbers and
//! checksums and replays them on resend requests; the [`StateManager`]
//! derives the printer state from what the firmware says.
//!
//! [`PrinterLink`] wires all of it to one transport.

pub mod helpers;
pub mod instruction;
pub mod link;
pub mod planner;
pub mod printer;
pub mod protocol;
pub mod queue;
pub mod reader;
pub mod router;
pub mod transport;
pub mod watchdog;

pub use helpers::{
    enqueue_collecting, enqueue_instruction, enqueue_list, enqueue_matchable,
    wait_for_instruction, CONFIRMATION_POLL_INTERVAL,
};
pub use instruction::{
    any_line, CollectPhase, Captured, ConfirmedInstruction, Instruction, InstructionHandle,
    InstructionKind,
};
pub use link::{LinkConfig, PrinterLink, RecoveryConfig};
pub use planner::{PlannerConfig, PlannerFedEstimator};
pub use printer::StateManager;
pub use queue::{QueueConfig, SerialQueue, CAPTURE_PRIORITY, CONFIRMATION_PRIORITY};
pub use reader::LineReader;
pub use router::{HandlerId, LineHandler, LineRouter};
pub use transport::{list_ports, SerialConfig, SerialPortInfo, SerialTransport, Transport};
pub use watchdog::{StallWatchdog, WatchdogConfig, WatchdogState};
