//! Shorthands for enqueueing common instruction shapes and waiting on them

use printlink_core::Result;
use regex::Regex;
use std::time::Duration;

use crate::instruction::{Instruction, InstructionHandle};
use crate::queue::SerialQueue;

/// How often a waiting caller re-checks its predicate
pub const CONFIRMATION_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Enqueue a plain instruction
pub fn enqueue_instruction(
    queue: &SerialQueue,
    message: &str,
    to_front: bool,
    to_checksum: bool,
) -> Result<InstructionHandle> {
    let mut instruction = Instruction::plain(message)?;
    if to_checksum {
        instruction = instruction.with_checksum();
    }
    Ok(queue.enqueue(instruction, to_front))
}

/// Enqueue an instruction that must capture `pattern` before it confirms
pub fn enqueue_matchable(
    queue: &SerialQueue,
    message: &str,
    pattern: Regex,
    to_front: bool,
) -> Result<InstructionHandle> {
    let instruction = Instruction::mandatory_matchable(message, pattern)?;
    Ok(queue.enqueue(instruction, to_front))
}

/// Enqueue an instruction collecting output between two markers
pub fn enqueue_collecting(
    queue: &SerialQueue,
    message: &str,
    begin: Regex,
    capture: Regex,
    end: Regex,
    to_front: bool,
) -> Result<InstructionHandle> {
    let instruction = Instruction::collecting(message, begin, capture, end)?;
    Ok(queue.enqueue(instruction, to_front))
}

/// Enqueue several instructions sharing one optional capture pattern
///
/// Nothing is enqueued if any message is invalid.
pub fn enqueue_list(
    queue: &SerialQueue,
    messages: &[&str],
    pattern: &Regex,
    to_front: bool,
) -> Result<Vec<InstructionHandle>> {
    let instructions = messages
        .iter()
        .map(|message| Instruction::matchable(*message, pattern.clone()))
        .collect::<Result<Vec<_>>>()?;
    Ok(queue.enqueue_list(instructions, to_front))
}

/// Wait for `handle` while `should_wait` holds
///
/// Returns whether the instruction got confirmed.
pub fn wait_for_instruction<F>(handle: &InstructionHandle, should_wait: F) -> bool
where
    F: Fn() -> bool,
{
    handle.wait_for_confirmation(CONFIRMATION_POLL_INTERVAL, should_wait)
}
