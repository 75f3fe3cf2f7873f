//! Per-block mutual exclusion for form-level operations
//!
//! Execution is single-threaded and cooperative, so this is not a lock in
//! the OS sense: it rejects reentrant invocation across suspension points,
//! e.g. a change handler starting a query while a commit is mid-flight on
//! the same block. Starting a second event on a busy block is a protocol
//! violation, never queued or retried.

use ahash::AHashMap;
use ff_core::RecordId;
use parking_lot::Mutex;
use std::fmt;

/// High-level operations competing for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormEvent {
    EnterQuery,
    PreQuery,
    ExecuteQuery,
    Insert,
    Update,
    Delete,
    Lock,
    Flush,
    Undo,
    Save,
}

impl fmt::Display for FormEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Block name -> currently running event.
pub struct EventTransaction {
    slots: Mutex<AHashMap<String, FormEvent>>,
}

impl EventTransaction {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(AHashMap::new()),
        }
    }

    /// Claim the block for `event`. On conflict the call fails and returns
    /// the event already running so the caller can report which two
    /// operations collided.
    pub fn start(
        &self,
        event: FormEvent,
        block: &str,
        _record: Option<RecordId>,
    ) -> Result<(), FormEvent> {
        let mut slots = self.slots.lock();

        if let Some(running) = slots.get(block) {
            return Err(*running);
        }

        slots.insert(block.to_string(), event);
        Ok(())
    }

    /// The event currently running on a block, if any.
    pub fn running(&self, block: &str) -> Option<FormEvent> {
        self.slots.lock().get(block).copied()
    }

    /// Release the block unconditionally.
    pub fn finish(&self, block: &str) {
        self.slots.lock().remove(block);
    }

    /// Drop every slot.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

impl Default for EventTransaction {
    fn default() -> Self {
        Self::new()
    }
}
