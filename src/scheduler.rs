//! Deadlines a node has to check on later.
//!
//! A task only says *what* to look at again. When it fires, the node
//! re-tests the condition it was scheduled for, and sends a timeout message
//! if the condition still holds. Tasks are never cancelled: one whose
//! condition has since been met simply does nothing.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::MessageHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Task {
    /// Has anybody complained about this key distribution?
    KeyDistributionWindowClosed(MessageHash),
    /// Have all quarter holders answered this obituary?
    ObituaryResponseDeadline(MessageHash),
    /// Has the successor completed or disputed this goodbye?
    GoodbyeResponseDeadline(MessageHash),
    /// Has the successor completed or disputed the four recovery messages
    /// ending with this one?
    SuccessionDeadline(MessageHash),
    /// Have all quarter holders audited this recovery failure?
    RecoveryFailureResponseDeadline(MessageHash),
}

/// Tasks ordered by the time they are due, in microseconds.
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    tasks: BTreeMap<(u64, u64), Task>,
    sequence: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, task: Task, fire_at: u64) {
        self.tasks.insert((fire_at, self.sequence), task);
        self.sequence += 1;
    }

    /// Remove and return every task due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: u64) -> Vec<Task> {
        let later = self.tasks.split_off(&(now.saturating_add(1), 0));
        let due = std::mem::replace(&mut self.tasks, later);
        due.into_values().collect()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.tasks.keys().next().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
