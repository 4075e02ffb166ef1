//! Manager-side state of the write token
//!
//! Requests and completions look the same on the wire; a message from the
//! current holder is its completion, anything else is a request.

use std::collections::{HashSet, VecDeque};

use crate::error::{Result, ShardflowError};

/// What the manager must do after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEvent {
    /// Token was free; grant it to this worker now
    Granted(u32),
    /// Token is held; the worker waits in line
    Queued(u32),
    /// Holder finished; `next` is the worker to grant to, if any
    Completed { rank: u32, next: Option<u32> },
}

/// Holder, FIFO queue and completion count of the token
#[derive(Debug, Clone)]
pub struct TokenLedger {
    manager: u32,
    total: u32,
    holder: Option<u32>,
    pending: VecDeque<u32>,
    completed: u32,
    done: HashSet<u32>,
}

impl TokenLedger {
    /// Ledger for a group of `total` workers. The manager's own flush has
    /// already happened and counts as the first completion.
    pub fn new(manager: u32, total: u32) -> Self {
        let mut done = HashSet::new();
        done.insert(manager);
        Self {
            manager,
            total,
            holder: None,
            pending: VecDeque::new(),
            completed: 1,
            done,
        }
    }

    /// Apply a message from `from`
    pub fn on_message(&mut self, from: u32) -> Result<TokenEvent> {
        if from == self.manager {
            return Err(self.violation(format!("manager {} messaged itself", from)));
        }
        if from >= self.total {
            return Err(self.violation(format!("worker {} outside group of {}", from, self.total)));
        }

        if self.holder == Some(from) {
            self.holder = None;
            self.done.insert(from);
            self.completed += 1;

            let next = self.pending.pop_front();
            self.holder = next;
            return Ok(TokenEvent::Completed { rank: from, next });
        }

        if self.done.contains(&from) {
            return Err(self.violation(format!("worker {} already wrote", from)));
        }
        if self.pending.contains(&from) {
            return Err(self.violation(format!("worker {} requested twice", from)));
        }

        match self.holder {
            None => {
                self.holder = Some(from);
                Ok(TokenEvent::Granted(from))
            }
            Some(_) => {
                self.pending.push_back(from);
                Ok(TokenEvent::Queued(from))
            }
        }
    }

    /// Every worker, manager included, has written
    pub fn is_finished(&self) -> bool {
        self.completed >= self.total
    }

    pub fn holder(&self) -> Option<u32> {
        self.holder
    }

    pub fn pending(&self) -> impl Iterator<Item = &u32> {
        self.pending.iter()
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    fn violation(&self, reason: String) -> ShardflowError {
        ShardflowError::Protocol {
            rank: self.manager,
            reason,
        }
    }
}
