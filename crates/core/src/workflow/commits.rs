use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::workflow::{DelegationChange, TransitionReport};

/// A change the engine has committed in memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Commit {
    Transition(Box<TransitionReport>),
    Delegation(Box<DelegationChange>),
}

/// Receives every commit while the engine still holds the lock that ordered it: the
/// instance mutex for transitions, the registry write lock for delegation changes.
/// Calls therefore arrive in commit order for any one instance or delegation.
pub trait CommitSink: Send + Sync {
    fn committed(&self, commit: Commit);
}

/// FIFO of commits waiting for a write-behind store to pick them up.
#[derive(Debug, Default)]
pub struct CommitLog {
    queue: Mutex<VecDeque<Commit>>,
}

impl CommitLog {
    /// Removes and returns everything logged so far, oldest first.
    pub fn take(&self) -> Vec<Commit> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CommitSink for CommitLog {
    fn committed(&self, commit: Commit) {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).push_back(commit);
    }
}
