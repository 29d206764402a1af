//! Lifecycle states of a task execution and the atomic cell holding them.
//!
//! The state cell is the only cross-thread mutable of the container. Every
//! transition is a compare-and-set; a failed CAS means another actor already
//! transitioned and the caller must re-read and decide.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

/// The lifecycle state of one task execution attempt.
///
/// ```text
/// CREATED ──► DEPLOYING ──► RUNNING ──► FINISHED
///    │            │            │
///    ▼            ▼            ▼
///  FAILED     CANCELING ──► CANCELED
/// ```
///
/// `FINISHED`, `CANCELED` and `FAILED` are terminal. All non-terminal states
/// may additionally transition to `FAILED` carrying a failure cause.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ExecutionState {
    Created = 0,
    Deploying = 1,
    Running = 2,
    Finished = 3,
    Canceling = 4,
    Canceled = 5,
    Failed = 6,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Canceled | Self::Failed)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Deploying,
            2 => Self::Running,
            3 => Self::Finished,
            4 => Self::Canceling,
            5 => Self::Canceled,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Created => "CREATED",
            Self::Deploying => "DEPLOYING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
        })
    }
}

/// Atomic cell holding the execution state plus the failure cause recorded at
/// the moment of the first transition into `FAILED`.
///
/// The cell linearizes transitions but does not enforce the transition graph;
/// callers supply valid `(expected, new)` pairs. Reads are acquire, successful
/// writes are release, so any observer seeing a state also observes everything
/// published before the transition.
pub struct StateCell {
    owner: String,
    state: AtomicU8,
    failure_cause: Mutex<Option<Arc<anyhow::Error>>>,
}

impl StateCell {
    /// Create a cell in `CREATED`. `owner` is the task name used in the
    /// transition log.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            state: AtomicU8::new(ExecutionState::Created as u8),
            failure_cause: Mutex::new(None),
        }
    }

    pub fn current(&self) -> ExecutionState {
        ExecutionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The cause recorded with the transition into `FAILED`, if any.
    pub fn failure_cause(&self) -> Option<Arc<anyhow::Error>> {
        self.failure_cause
            .lock()
            .expect("failure cause slot poisoned")
            .clone()
    }

    /// Compare-and-set `expected -> new`, recording `cause` when the new
    /// state is `FAILED`. Returns false if another actor transitioned first.
    ///
    /// The cause slot is held across the CAS so that a reader observing
    /// `FAILED` also observes the cause. Once a cause is recorded it is never
    /// replaced.
    pub fn try_transition(
        &self,
        expected: ExecutionState,
        new: ExecutionState,
        cause: Option<Arc<anyhow::Error>>,
    ) -> bool {
        let mut slot = self
            .failure_cause
            .lock()
            .expect("failure cause slot poisoned");
        let swapped = self
            .state
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if swapped {
            if new == ExecutionState::Failed && slot.is_none() {
                *slot = cause.clone();
            }
            drop(slot);
            match cause {
                Some(cause) => info!(
                    task = %self.owner,
                    from = %expected,
                    to = %new,
                    cause = %cause,
                    "task switched state"
                ),
                None => info!(task = %self.owner, from = %expected, to = %new, "task switched state"),
            }
        }
        swapped
    }
}
