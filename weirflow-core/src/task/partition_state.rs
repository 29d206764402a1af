//! Response handle for partition-producer state probes.
//!
//! A gate consuming from another subtask may observe a missing upstream
//! partition and ask this container to verify the producer's state. The
//! container forwards the probe and wraps the outcome, together with its own
//! state at resolution time, into this handle. The consumer side then decides
//! whether to retry, cancel, or fail.

use std::sync::Arc;

use crate::execution_state::ExecutionState;
use crate::invokable::TaskActionsHandle;

pub struct PartitionProducerStateResponseHandle {
    consumer_state: ExecutionState,
    producer_state: Result<ExecutionState, Arc<anyhow::Error>>,
    task_actions: TaskActionsHandle,
}

impl PartitionProducerStateResponseHandle {
    pub(crate) fn new(
        consumer_state: ExecutionState,
        producer_state: Result<ExecutionState, Arc<anyhow::Error>>,
        task_actions: TaskActionsHandle,
    ) -> Self {
        Self {
            consumer_state,
            producer_state,
            task_actions,
        }
    }

    /// State of the consuming task (this container) when the probe resolved.
    pub fn consumer_execution_state(&self) -> ExecutionState {
        self.consumer_state
    }

    /// State of the producing task, or the probe error.
    pub fn producer_state_or_error(&self) -> Result<ExecutionState, Arc<anyhow::Error>> {
        self.producer_state.clone()
    }

    /// Cancel the consuming task.
    pub fn cancel_consumption(&self) {
        self.task_actions.cancel();
    }

    /// Fail the consuming task with `cause`.
    pub fn fail_consumption(&self, cause: anyhow::Error) {
        self.task_actions.fail_externally(cause);
    }
}
