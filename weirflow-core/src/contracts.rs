//! Capability contracts between the task container and its collaborators.
//!
//! Each trait is the narrow surface the container actually consumes; the
//! worker node wires concrete subsystems behind them. All of them must be
//! callable from any thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::config::DistributedCacheEntry;
use crate::execution_state::ExecutionState;
use crate::invokable::InvokableRegistry;
use crate::types::{
    BlobKey, CheckpointId, ExecutionAttemptId, IntermediateDataSetId, JobId, ResultPartitionId,
};

// ---------------------------------------------------------------------------
// One-shot completions
// ---------------------------------------------------------------------------

/// Producing side of a one-shot completion.
pub struct Completer<T>(Sender<T>);

/// A value a collaborator will complete later. Backed by a bounded channel so
/// waiting blocks only the caller that chooses to wait.
pub struct Completion<T>(Receiver<T>);

pub fn completion<T>() -> (Completer<T>, Completion<T>) {
    let (sender, receiver) = bounded(1);
    (Completer(sender), Completion(receiver))
}

impl<T> Completer<T> {
    /// Complete the future. Dropped completions are fine: the waiter observes
    /// an abandonment error instead.
    pub fn complete(self, value: T) {
        let _ = self.0.send(value);
    }
}

impl<T> Completion<T> {
    /// Block until completed.
    pub fn wait(&self) -> Result<T> {
        self.0
            .recv()
            .map_err(|_| anyhow!("completion abandoned before a value was produced"))
    }

    /// Block up to `timeout`. `Ok(None)` means not completed yet.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        match self.0.recv_timeout(timeout) {
            Ok(value) => Ok(Some(value)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("completion abandoned before a value was produced"))
            }
        }
    }

    pub fn try_get(&self) -> Option<T> {
        self.0.try_recv().ok()
    }
}

/// Future for a background distributed-cache copy.
pub type CacheCopyFuture = Completion<Result<PathBuf>>;

// ---------------------------------------------------------------------------
// Worker node
// ---------------------------------------------------------------------------

/// State message published to the worker node. The final-state message is the
/// last observable action of a task before its metric group closes.
#[derive(Debug, Clone)]
pub struct TaskExecutionStateUpdate {
    pub job_id: JobId,
    pub execution_id: ExecutionAttemptId,
    pub state: ExecutionState,
    pub failure_cause: Option<Arc<anyhow::Error>>,
}

pub trait WorkerActions: Send + Sync {
    fn update_task_execution_state(&self, update: TaskExecutionStateUpdate);

    /// Report an unrecoverable condition. The worker node is expected to kill
    /// the process.
    fn notify_fatal_error(&self, message: &str, cause: Option<Arc<anyhow::Error>>);
}

// ---------------------------------------------------------------------------
// Checkpointing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    /// The task was not ready to take the checkpoint.
    TaskNotReady,
    /// The operator's trigger hook failed.
    TriggerFailure,
}

impl std::fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::TaskNotReady => "task not ready",
            Self::TriggerFailure => "checkpoint trigger failed",
        })
    }
}

/// Client of the checkpoint coordinator.
pub trait CheckpointResponder: Send + Sync {
    fn decline_checkpoint(
        &self,
        job_id: JobId,
        execution_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        reason: DeclineReason,
    );
}

/// Manager for the operator state of this task.
pub trait TaskStateManager: Send + Sync {
    fn notify_checkpoint_complete(&self, checkpoint_id: CheckpointId);
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

pub trait MemoryManager: Send + Sync {
    /// Release every allocation tagged with `owner`.
    fn release_all(&self, owner: ExecutionAttemptId);
}

/// Cache of user code bundles, keyed by job.
pub trait LibraryCache: Send + Sync {
    /// Register the task and make sure the required artifacts are present.
    /// May download artifacts and therefore block.
    fn register_task(
        &self,
        job_id: JobId,
        execution_id: ExecutionAttemptId,
        required_artifacts: &[BlobKey],
    ) -> Result<()>;

    /// The invokable registry resolved for the job, if registration produced
    /// one.
    fn registry(&self, job_id: JobId) -> Option<Arc<InvokableRegistry>>;

    fn unregister_task(&self, job_id: JobId, execution_id: ExecutionAttemptId);
}

pub trait PermanentBlobService: Send + Sync {
    fn register_job(&self, job_id: JobId) -> Result<()>;
    fn release_job(&self, job_id: JobId);
}

/// Distributed file cache providing local copies of user files.
pub trait FileCache: Send + Sync {
    /// Start a background copy of `entry` and return a future for the local
    /// path.
    fn create_tmp_file(
        &self,
        entry: &DistributedCacheEntry,
        job_id: JobId,
        execution_id: ExecutionAttemptId,
    ) -> Result<CacheCopyFuture>;

    fn release_job(&self, job_id: JobId, execution_id: ExecutionAttemptId);
}

// ---------------------------------------------------------------------------
// Partition state probes and callbacks
// ---------------------------------------------------------------------------

/// Asks the master for the state of another subtask's produced partition.
pub trait PartitionStateChecker: Send + Sync {
    fn request_partition_producer_state(
        &self,
        job_id: JobId,
        dataset_id: IntermediateDataSetId,
        partition_id: ResultPartitionId,
    ) -> Completion<Result<ExecutionState>>;
}

/// Executor for future callbacks, so they never run on a network thread.
pub trait CallbackExecutor: Send + Sync {
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// Executor spawning one short-lived thread per callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawnExecutor;

impl CallbackExecutor for ThreadSpawnExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        if let Err(err) = std::thread::Builder::new()
            .name("callback".into())
            .spawn(job)
        {
            tracing::error!(error = %err, "failed to spawn callback thread");
        }
    }
}
