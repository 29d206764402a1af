//! The user operator contract, the registry it is instantiated from, and the
//! environment it runs against.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::config::{Configuration, ExecutionConfig};
use crate::contracts::{CacheCopyFuture, CheckpointResponder, MemoryManager, TaskStateManager};
use crate::error::TaskError;
use crate::metrics::TaskMetricGroup;
use crate::network::{InputGate, ResultPartitionWriter};
use crate::safety_net::FileSystemSafetyNet;
use crate::task::Task;
use crate::task::cancellation::InterruptHandle;
use crate::types::{CheckpointId, ExecutionAttemptId, JobId, JobVertexId, TaskInfo};

/// Metadata identifying one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetaData {
    pub checkpoint_id: CheckpointId,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointType {
    Checkpoint,
    Savepoint,
    /// Savepoint that parks the triggering call until the snapshot completes.
    SynchronousSavepoint,
}

impl CheckpointType {
    pub fn is_synchronous(self) -> bool {
        matches!(self, Self::SynchronousSavepoint)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointOptions {
    pub checkpoint_type: CheckpointType,
    pub target_location: Option<String>,
}

impl CheckpointOptions {
    pub fn checkpoint() -> Self {
        Self {
            checkpoint_type: CheckpointType::Checkpoint,
            target_location: None,
        }
    }

    pub fn savepoint(target_location: impl Into<String>, synchronous: bool) -> Self {
        Self {
            checkpoint_type: if synchronous {
                CheckpointType::SynchronousSavepoint
            } else {
                CheckpointType::Savepoint
            },
            target_location: Some(target_location.into()),
        }
    }
}

/// The user operator driven by the task container.
///
/// `invoke` runs on the container's dedicated thread; every other method may
/// be called concurrently from container-owned threads, so implementations
/// keep their mutable state behind interior mutability.
pub trait Invokable: Send + Sync {
    /// The operator's main work method. Returning ends the task.
    fn invoke(&self) -> Result<()>;

    /// Cooperative cancellation hook. Invoked at most once per task lifetime.
    fn cancel(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the container should escalate a cancel with interrupts of the
    /// executing thread.
    fn should_interrupt_on_cancel(&self) -> bool {
        true
    }

    /// Take a checkpoint. Returning `false` declines it.
    fn trigger_checkpoint(
        &self,
        meta: CheckpointMetaData,
        options: &CheckpointOptions,
        advance_to_end_of_event_time: bool,
    ) -> Result<bool> {
        let _ = (meta, options, advance_to_end_of_event_time);
        Err(anyhow!("this operator does not support checkpointing"))
    }

    /// Called once a checkpoint has been confirmed by the coordinator.
    fn notify_checkpoint_complete(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let _ = checkpoint_id;
        Ok(())
    }
}

/// Factory constructing an operator instance from its environment.
pub type InvokableFactory = Arc<dyn Fn(Environment) -> Result<Box<dyn Invokable>> + Send + Sync>;

/// Registry of invokable factories, resolved per job by the library cache.
///
/// The deployment names a factory key; instantiation looks the factory up
/// here. A missing key is a deploy bug and surfaces as the distinct
/// [`TaskError::MissingFactory`].
#[derive(Default, Clone)]
pub struct InvokableRegistry {
    factories: HashMap<String, InvokableFactory>,
}

impl InvokableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factory(
        mut self,
        key: impl Into<String>,
        factory: impl Fn(Environment) -> Result<Box<dyn Invokable>> + Send + Sync + 'static,
    ) -> Self {
        self.register(key, factory);
        self
    }

    pub fn register(
        &mut self,
        key: impl Into<String>,
        factory: impl Fn(Environment) -> Result<Box<dyn Invokable>> + Send + Sync + 'static,
    ) {
        self.factories.insert(key.into(), Arc::new(factory));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub fn instantiate(&self, key: &str, environment: Environment) -> Result<Box<dyn Invokable>> {
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| anyhow::Error::new(TaskError::MissingFactory(key.to_string())))?;
        factory(environment).with_context(|| format!("invokable factory `{key}` failed"))
    }
}

impl std::fmt::Debug for InvokableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("InvokableRegistry")
            .field("keys", &keys)
            .finish()
    }
}

/// Lifecycle actions user code and response handles may drive without owning
/// the container. Backed by a weak reference; actions after the container is
/// gone are no-ops.
#[derive(Clone)]
pub struct TaskActionsHandle {
    task: Weak<Task>,
}

impl TaskActionsHandle {
    pub(crate) fn new(task: &Arc<Task>) -> Self {
        Self {
            task: Arc::downgrade(task),
        }
    }

    pub fn cancel(&self) {
        if let Some(task) = self.task.upgrade() {
            task.cancel();
        }
    }

    pub fn fail_externally(&self, cause: anyhow::Error) {
        if let Some(task) = self.task.upgrade() {
            task.fail_externally(cause);
        }
    }
}

/// Everything an operator may touch, bundled at instantiation time.
pub struct Environment {
    pub job_id: JobId,
    pub job_vertex_id: JobVertexId,
    pub execution_id: ExecutionAttemptId,
    pub task_info: TaskInfo,
    pub execution_config: ExecutionConfig,
    pub job_configuration: Configuration,
    pub task_configuration: Configuration,
    pub memory_manager: Arc<dyn MemoryManager>,
    pub task_state_manager: Arc<dyn TaskStateManager>,
    pub checkpoint_responder: Arc<dyn CheckpointResponder>,
    /// Futures for the local copies of the job's distributed cache entries,
    /// keyed by entry name.
    pub distributed_cache: HashMap<String, CacheCopyFuture>,
    pub writers: Vec<Arc<dyn ResultPartitionWriter>>,
    pub input_gates: Vec<Arc<dyn InputGate>>,
    pub metrics: Arc<TaskMetricGroup>,
    /// Interrupt signal of the executing thread. Cooperative operators poll
    /// this from blocking loops.
    pub interrupt: InterruptHandle,
    pub task_actions: TaskActionsHandle,
    /// The job's user code registry, for operators that instantiate further
    /// user classes at runtime.
    pub user_code: Arc<InvokableRegistry>,
    /// Safety net of the owning task thread. Streams opened by the operator
    /// should be registered here.
    pub safety_net: FileSystemSafetyNet,
}
