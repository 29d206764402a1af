//! The task container: one execution attempt of a parallel subtask.
//!
//! A `Task` wraps a user operator and runs it, providing everything it needs
//! to consume input, produce result partitions and talk to the checkpoint
//! coordinator. The container knows nothing about other tasks or about why it
//! is deployed; all it has is its own identity, configuration and the
//! descriptors of the partitions it consumes and produces.
//!
//! Each task is run by one dedicated thread. External callers only ever touch
//! the atomic state cell and a handful of non-blocking entry points; no
//! externally callable method blocks on user code.

pub mod cancellation;
pub mod partition_state;

pub(crate) mod async_calls;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, error, info};

use crate::config::{
    Configuration, DistributedCacheEntry, ExecutionConfig, JobInformation, TaskInformation,
    WorkerOptions,
};
use crate::contracts::{
    CallbackExecutor, CheckpointResponder, Completion, DeclineReason, FileCache, LibraryCache,
    MemoryManager, PartitionStateChecker, PermanentBlobService, TaskExecutionStateUpdate,
    TaskStateManager, WorkerActions, completion,
};
use crate::error::{
    TaskError, catch_panic, is_cancel_task, is_fatal, is_out_of_memory, unwrap_transport,
};
use crate::execution_state::{ExecutionState, StateCell};
use crate::invokable::{
    CheckpointMetaData, CheckpointOptions, Environment, Invokable, InvokableRegistry,
    TaskActionsHandle,
};
use crate::ledger::{ReleaseStage, ResourceLedger};
use crate::metrics::TaskMetricGroup;
use crate::network::{
    InputGate, InputGateDeploymentDescriptor, NetworkEnvironment,
    ResultPartitionDeploymentDescriptor, ResultPartitionWriter, TaskEventDispatcher,
};
use crate::safety_net::FileSystemSafetyNet;
use crate::task::async_calls::AsyncCallDispatcher;
use crate::task::cancellation::{
    InterruptHandle, TaskCanceler, TaskCancelerWatchDog, TaskInterrupter, ThreadWatch,
};
use crate::task::partition_state::PartitionProducerStateResponseHandle;
use crate::types::{
    AllocationId, BlobKey, CheckpointId, ExecutionAttemptId, IntermediateDataSetId, JobId,
    JobVertexId, ResultPartitionId, TaskInfo,
};

/// The collaborator services a task consumes, wired up by the worker node.
pub struct TaskServices {
    pub network: Arc<dyn NetworkEnvironment>,
    pub event_dispatcher: Arc<dyn TaskEventDispatcher>,
    pub memory_manager: Arc<dyn MemoryManager>,
    pub task_state_manager: Arc<dyn TaskStateManager>,
    pub worker_actions: Arc<dyn WorkerActions>,
    pub checkpoint_responder: Arc<dyn CheckpointResponder>,
    pub blob_service: Arc<dyn PermanentBlobService>,
    pub library_cache: Arc<dyn LibraryCache>,
    pub file_cache: Arc<dyn FileCache>,
    pub partition_state_checker: Arc<dyn PartitionStateChecker>,
    pub executor: Arc<dyn CallbackExecutor>,
}

/// One execution attempt of a parallel subtask.
pub struct Task {
    // -- identity, immutable after construction --
    job_id: JobId,
    job_vertex_id: JobVertexId,
    execution_id: ExecutionAttemptId,
    allocation_id: AllocationId,
    task_info: TaskInfo,
    task_name_with_subtask: String,
    job_configuration: Configuration,
    task_configuration: Configuration,
    required_artifacts: Vec<BlobKey>,
    distributed_cache_entries: Vec<DistributedCacheEntry>,
    invokable_factory_key: String,
    serialized_execution_config: Vec<u8>,

    // -- collaborators --
    writers: Vec<Arc<dyn ResultPartitionWriter>>,
    input_gates: Vec<Arc<dyn InputGate>>,
    event_dispatcher: Arc<dyn TaskEventDispatcher>,
    memory_manager: Arc<dyn MemoryManager>,
    task_state_manager: Arc<dyn TaskStateManager>,
    worker_actions: Arc<dyn WorkerActions>,
    checkpoint_responder: Arc<dyn CheckpointResponder>,
    blob_service: Arc<dyn PermanentBlobService>,
    library_cache: Arc<dyn LibraryCache>,
    file_cache: Arc<dyn FileCache>,
    partition_state_checker: Arc<dyn PartitionStateChecker>,
    executor: Arc<dyn CallbackExecutor>,
    metrics: Arc<TaskMetricGroup>,

    // -- cancellation policy; overridable from the execution config --
    cancellation_interval_ms: AtomicU64,
    cancellation_timeout_ms: AtomicU64,
    halt_on_out_of_memory: bool,

    // -- execution control --
    state: StateCell,
    /// The operator, once instantiated. Readers copy the reference to a local
    /// and null-check; the cleanup pass clears it.
    invokable: Mutex<Option<Arc<dyn Invokable>>>,
    /// Latch making sure the operator's cancel hook runs at most once.
    invokable_canceled: AtomicBool,
    /// The job's user code registry, published during bootstrap.
    user_code: Mutex<Option<Arc<InvokableRegistry>>>,
    /// Lazily initialized dispatcher for checkpoint calls.
    dispatcher: Mutex<Option<Arc<AsyncCallDispatcher>>>,
    interrupt: InterruptHandle,
    thread_watch: ThreadWatch,
    safety_net: FileSystemSafetyNet,
    started: AtomicBool,
}

impl Task {
    /// Assemble the container.
    ///
    /// This performs no work that would need to be undone by a failing
    /// deployment; every undoable acquisition happens on the task thread
    /// during bootstrap.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job: JobInformation,
        task: TaskInformation,
        execution_id: ExecutionAttemptId,
        allocation_id: AllocationId,
        subtask_index: usize,
        attempt_number: usize,
        partition_descriptors: &[ResultPartitionDeploymentDescriptor],
        gate_descriptors: &[InputGateDeploymentDescriptor],
        options: &WorkerOptions,
        metrics: Arc<TaskMetricGroup>,
        services: TaskServices,
    ) -> Result<Arc<Self>> {
        if subtask_index >= task.number_of_subtasks {
            bail!(
                "subtask index {} out of range for parallelism {}",
                subtask_index,
                task.number_of_subtasks
            );
        }

        let task_info = TaskInfo::new(
            task.task_name.clone(),
            subtask_index,
            task.number_of_subtasks,
            attempt_number,
        );
        let task_name_with_subtask = task_info.task_name_with_subtask();
        let owner = format!("{task_name_with_subtask} ({execution_id})");

        let writers = services.network.create_result_partition_writers(
            &owner,
            job.job_id,
            execution_id,
            partition_descriptors,
        )?;
        let input_gates =
            services
                .network
                .create_input_gates(&owner, execution_id, gate_descriptors)?;

        Ok(Arc::new(Self {
            job_id: job.job_id,
            job_vertex_id: task.job_vertex_id,
            execution_id,
            allocation_id,
            task_info,
            task_name_with_subtask,
            job_configuration: job.job_configuration,
            task_configuration: task.task_configuration,
            required_artifacts: job.required_artifacts,
            distributed_cache_entries: job.distributed_cache_entries,
            invokable_factory_key: task.invokable_factory_key,
            serialized_execution_config: job.serialized_execution_config,
            writers,
            input_gates,
            event_dispatcher: services.event_dispatcher,
            memory_manager: services.memory_manager,
            task_state_manager: services.task_state_manager,
            worker_actions: services.worker_actions,
            checkpoint_responder: services.checkpoint_responder,
            blob_service: services.blob_service,
            library_cache: services.library_cache,
            file_cache: services.file_cache,
            partition_state_checker: services.partition_state_checker,
            executor: services.executor,
            metrics,
            cancellation_interval_ms: AtomicU64::new(
                options.task_cancellation_interval.as_millis() as u64,
            ),
            cancellation_timeout_ms: AtomicU64::new(
                options.task_cancellation_timeout.as_millis() as u64,
            ),
            halt_on_out_of_memory: options.halt_on_out_of_memory,
            state: StateCell::new(owner.clone()),
            invokable: Mutex::new(None),
            invokable_canceled: AtomicBool::new(false),
            user_code: Mutex::new(None),
            dispatcher: Mutex::new(None),
            interrupt: InterruptHandle::new(),
            thread_watch: ThreadWatch::new(),
            safety_net: FileSystemSafetyNet::new(owner),
            started: AtomicBool::new(false),
        }))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_vertex_id(&self) -> JobVertexId {
        self.job_vertex_id
    }

    pub fn execution_id(&self) -> ExecutionAttemptId {
        self.execution_id
    }

    pub fn allocation_id(&self) -> AllocationId {
        self.allocation_id
    }

    pub fn task_info(&self) -> &TaskInfo {
        &self.task_info
    }

    pub fn metric_group(&self) -> &Arc<TaskMetricGroup> {
        &self.metrics
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.state.current()
    }

    /// The exception that made this task fail, or `None` if it has not
    /// failed.
    pub fn failure_cause(&self) -> Option<Arc<anyhow::Error>> {
        self.state.failure_cause()
    }

    /// True when the task failed, is canceled, or is being canceled.
    pub fn is_canceled_or_failed(&self) -> bool {
        matches!(
            self.execution_state(),
            ExecutionState::Canceling | ExecutionState::Canceled | ExecutionState::Failed
        )
    }

    pub fn cancellation_interval(&self) -> Duration {
        Duration::from_millis(self.cancellation_interval_ms.load(Ordering::Acquire))
    }

    pub fn cancellation_timeout(&self) -> Duration {
        Duration::from_millis(self.cancellation_timeout_ms.load(Ordering::Acquire))
    }

    pub(crate) fn invokable(&self) -> Option<Arc<dyn Invokable>> {
        self.invokable.lock().expect("invokable handle poisoned").clone()
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Spawn the dedicated task thread. Call once.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            bail!("task {} was already started", self.task_name_with_subtask);
        }
        let task = Arc::clone(self);
        thread::Builder::new()
            .name(self.task_name_with_subtask.clone())
            .spawn(move || task.run())
            .with_context(|| {
                format!("could not spawn task thread for {}", self.task_name_with_subtask)
            })?;
        Ok(())
    }

    /// The body of the dedicated task thread.
    fn run(self: Arc<Self>) {
        self.interrupt.bind_current_thread();
        self.run_to_completion();
        self.thread_watch.mark_terminated();
    }

    fn run_to_completion(self: &Arc<Self>) {
        // Pre-bootstrap handshake.
        loop {
            match self.execution_state() {
                ExecutionState::Created => {
                    if self.state.try_transition(
                        ExecutionState::Created,
                        ExecutionState::Deploying,
                        None,
                    ) {
                        break;
                    }
                }
                ExecutionState::Failed => {
                    // Failed externally before the thread even started.
                    self.notify_final_state();
                    self.metrics.close();
                    return;
                }
                ExecutionState::Canceling => {
                    if self.state.try_transition(
                        ExecutionState::Canceling,
                        ExecutionState::Canceled,
                        None,
                    ) {
                        // Canceled before anything was acquired; nothing to
                        // clean up beyond the metric group.
                        self.notify_final_state();
                        self.metrics.close();
                        return;
                    }
                }
                unexpected => {
                    error!(
                        task = %self.task_name_with_subtask,
                        state = %unexpected,
                        "invalid state at the beginning of task execution"
                    );
                    self.state.try_transition(
                        unexpected,
                        ExecutionState::Failed,
                        Some(Arc::new(anyhow::anyhow!(
                            "invalid state {unexpected} at the beginning of task execution"
                        ))),
                    );
                    self.metrics.close();
                    return;
                }
            }
        }

        // All acquisitions from here on are recorded in the ledger and undone
        // in the cleanup pass.
        let mut ledger = ResourceLedger::new();

        let outcome = catch_panic("task code", || self.bootstrap_and_invoke(&mut ledger));
        if let Err(err) = outcome {
            let handled = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.handle_execution_failure(err)
            }));
            if handled.is_err() {
                let message = format!(
                    "exception in the exception handler of task {} ({})",
                    self.task_name_with_subtask, self.execution_id
                );
                error!(task = %self.task_name_with_subtask, "{message}");
                self.worker_actions.notify_fatal_error(&message, None);
            }
        }

        self.cleanup(&mut ledger);
    }

    /// Bootstrap, user invocation and nominal finish. Every error funnels to
    /// the caller.
    fn bootstrap_and_invoke(self: &Arc<Self>, ledger: &mut ResourceLedger) -> Result<()> {
        info!(task = %self.task_name_with_subtask, "arming file system safety net for the task thread");
        self.safety_net.arm();
        {
            let net = self.safety_net.clone();
            ledger.record(ReleaseStage::SafetyNet, "file system safety net", move || {
                net.close_all();
                Ok(())
            });
        }

        self.blob_service
            .register_job(self.job_id)
            .context("could not register the job with the permanent BLOB service")?;
        {
            let blob = Arc::clone(&self.blob_service);
            let job_id = self.job_id;
            ledger.record(ReleaseStage::Blob, "blob service job registration", move || {
                blob.release_job(job_id);
                Ok(())
            });
        }

        // Resolving user code may download artifact bundles.
        info!(task = %self.task_name_with_subtask, "resolving user code");
        let user_code = self.resolve_user_code(ledger)?;
        *self.user_code.lock().expect("user code registry poisoned") = Some(Arc::clone(&user_code));

        let execution_config = ExecutionConfig::from_bytes(&self.serialized_execution_config)
            .context("could not deserialize the job's execution configuration")?;
        if let Some(interval_ms) = execution_config.task_cancellation_interval_ms {
            self.cancellation_interval_ms
                .store(interval_ms, Ordering::Release);
        }
        if let Some(timeout_ms) = execution_config.task_cancellation_timeout_ms {
            self.cancellation_timeout_ms
                .store(timeout_ms, Ordering::Release);
        }

        if self.is_canceled_or_failed() {
            return Err(TaskError::CancelTask.into());
        }

        // Register with the network stack. This may fail when the worker does
        // not have enough memory for the data exchanges.
        info!(task = %self.task_name_with_subtask, "registering task with the network subsystem");
        for writer in &self.writers {
            writer.setup()?;
            self.event_dispatcher.register_partition(writer.partition_id());
            {
                let task = Arc::clone(self);
                let writer = Arc::clone(writer);
                let dispatcher = Arc::clone(&self.event_dispatcher);
                ledger.record(ReleaseStage::Partitions, "produced partition", move || {
                    dispatcher.unregister_partition(writer.partition_id());
                    if task.is_canceled_or_failed() {
                        writer.fail(task.failure_cause());
                    }
                    writer.close();
                    Ok(())
                });
            }
        }
        for gate in &self.input_gates {
            gate.setup()?;
            {
                let gate = Arc::clone(gate);
                ledger.record(ReleaseStage::Gates, "input gate", move || {
                    gate.close();
                    Ok(())
                });
            }
        }

        // Kick off the background copies for the distributed cache.
        {
            let file_cache = Arc::clone(&self.file_cache);
            let job_id = self.job_id;
            let execution_id = self.execution_id;
            ledger.record(ReleaseStage::FileCache, "file cache job registration", move || {
                file_cache.release_job(job_id, execution_id);
                Ok(())
            });
        }
        let mut distributed_cache = HashMap::new();
        for entry in &self.distributed_cache_entries {
            info!(task = %self.task_name_with_subtask, file = %entry.name, "obtaining local cache copy");
            let copy = self
                .file_cache
                .create_tmp_file(entry, self.job_id, self.execution_id)
                .with_context(|| {
                    format!("could not start the distributed cache copy of `{}`", entry.name)
                })?;
            distributed_cache.insert(entry.name.clone(), copy);
        }

        if self.is_canceled_or_failed() {
            return Err(TaskError::CancelTask.into());
        }

        // Instantiate the operator against its environment.
        let environment = Environment {
            job_id: self.job_id,
            job_vertex_id: self.job_vertex_id,
            execution_id: self.execution_id,
            task_info: self.task_info.clone(),
            execution_config,
            job_configuration: self.job_configuration.clone(),
            task_configuration: self.task_configuration.clone(),
            memory_manager: Arc::clone(&self.memory_manager),
            task_state_manager: Arc::clone(&self.task_state_manager),
            checkpoint_responder: Arc::clone(&self.checkpoint_responder),
            distributed_cache,
            writers: self.writers.clone(),
            input_gates: self.input_gates.clone(),
            metrics: Arc::clone(&self.metrics),
            interrupt: self.interrupt.clone(),
            task_actions: TaskActionsHandle::new(self),
            user_code: Arc::clone(&user_code),
            safety_net: self.safety_net.clone(),
        };
        let invokable: Arc<dyn Invokable> =
            Arc::from(user_code.instantiate(&self.invokable_factory_key, environment)?);
        {
            let memory = Arc::clone(&self.memory_manager);
            let owner = self.execution_id;
            ledger.record(ReleaseStage::Memory, "operator memory", move || {
                memory.release_all(owner);
                Ok(())
            });
        }

        // The invokable must be reachable for cancel() by the time we switch
        // to RUNNING.
        *self.invokable.lock().expect("invokable handle poisoned") = Some(Arc::clone(&invokable));

        if !self
            .state
            .try_transition(ExecutionState::Deploying, ExecutionState::Running, None)
        {
            return Err(TaskError::CancelTask.into());
        }

        self.worker_actions
            .update_task_execution_state(TaskExecutionStateUpdate {
                job_id: self.job_id,
                execution_id: self.execution_id,
                state: ExecutionState::Running,
                failure_cause: None,
            });

        // Run the operator. A panic funnels into the same exit as an error.
        catch_panic("invokable", || invokable.invoke())?;

        // If the operator returned because it was canceled, take the
        // exceptional exit anyway.
        if self.is_canceled_or_failed() {
            return Err(TaskError::CancelTask.into());
        }

        // Finish the produced partitions; a failure here fails the execution.
        for writer in &self.writers {
            writer.finish()?;
        }

        if !self
            .state
            .try_transition(ExecutionState::Running, ExecutionState::Finished, None)
        {
            return Err(TaskError::CancelTask.into());
        }
        Ok(())
    }

    fn resolve_user_code(
        &self,
        ledger: &mut ResourceLedger,
    ) -> Result<Arc<InvokableRegistry>> {
        self.library_cache
            .register_task(self.job_id, self.execution_id, &self.required_artifacts)?;
        {
            let library = Arc::clone(&self.library_cache);
            let job_id = self.job_id;
            let execution_id = self.execution_id;
            ledger.record(ReleaseStage::Library, "library cache task registration", move || {
                library.unregister_task(job_id, execution_id);
                Ok(())
            });
        }
        self.library_cache.registry(self.job_id).ok_or_else(|| {
            anyhow::Error::new(TaskError::UserCodeResolution(format!(
                "no invokable registry available for {}",
                self.job_id
            )))
        })
    }

    /// The single handler every bootstrap or invocation error funnels into.
    fn handle_execution_failure(self: &Arc<Self>, err: anyhow::Error) {
        let err = unwrap_transport(err);

        if is_fatal(&err) || (is_out_of_memory(&err) && self.halt_on_out_of_memory) {
            // No clean shutdown attempt: we cannot expect it to complete.
            error!(
                task = %self.task_name_with_subtask,
                error = %err,
                "encountered a fatal error, halting the process"
            );
            std::process::abort();
        }

        let canceled = is_cancel_task(&err);
        let cause = Arc::new(err);

        // Loop for retries against concurrent cancel()/fail_externally()
        // transitions.
        loop {
            let current = self.execution_state();
            match current {
                ExecutionState::Running | ExecutionState::Deploying => {
                    if canceled {
                        if self
                            .state
                            .try_transition(current, ExecutionState::Canceled, None)
                        {
                            self.cancel_invokable();
                            return;
                        }
                    } else if self.state.try_transition(
                        current,
                        ExecutionState::Failed,
                        Some(Arc::clone(&cause)),
                    ) {
                        self.cancel_invokable();
                        return;
                    }
                }
                ExecutionState::Canceling => {
                    if self
                        .state
                        .try_transition(ExecutionState::Canceling, ExecutionState::Canceled, None)
                    {
                        return;
                    }
                }
                ExecutionState::Failed => {
                    if !canceled {
                        // Someone else's cause won the race; keep ours in the
                        // log only.
                        error!(
                            task = %self.task_name_with_subtask,
                            error = %cause,
                            "task is already failed, suppressing secondary failure cause"
                        );
                    }
                    return;
                }
                ExecutionState::Finished | ExecutionState::Canceled => {
                    error!(
                        task = %self.task_name_with_subtask,
                        state = %current,
                        error = %cause,
                        "error after the task reached a terminal state"
                    );
                    return;
                }
                ExecutionState::Created => {
                    if self.state.try_transition(
                        ExecutionState::Created,
                        ExecutionState::Failed,
                        Some(Arc::clone(&cause)),
                    ) {
                        error!(
                            task = %self.task_name_with_subtask,
                            "unexpected state CREATED while handling an execution failure"
                        );
                        return;
                    }
                }
            }
        }
    }

    /// The cleanup pass. Runs exactly once on the task thread after any exit
    /// and must never raise.
    fn cleanup(self: &Arc<Self>, ledger: &mut ResourceLedger) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            info!(
                task = %self.task_name_with_subtask,
                execution = %self.execution_id,
                "freeing task resources"
            );

            // Drop the operator reference so nothing keeps its structures
            // reachable through this container.
            *self.invokable.lock().expect("invokable handle poisoned") = None;

            // Stop the async dispatcher, discarding queued work.
            let dispatcher = self.dispatcher.lock().expect("dispatcher slot poisoned").take();
            if let Some(dispatcher) = dispatcher {
                dispatcher.shutdown_now();
            }

            let task = Arc::clone(self);
            ledger.release_all(move |label, err| {
                if is_fatal(&err) {
                    let message = format!(
                        "fatal error while releasing `{label}` of task {} ({})",
                        task.task_name_with_subtask, task.execution_id
                    );
                    error!(task = %task.task_name_with_subtask, "{message}");
                    task.worker_actions
                        .notify_fatal_error(&message, Some(Arc::new(err)));
                } else {
                    error!(
                        task = %task.task_name_with_subtask,
                        resource = label,
                        error = %err,
                        "error while releasing task resource"
                    );
                }
            });

            self.notify_final_state();
        }));

        if result.is_err() {
            let message = format!(
                "fatal error in the resource cleanup of task {} ({})",
                self.task_name_with_subtask, self.execution_id
            );
            error!(task = %self.task_name_with_subtask, "{message}");
            self.worker_actions.notify_fatal_error(&message, None);
        }

        // Close the metric group last, so the task is already seen as
        // finished when its metrics disappear.
        self.metrics.close();
    }

    fn notify_final_state(&self) {
        let state = self.execution_state();
        debug_assert!(state.is_terminal());
        self.worker_actions
            .update_task_execution_state(TaskExecutionStateUpdate {
                job_id: self.job_id,
                execution_id: self.execution_id,
                state,
                failure_cause: self.failure_cause(),
            });
    }

    // ------------------------------------------------------------------
    // Canceling / failing from the outside
    // ------------------------------------------------------------------

    /// Cancel the task. A no-op when the task is already terminal or
    /// canceling. Never blocks, idempotent.
    pub fn cancel(self: &Arc<Self>) {
        info!(task = %self.task_name_with_subtask, "attempting to cancel task");
        self.cancel_or_fail(ExecutionState::Canceling, None);
    }

    /// Mark the task failed for an external reason. A no-op when the task is
    /// already terminal or canceling. Never blocks, idempotent.
    pub fn fail_externally(self: &Arc<Self>, cause: anyhow::Error) {
        info!(task = %self.task_name_with_subtask, cause = %cause, "attempting to fail task externally");
        self.cancel_or_fail(ExecutionState::Failed, Some(Arc::new(cause)));
    }

    fn cancel_or_fail(
        self: &Arc<Self>,
        target: ExecutionState,
        cause: Option<Arc<anyhow::Error>>,
    ) {
        loop {
            let current = self.execution_state();

            if current.is_terminal() || current == ExecutionState::Canceling {
                debug!(
                    task = %self.task_name_with_subtask,
                    state = %current,
                    "task is already canceling or terminal"
                );
                return;
            }

            match current {
                ExecutionState::Created | ExecutionState::Deploying => {
                    // The invokable was never published; the execution driver
                    // observes the drift at its next bootstrap checkpoint.
                    if self.state.try_transition(current, target, cause.clone()) {
                        return;
                    }
                }
                ExecutionState::Running => {
                    if self.state.try_transition(ExecutionState::Running, target, cause.clone()) {
                        let invokable = self.invokable();
                        if let Some(invokable) = invokable
                            && !self.invokable_canceled.swap(true, Ordering::AcqRel)
                        {
                            info!(
                                task = %self.task_name_with_subtask,
                                "triggering cancellation of the task code"
                            );
                            self.launch_cancellation_triad(invokable);
                        }
                        return;
                    }
                }
                unexpected => {
                    // Unreachable: terminal and CANCELING were handled above.
                    error!(
                        task = %self.task_name_with_subtask,
                        state = %unexpected,
                        "unexpected state while canceling or failing the task"
                    );
                    return;
                }
            }
        }
    }

    /// Launch canceler, interrupter and watchdog. The canceling may block on
    /// user code, so none of this runs on the caller's thread.
    fn launch_cancellation_triad(self: &Arc<Self>, invokable: Arc<dyn Invokable>) {
        let interval = self.cancellation_interval();
        let timeout = self.cancellation_timeout();

        let canceler = TaskCanceler::new(
            Arc::clone(&invokable),
            {
                let task = Arc::clone(self);
                Box::new(move || task.close_network_resources())
            },
            self.interrupt.clone(),
            self.task_name_with_subtask.clone(),
        );
        spawn_cancellation_thread("task-canceler", move || canceler.run());

        if invokable.should_interrupt_on_cancel() {
            let interrupter = TaskInterrupter::new(
                invokable,
                self.thread_watch.clone(),
                self.interrupt.clone(),
                self.task_name_with_subtask.clone(),
                interval,
            );
            spawn_cancellation_thread("task-interrupter", move || interrupter.run());
        }

        if !timeout.is_zero() {
            let watchdog = TaskCancelerWatchDog::new(
                self.thread_watch.clone(),
                Arc::clone(&self.worker_actions),
                timeout,
                self.task_name_with_subtask.clone(),
            );
            spawn_cancellation_thread("task-cancel-watchdog", move || watchdog.run());
        }
    }

    /// Close partitions and gates. Reached from the canceler, to unblock
    /// auxiliary threads producing or consuming outside the task thread, and
    /// from the cleanup pass; both rely on close being idempotent.
    fn close_network_resources(&self) {
        debug!(
            task = %self.task_name_with_subtask,
            state = %self.execution_state(),
            "closing network resources"
        );
        for writer in &self.writers {
            writer.close();
        }
        for gate in &self.input_gates {
            gate.close();
        }
    }

    /// Driver-side cancel of the operator after an execution failure, guarded
    /// by the same latch as the external path.
    fn cancel_invokable(&self) {
        let invokable = self.invokable();
        if let Some(invokable) = invokable
            && !self.invokable_canceled.swap(true, Ordering::AcqRel)
        {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| invokable.cancel())) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(task = %self.task_name_with_subtask, error = %err, "error while canceling the task")
                }
                Err(_) => {
                    error!(task = %self.task_name_with_subtask, "panic while canceling the task")
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Checkpoint notifications
    // ------------------------------------------------------------------

    /// Trigger a checkpoint on the operator. Never blocks; the operator runs
    /// the trigger on the async call dispatcher.
    pub fn trigger_checkpoint_barrier(
        self: &Arc<Self>,
        checkpoint_id: CheckpointId,
        timestamp: i64,
        options: CheckpointOptions,
        advance_to_end_of_event_time: bool,
    ) {
        let invokable = self.invokable();
        let meta = CheckpointMetaData {
            checkpoint_id,
            timestamp,
        };

        let live = match invokable {
            Some(invokable) if self.execution_state() == ExecutionState::Running => Some(invokable),
            _ => None,
        };

        let Some(invokable) = live else {
            debug!(
                task = %self.task_name_with_subtask,
                checkpoint_id,
                "declining checkpoint request for non-running task"
            );
            self.checkpoint_responder.decline_checkpoint(
                self.job_id,
                self.execution_id,
                checkpoint_id,
                DeclineReason::TaskNotReady,
            );
            return;
        };

        let blocking = options.checkpoint_type.is_synchronous();
        let task = Arc::clone(self);
        // Checkpoint work runs off the task thread but shares its safety net,
        // because it may open streams on the task's behalf.
        let safety_net = self.safety_net.clone();
        let call = move || {
            let _net = safety_net;
            let triggered = catch_panic("checkpoint trigger", || {
                invokable.trigger_checkpoint(meta, &options, advance_to_end_of_event_time)
            });
            match triggered {
                Ok(true) => {}
                Ok(false) => {
                    task.checkpoint_responder.decline_checkpoint(
                        task.job_id,
                        task.execution_id,
                        checkpoint_id,
                        DeclineReason::TaskNotReady,
                    );
                }
                Err(err) => {
                    task.checkpoint_responder.decline_checkpoint(
                        task.job_id,
                        task.execution_id,
                        checkpoint_id,
                        DeclineReason::TriggerFailure,
                    );
                    if task.execution_state() == ExecutionState::Running {
                        task.fail_externally(err.context(format!(
                            "error while triggering checkpoint {checkpoint_id}"
                        )));
                    } else {
                        debug!(
                            task = %task.task_name_with_subtask,
                            checkpoint_id,
                            error = %err,
                            "error while triggering a checkpoint on a task that left RUNNING"
                        );
                    }
                }
            }
        };
        self.execute_async_call(
            format!("checkpoint trigger {checkpoint_id}"),
            blocking,
            call,
        );
    }

    /// Notify the operator that a checkpoint was confirmed. Never blocks.
    pub fn notify_checkpoint_complete(self: &Arc<Self>, checkpoint_id: CheckpointId) {
        let invokable = self.invokable();
        let live = match invokable {
            Some(invokable) if self.execution_state() == ExecutionState::Running => Some(invokable),
            _ => None,
        };
        let Some(invokable) = live else {
            debug!(
                task = %self.task_name_with_subtask,
                checkpoint_id,
                "ignoring checkpoint commit notification for non-running task"
            );
            return;
        };

        let task = Arc::clone(self);
        let call = move || {
            let result = catch_panic("checkpoint confirmation", || {
                invokable.notify_checkpoint_complete(checkpoint_id)?;
                task.task_state_manager.notify_checkpoint_complete(checkpoint_id);
                Ok(())
            });
            if let Err(err) = result {
                if task.execution_state() == ExecutionState::Running {
                    task.fail_externally(
                        err.context(format!("error while confirming checkpoint {checkpoint_id}")),
                    );
                } else {
                    debug!(
                        task = %task.task_name_with_subtask,
                        checkpoint_id,
                        error = %err,
                        "error while confirming a checkpoint on a task that left RUNNING"
                    );
                }
            }
        };
        self.execute_async_call(
            format!("checkpoint confirmation {checkpoint_id}"),
            false,
            call,
        );
    }

    /// Dispatch an asynchronous call on the invokable, lazily initializing
    /// the dispatcher. The dispatcher slot lock also serializes initialization
    /// against concurrent cancellation.
    fn execute_async_call(&self, name: String, blocking: bool, call: impl FnOnce() + Send + 'static) {
        let mut slot = self.dispatcher.lock().expect("dispatcher slot poisoned");

        if self.execution_state() != ExecutionState::Running {
            return;
        }

        if slot.is_none() {
            let user_code = self.user_code.lock().expect("user code registry poisoned").clone();
            let Some(user_code) = user_code else {
                error!(
                    task = %self.task_name_with_subtask,
                    call = %name,
                    "no user code registry available for async calls on a running task"
                );
                return;
            };
            match AsyncCallDispatcher::new(self.task_name_with_subtask.clone(), user_code) {
                Ok(dispatcher) => *slot = Some(Arc::new(dispatcher)),
                Err(err) => {
                    error!(
                        task = %self.task_name_with_subtask,
                        call = %name,
                        error = %err,
                        "could not initialize the async call dispatcher"
                    );
                    return;
                }
            }
            // Double-check: if the task was canceled while we created the
            // dispatcher, undo and bail.
            if self.execution_state() != ExecutionState::Running {
                if let Some(dispatcher) = slot.take() {
                    dispatcher.shutdown_now();
                }
                return;
            }
        }

        let Some(dispatcher) = slot.as_ref() else {
            return;
        };
        debug!(task = %self.task_name_with_subtask, call = %name, "submitting async call");
        if dispatcher.submit(name.clone(), blocking, call).is_err() {
            // May be a concurrent finish or cancellation; if not, something
            // is genuinely wrong.
            if self.execution_state() == ExecutionState::Running {
                error!(
                    task = %self.task_name_with_subtask,
                    call = %name,
                    blocking,
                    "async call was rejected even though the task is running"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Partition producer state probes
    // ------------------------------------------------------------------

    /// Ask for the state of the producer of `partition_id`. Non-blocking; the
    /// handle resolves on the container's executor so downstream callbacks do
    /// not run on a network thread.
    pub fn request_partition_producer_state(
        self: &Arc<Self>,
        dataset_id: IntermediateDataSetId,
        partition_id: ResultPartitionId,
    ) -> Completion<PartitionProducerStateResponseHandle> {
        let producer_future = self.partition_state_checker.request_partition_producer_state(
            self.job_id,
            dataset_id,
            partition_id,
        );
        let (completer, future) = completion();
        let task = Arc::clone(self);
        self.executor.execute(Box::new(move || {
            let producer_state = match producer_future.wait() {
                Ok(Ok(state)) => Ok(state),
                Ok(Err(err)) => Err(Arc::new(err)),
                Err(err) => Err(Arc::new(err)),
            };
            let handle = PartitionProducerStateResponseHandle::new(
                task.execution_state(),
                producer_state,
                TaskActionsHandle::new(&task),
            );
            completer.complete(handle);
        }));
        future
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) [{}]",
            self.task_name_with_subtask,
            self.execution_id,
            self.execution_state()
        )
    }
}

fn spawn_cancellation_thread(name: &str, body: impl FnOnce() + Send + 'static) {
    if let Err(err) = thread::Builder::new().name(name.into()).spawn(body) {
        error!(thread = name, error = %err, "could not spawn cancellation thread");
    }
}

#[cfg(test)]
#[path = "tests/task_tests.rs"]
mod tests;
