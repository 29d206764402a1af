//! Shared test doubles: recording collaborators, a scriptable invokable and a
//! harness that wires a complete task container against them.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

use crate::config::{
    Configuration, DistributedCacheEntry, ExecutionConfig, JobInformation, TaskInformation,
    WorkerOptions,
};
use crate::contracts::{
    CacheCopyFuture, CheckpointResponder, Completion, DeclineReason, FileCache, LibraryCache,
    MemoryManager, PartitionStateChecker, PermanentBlobService, TaskExecutionStateUpdate,
    TaskStateManager, ThreadSpawnExecutor, WorkerActions, completion,
};
use crate::error::TaskError;
use crate::execution_state::ExecutionState;
use crate::invokable::{
    CheckpointMetaData, CheckpointOptions, Environment, Invokable, InvokableRegistry,
};
use crate::metrics::TaskMetricGroup;
use crate::network::{
    InputGate, InputGateDeploymentDescriptor, NetworkEnvironment,
    ResultPartitionDeploymentDescriptor, ResultPartitionWriter, TaskEventDispatcher,
};
use crate::task::cancellation::InterruptHandle;
use crate::task::{Task, TaskServices};
use crate::types::{
    AllocationId, BlobKey, CheckpointId, ExecutionAttemptId, IntermediateDataSetId, JobId,
    JobVertexId, ResultPartitionId,
};

pub(crate) const FACTORY_KEY: &str = "test-operator";

/// Shared, ordered log of collaborator calls, for acquisition/release order
/// assertions.
pub(crate) type EventLog = Arc<Mutex<Vec<String>>>;

pub(crate) fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub(crate) fn log(events: &EventLog, entry: impl Into<String>) {
    events.lock().unwrap().push(entry.into());
}

pub(crate) fn entries(events: &EventLog) -> Vec<String> {
    events.lock().unwrap().clone()
}

/// Poll `cond` until it holds or `timeout` elapses.
pub(crate) fn wait_until(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Recording collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RecordingWorkerActions {
    pub updates: Mutex<Vec<TaskExecutionStateUpdate>>,
    pub fatal_errors: Mutex<Vec<String>>,
}

impl RecordingWorkerActions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn states(&self) -> Vec<ExecutionState> {
        self.updates.lock().unwrap().iter().map(|u| u.state).collect()
    }

    pub fn terminal_update(&self) -> Option<TaskExecutionStateUpdate> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.state.is_terminal())
            .cloned()
    }

    pub fn wait_for_terminal(&self, timeout: Duration) -> TaskExecutionStateUpdate {
        wait_until("a terminal state update", timeout, || {
            self.terminal_update().is_some()
        });
        self.terminal_update().unwrap()
    }

    pub fn wait_for_fatal(&self, timeout: Duration) -> String {
        wait_until("a fatal error notification", timeout, || {
            !self.fatal_errors.lock().unwrap().is_empty()
        });
        self.fatal_errors.lock().unwrap()[0].clone()
    }

    pub fn fatal_count(&self) -> usize {
        self.fatal_errors.lock().unwrap().len()
    }
}

impl WorkerActions for RecordingWorkerActions {
    fn update_task_execution_state(&self, update: TaskExecutionStateUpdate) {
        self.updates.lock().unwrap().push(update);
    }

    fn notify_fatal_error(&self, message: &str, _cause: Option<Arc<anyhow::Error>>) {
        self.fatal_errors.lock().unwrap().push(message.to_string());
    }
}

#[derive(Default)]
pub(crate) struct RecordingCheckpointResponder {
    pub declines: Mutex<Vec<(CheckpointId, DeclineReason)>>,
}

impl RecordingCheckpointResponder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn declines(&self) -> Vec<(CheckpointId, DeclineReason)> {
        self.declines.lock().unwrap().clone()
    }

    pub fn wait_for_decline(&self, checkpoint_id: CheckpointId, timeout: Duration) -> DeclineReason {
        wait_until("a checkpoint decline", timeout, || {
            self.declines().iter().any(|(id, _)| *id == checkpoint_id)
        });
        self.declines()
            .into_iter()
            .find(|(id, _)| *id == checkpoint_id)
            .unwrap()
            .1
    }
}

impl CheckpointResponder for RecordingCheckpointResponder {
    fn decline_checkpoint(
        &self,
        _job_id: JobId,
        _execution_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        reason: DeclineReason,
    ) {
        self.declines.lock().unwrap().push((checkpoint_id, reason));
    }
}

#[derive(Default)]
pub(crate) struct TestTaskStateManager {
    pub completed: Mutex<Vec<CheckpointId>>,
}

impl TaskStateManager for TestTaskStateManager {
    fn notify_checkpoint_complete(&self, checkpoint_id: CheckpointId) {
        self.completed.lock().unwrap().push(checkpoint_id);
    }
}

pub(crate) struct TestMemoryManager {
    events: EventLog,
}

impl MemoryManager for TestMemoryManager {
    fn release_all(&self, owner: ExecutionAttemptId) {
        log(&self.events, format!("memory:release {owner}"));
    }
}

pub(crate) struct TestBlobService {
    events: EventLog,
}

impl PermanentBlobService for TestBlobService {
    fn register_job(&self, _job_id: JobId) -> Result<()> {
        log(&self.events, "blob:register");
        Ok(())
    }

    fn release_job(&self, _job_id: JobId) {
        log(&self.events, "blob:release");
    }
}

pub(crate) struct TestLibraryCache {
    registry: Option<Arc<InvokableRegistry>>,
    delay: Duration,
    fail_register: bool,
    events: EventLog,
}

impl LibraryCache for TestLibraryCache {
    fn register_task(
        &self,
        _job_id: JobId,
        _execution_id: ExecutionAttemptId,
        _required_artifacts: &[BlobKey],
    ) -> Result<()> {
        log(&self.events, "library:register");
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fail_register {
            return Err(anyhow!("artifact download failed"));
        }
        Ok(())
    }

    fn registry(&self, _job_id: JobId) -> Option<Arc<InvokableRegistry>> {
        self.registry.clone()
    }

    fn unregister_task(&self, _job_id: JobId, _execution_id: ExecutionAttemptId) {
        log(&self.events, "library:unregister");
    }
}

pub(crate) struct TestFileCache {
    events: EventLog,
}

impl FileCache for TestFileCache {
    fn create_tmp_file(
        &self,
        entry: &DistributedCacheEntry,
        _job_id: JobId,
        _execution_id: ExecutionAttemptId,
    ) -> Result<CacheCopyFuture> {
        log(&self.events, format!("filecache:copy {}", entry.name));
        let (completer, future) = completion();
        completer.complete(Ok(PathBuf::from(format!("/tmp/cache/{}", entry.name))));
        Ok(future)
    }

    fn release_job(&self, _job_id: JobId, _execution_id: ExecutionAttemptId) {
        log(&self.events, "filecache:release");
    }
}

pub(crate) struct TestEventDispatcher {
    events: EventLog,
}

impl TaskEventDispatcher for TestEventDispatcher {
    fn register_partition(&self, partition_id: ResultPartitionId) {
        log(&self.events, format!("events:register {partition_id}"));
    }

    fn unregister_partition(&self, partition_id: ResultPartitionId) {
        log(&self.events, format!("events:unregister {partition_id}"));
    }
}

pub(crate) struct TestPartitionStateChecker {
    pub response: Mutex<Option<Result<ExecutionState>>>,
}

impl PartitionStateChecker for TestPartitionStateChecker {
    fn request_partition_producer_state(
        &self,
        _job_id: JobId,
        _dataset_id: IntermediateDataSetId,
        _partition_id: ResultPartitionId,
    ) -> Completion<Result<ExecutionState>> {
        let (completer, future) = completion();
        let response = self
            .response
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Ok(ExecutionState::Running));
        completer.complete(response);
        future
    }
}

// ---------------------------------------------------------------------------
// Network doubles
// ---------------------------------------------------------------------------

pub(crate) struct TestPartitionWriter {
    id: ResultPartitionId,
    events: EventLog,
    closed: AtomicBool,
    fail_setup: bool,
}

impl ResultPartitionWriter for TestPartitionWriter {
    fn partition_id(&self) -> ResultPartitionId {
        self.id
    }

    fn setup(&self) -> Result<()> {
        if self.fail_setup {
            return Err(anyhow!("insufficient network buffers"));
        }
        log(&self.events, format!("partition:setup {}", self.id));
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        log(&self.events, format!("partition:finish {}", self.id));
        Ok(())
    }

    fn fail(&self, cause: Option<Arc<anyhow::Error>>) {
        let cause = cause.map(|c| c.to_string()).unwrap_or_else(|| "none".into());
        log(&self.events, format!("partition:fail {} {cause}", self.id));
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log(&self.events, format!("partition:close {}", self.id));
        }
    }
}

pub(crate) struct TestInputGate {
    index: usize,
    events: EventLog,
    closed: AtomicBool,
}

impl InputGate for TestInputGate {
    fn setup(&self) -> Result<()> {
        log(&self.events, format!("gate:setup {}", self.index));
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log(&self.events, format!("gate:close {}", self.index));
        }
    }
}

pub(crate) struct TestNetworkEnvironment {
    events: EventLog,
    fail_partition_setup: bool,
}

impl NetworkEnvironment for TestNetworkEnvironment {
    fn create_result_partition_writers(
        &self,
        _owner: &str,
        _job_id: JobId,
        _execution_id: ExecutionAttemptId,
        descriptors: &[ResultPartitionDeploymentDescriptor],
    ) -> Result<Vec<Arc<dyn ResultPartitionWriter>>> {
        Ok(descriptors
            .iter()
            .map(|descriptor| {
                Arc::new(TestPartitionWriter {
                    id: descriptor.partition_id,
                    events: Arc::clone(&self.events),
                    closed: AtomicBool::new(false),
                    fail_setup: self.fail_partition_setup,
                }) as Arc<dyn ResultPartitionWriter>
            })
            .collect())
    }

    fn create_input_gates(
        &self,
        _owner: &str,
        _execution_id: ExecutionAttemptId,
        descriptors: &[InputGateDeploymentDescriptor],
    ) -> Result<Vec<Arc<dyn InputGate>>> {
        Ok(descriptors
            .iter()
            .enumerate()
            .map(|(index, _)| {
                Arc::new(TestInputGate {
                    index,
                    events: Arc::clone(&self.events),
                    closed: AtomicBool::new(false),
                }) as Arc<dyn InputGate>
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Scriptable invokable
// ---------------------------------------------------------------------------

/// What the scripted operator does inside `invoke`.
#[derive(Debug, Clone)]
pub(crate) enum InvokeBehavior {
    /// Return immediately.
    Finish,
    /// Fail with the given message.
    Fail(String),
    /// Fail with the typed out-of-memory error.
    FailOutOfMemory,
    /// Panic with the given message.
    Panic(String),
    /// Park cooperatively until canceled or interrupted, then return.
    BlockUntilInterrupted,
    /// Sleep for the given duration, ignoring interrupts.
    SleepIgnoringInterrupts(Duration),
}

/// Observable side effects of the scripted operator, shared with the test.
#[derive(Default)]
pub(crate) struct InvokableProbe {
    pub invoke_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
    pub invoke_thread: Mutex<Option<String>>,
    pub triggered: Mutex<Vec<CheckpointId>>,
    pub completed: Mutex<Vec<CheckpointId>>,
    pub invoke_returned: AtomicBool,
    /// Whether the executing thread had been interrupted by the time `invoke`
    /// returned.
    pub was_interrupted: AtomicBool,
}

pub(crate) struct TestInvokable {
    behavior: InvokeBehavior,
    probe: Arc<InvokableProbe>,
    interrupt: InterruptHandle,
    canceled: AtomicBool,
    interrupt_on_cancel: bool,
    /// `Some(value)` returns the value; `None` fails the trigger.
    trigger_result: Option<bool>,
}

impl Invokable for TestInvokable {
    fn invoke(&self) -> Result<()> {
        self.probe.invoke_calls.fetch_add(1, Ordering::SeqCst);
        *self.probe.invoke_thread.lock().unwrap() =
            thread::current().name().map(str::to_string);

        let result = match &self.behavior {
            InvokeBehavior::Finish => Ok(()),
            InvokeBehavior::Fail(message) => Err(anyhow!("{message}")),
            InvokeBehavior::FailOutOfMemory => Err(TaskError::OutOfMemory.into()),
            InvokeBehavior::Panic(message) => panic!("{}", message.clone()),
            InvokeBehavior::BlockUntilInterrupted => {
                while !self.canceled.load(Ordering::SeqCst) && !self.interrupt.is_interrupted() {
                    self.interrupt.interruptible_park(Duration::from_millis(5));
                }
                Ok(())
            }
            InvokeBehavior::SleepIgnoringInterrupts(duration) => {
                thread::sleep(*duration);
                Ok(())
            }
        };
        self.probe
            .was_interrupted
            .store(self.interrupt.is_interrupted(), Ordering::SeqCst);
        self.probe.invoke_returned.store(true, Ordering::SeqCst);
        result
    }

    fn cancel(&self) -> Result<()> {
        self.probe.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.canceled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn should_interrupt_on_cancel(&self) -> bool {
        self.interrupt_on_cancel
    }

    fn trigger_checkpoint(
        &self,
        meta: CheckpointMetaData,
        options: &CheckpointOptions,
        _advance_to_end_of_event_time: bool,
    ) -> Result<bool> {
        self.probe.triggered.lock().unwrap().push(meta.checkpoint_id);
        if options.checkpoint_type.is_synchronous() {
            // A synchronous savepoint parks its triggering thread.
            thread::sleep(Duration::from_millis(500));
        }
        match self.trigger_result {
            Some(value) => Ok(value),
            None => Err(anyhow!("injected trigger failure")),
        }
    }

    fn notify_checkpoint_complete(&self, checkpoint_id: CheckpointId) -> Result<()> {
        self.probe.completed.lock().unwrap().push(checkpoint_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub(crate) struct Harness {
    pub task: Arc<Task>,
    pub worker: Arc<RecordingWorkerActions>,
    pub checkpoints: Arc<RecordingCheckpointResponder>,
    pub task_state: Arc<TestTaskStateManager>,
    pub partition_states: Arc<TestPartitionStateChecker>,
    pub probe: Arc<InvokableProbe>,
    pub events: EventLog,
    pub metrics: Arc<TaskMetricGroup>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub fn wait_until_running(&self) {
        wait_until("the task to reach RUNNING", Duration::from_secs(5), || {
            self.task.execution_state() == ExecutionState::Running
        });
    }
}

pub(crate) struct HarnessBuilder {
    behavior: InvokeBehavior,
    interrupt_on_cancel: bool,
    trigger_result: Option<bool>,
    options: WorkerOptions,
    execution_config: ExecutionConfig,
    library_delay: Duration,
    library_register_fails: bool,
    registry_unavailable: bool,
    registry_missing_key: bool,
    factory_fails: bool,
    partition_count: usize,
    gate_count: usize,
    cache_entries: Vec<DistributedCacheEntry>,
    partition_setup_fails: bool,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            behavior: InvokeBehavior::Finish,
            interrupt_on_cancel: true,
            trigger_result: Some(true),
            options: WorkerOptions::default(),
            execution_config: ExecutionConfig::default(),
            library_delay: Duration::ZERO,
            library_register_fails: false,
            registry_unavailable: false,
            registry_missing_key: false,
            factory_fails: false,
            partition_count: 1,
            gate_count: 1,
            cache_entries: Vec::new(),
            partition_setup_fails: false,
        }
    }
}

impl HarnessBuilder {
    pub fn behavior(mut self, behavior: InvokeBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn interrupt_on_cancel(mut self, interrupt: bool) -> Self {
        self.interrupt_on_cancel = interrupt;
        self
    }

    pub fn trigger_result(mut self, result: Option<bool>) -> Self {
        self.trigger_result = result;
        self
    }

    pub fn options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn execution_config(mut self, config: ExecutionConfig) -> Self {
        self.execution_config = config;
        self
    }

    pub fn library_delay(mut self, delay: Duration) -> Self {
        self.library_delay = delay;
        self
    }

    pub fn library_register_fails(mut self) -> Self {
        self.library_register_fails = true;
        self
    }

    pub fn registry_unavailable(mut self) -> Self {
        self.registry_unavailable = true;
        self
    }

    pub fn registry_missing_key(mut self) -> Self {
        self.registry_missing_key = true;
        self
    }

    pub fn factory_fails(mut self) -> Self {
        self.factory_fails = true;
        self
    }

    pub fn partitions(mut self, count: usize) -> Self {
        self.partition_count = count;
        self
    }

    pub fn gates(mut self, count: usize) -> Self {
        self.gate_count = count;
        self
    }

    pub fn cache_entry(mut self, name: &str) -> Self {
        self.cache_entries.push(DistributedCacheEntry {
            name: name.to_string(),
            source_path: format!("hdfs:///cache/{name}"),
            executable: false,
        });
        self
    }

    pub fn partition_setup_fails(mut self) -> Self {
        self.partition_setup_fails = true;
        self
    }

    pub fn build(self) -> Harness {
        let events = event_log();
        let probe = Arc::new(InvokableProbe::default());

        let mut registry = InvokableRegistry::new();
        if !self.registry_missing_key {
            let behavior = self.behavior.clone();
            let factory_probe = Arc::clone(&probe);
            let interrupt_on_cancel = self.interrupt_on_cancel;
            let trigger_result = self.trigger_result;
            let factory_fails = self.factory_fails;
            registry.register(FACTORY_KEY, move |environment: Environment| {
                if factory_fails {
                    return Err(anyhow!("operator construction failed"));
                }
                Ok(Box::new(TestInvokable {
                    behavior: behavior.clone(),
                    probe: Arc::clone(&factory_probe),
                    interrupt: environment.interrupt.clone(),
                    canceled: AtomicBool::new(false),
                    interrupt_on_cancel,
                    trigger_result,
                }))
            });
        }

        let worker = RecordingWorkerActions::new();
        let checkpoints = RecordingCheckpointResponder::new();
        let task_state = Arc::new(TestTaskStateManager::default());
        let partition_states = Arc::new(TestPartitionStateChecker {
            response: Mutex::new(None),
        });
        let metrics = Arc::new(TaskMetricGroup::new("job_1.vertex_7.0"));

        let services = TaskServices {
            network: Arc::new(TestNetworkEnvironment {
                events: Arc::clone(&events),
                fail_partition_setup: self.partition_setup_fails,
            }),
            event_dispatcher: Arc::new(TestEventDispatcher {
                events: Arc::clone(&events),
            }),
            memory_manager: Arc::new(TestMemoryManager {
                events: Arc::clone(&events),
            }),
            task_state_manager: Arc::clone(&task_state) as Arc<dyn TaskStateManager>,
            worker_actions: Arc::clone(&worker) as Arc<dyn WorkerActions>,
            checkpoint_responder: Arc::clone(&checkpoints) as Arc<dyn CheckpointResponder>,
            blob_service: Arc::new(TestBlobService {
                events: Arc::clone(&events),
            }),
            library_cache: Arc::new(TestLibraryCache {
                registry: if self.registry_unavailable {
                    None
                } else {
                    Some(Arc::new(registry))
                },
                delay: self.library_delay,
                fail_register: self.library_register_fails,
                events: Arc::clone(&events),
            }),
            file_cache: Arc::new(TestFileCache {
                events: Arc::clone(&events),
            }),
            partition_state_checker: Arc::clone(&partition_states)
                as Arc<dyn PartitionStateChecker>,
            executor: Arc::new(ThreadSpawnExecutor),
        };

        let job = JobInformation {
            job_id: JobId(1),
            job_name: "wordcount".into(),
            job_configuration: Configuration::new(),
            required_artifacts: vec![BlobKey("bundle-1".into())],
            serialized_execution_config: self.execution_config.to_bytes().unwrap(),
            distributed_cache_entries: self.cache_entries,
        };
        let task_information = TaskInformation {
            job_vertex_id: JobVertexId(7),
            task_name: "TestOperator".into(),
            number_of_subtasks: 2,
            invokable_factory_key: FACTORY_KEY.into(),
            task_configuration: Configuration::new(),
        };

        let partition_descriptors: Vec<ResultPartitionDeploymentDescriptor> = (1..=self
            .partition_count)
            .map(|index| ResultPartitionDeploymentDescriptor {
                partition_id: ResultPartitionId(index as u64),
                dataset_id: IntermediateDataSetId(100 + index as u64),
                number_of_subpartitions: 2,
            })
            .collect();
        let gate_descriptors: Vec<InputGateDeploymentDescriptor> = (0..self.gate_count)
            .map(|index| InputGateDeploymentDescriptor {
                consumed_dataset_id: IntermediateDataSetId(200 + index as u64),
                consumed_partitions: vec![ResultPartitionId(300 + index as u64)],
            })
            .collect();

        let task = Task::new(
            job,
            task_information,
            ExecutionAttemptId(0xbeef),
            AllocationId(5),
            0,
            0,
            &partition_descriptors,
            &gate_descriptors,
            &self.options,
            Arc::clone(&metrics),
            services,
        )
        .expect("harness task construction failed");

        Harness {
            task,
            worker,
            checkpoints,
            task_state,
            partition_states,
            probe,
            events,
            metrics,
        }
    }
}
