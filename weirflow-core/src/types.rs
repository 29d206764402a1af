use serde::{Deserialize, Serialize};

/// Unique identifier for checkpoints, assigned by the coordinator.
pub type CheckpointId = u64;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job_{:x}", self.0)
    }
}

/// Unique identifier for a vertex of the job graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobVertexId(pub u32);

impl std::fmt::Display for JobVertexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vertex_{}", self.0)
    }
}

/// Unique identifier for one execution attempt of a parallel subtask.
///
/// A subtask may be retried; every retry gets a fresh attempt id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionAttemptId(pub u64);

impl std::fmt::Display for ExecutionAttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "attempt_{:x}", self.0)
    }
}

/// Identifier of the slot allocation the task is supposed to run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationId(pub u64);

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "allocation_{:x}", self.0)
    }
}

/// Identifier of an intermediate data set produced by one job vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntermediateDataSetId(pub u64);

impl std::fmt::Display for IntermediateDataSetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dataset_{:x}", self.0)
    }
}

/// Identifier of one produced result partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultPartitionId(pub u64);

impl std::fmt::Display for ResultPartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "partition_{:x}", self.0)
    }
}

/// Key of a permanent BLOB (a user code bundle or other job artifact).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobKey(pub String);

impl std::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one subtask execution, set at construction and immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_name: String,
    pub subtask_index: usize,
    pub number_of_subtasks: usize,
    pub attempt_number: usize,
}

impl TaskInfo {
    pub fn new(
        task_name: impl Into<String>,
        subtask_index: usize,
        number_of_subtasks: usize,
        attempt_number: usize,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            subtask_index,
            number_of_subtasks,
            attempt_number,
        }
    }

    /// Human-readable task name including the subtask index and attempt,
    /// e.g. `Source: words (2/4)#1`.
    pub fn task_name_with_subtask(&self) -> String {
        format!(
            "{} ({}/{})#{}",
            self.task_name,
            self.subtask_index + 1,
            self.number_of_subtasks,
            self.attempt_number
        )
    }
}
