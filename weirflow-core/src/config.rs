//! Configuration surface of the task container.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::types::{BlobKey, JobId, JobVertexId};

/// String-keyed configuration map with typed getters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    entries: HashMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.entries.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }
}

/// Worker-level options governing every container hosted by the worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Period between escalating interrupts of a task that ignores the
    /// cooperative cancel.
    pub task_cancellation_interval: Duration,
    /// Hard deadline after which a stuck cancellation is escalated through
    /// the fatal-error channel. Zero disables the watchdog.
    pub task_cancellation_timeout: Duration,
    /// Halt the process when task code runs out of managed memory.
    pub halt_on_out_of_memory: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            task_cancellation_interval: Duration::from_secs(30),
            task_cancellation_timeout: Duration::from_secs(180),
            halt_on_out_of_memory: false,
        }
    }
}

/// Job-wide execution configuration, shipped serialized with the deployment
/// and deserialized during bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Overrides [`WorkerOptions::task_cancellation_interval`] when set.
    pub task_cancellation_interval_ms: Option<u64>,
    /// Overrides [`WorkerOptions::task_cancellation_timeout`] when set.
    pub task_cancellation_timeout_ms: Option<u64>,
}

impl ExecutionConfig {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Empty bytes deserialize to the default configuration.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        Ok(bincode::deserialize(data)?)
    }
}

/// A file the operator expects to find in the distributed cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedCacheEntry {
    pub name: String,
    pub source_path: String,
    pub executable: bool,
}

/// Construction inputs shared by every subtask of a job.
#[derive(Debug, Clone)]
pub struct JobInformation {
    pub job_id: JobId,
    pub job_name: String,
    pub job_configuration: Configuration,
    /// BLOB keys of the user code bundles the library cache must resolve.
    pub required_artifacts: Vec<BlobKey>,
    /// Serialized [`ExecutionConfig`].
    pub serialized_execution_config: Vec<u8>,
    pub distributed_cache_entries: Vec<DistributedCacheEntry>,
}

/// Construction inputs for one vertex of the job.
#[derive(Debug, Clone)]
pub struct TaskInformation {
    pub job_vertex_id: JobVertexId,
    pub task_name: String,
    pub number_of_subtasks: usize,
    /// Key under which the invokable factory is registered in the job's
    /// user code registry.
    pub invokable_factory_key: String,
    pub task_configuration: Configuration,
}
