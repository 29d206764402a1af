//! Contracts toward the shuffle subsystem: produced partitions, input gates
//! and the event dispatcher.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::types::{ExecutionAttemptId, IntermediateDataSetId, JobId, ResultPartitionId};

/// Descriptor of one partition this subtask produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPartitionDeploymentDescriptor {
    pub partition_id: ResultPartitionId,
    pub dataset_id: IntermediateDataSetId,
    pub number_of_subpartitions: usize,
}

/// Descriptor of one gate this subtask consumes through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputGateDeploymentDescriptor {
    pub consumed_dataset_id: IntermediateDataSetId,
    pub consumed_partitions: Vec<ResultPartitionId>,
}

/// Writer for one produced partition.
///
/// `close` may be reached twice: once early by the canceler to unblock
/// auxiliary I/O threads, once by the task thread's cleanup pass.
/// Implementations must make it idempotent.
pub trait ResultPartitionWriter: Send + Sync {
    fn partition_id(&self) -> ResultPartitionId;

    /// Bind the partition to the shuffle substrate. This may reserve buffer
    /// memory and can fail when the worker is out of network memory.
    fn setup(&self) -> Result<()>;

    /// Mark the partition complete so consumers observe a finished stream.
    fn finish(&self) -> Result<()>;

    /// Mark the partition failed so downstream consumers observe a failed
    /// producer.
    fn fail(&self, cause: Option<Arc<anyhow::Error>>);

    fn close(&self);
}

/// Reader over all partitions feeding one input of this subtask.
///
/// `close` must be idempotent, for the same reason as
/// [`ResultPartitionWriter::close`].
pub trait InputGate: Send + Sync {
    fn setup(&self) -> Result<()>;
    fn close(&self);
}

/// Factory the worker's shuffle layer exposes for wiring a task. Creation is
/// passive; binding resources happens in the writers' and gates' `setup`.
pub trait NetworkEnvironment: Send + Sync {
    fn create_result_partition_writers(
        &self,
        owner: &str,
        job_id: JobId,
        execution_id: ExecutionAttemptId,
        descriptors: &[ResultPartitionDeploymentDescriptor],
    ) -> Result<Vec<Arc<dyn ResultPartitionWriter>>>;

    fn create_input_gates(
        &self,
        owner: &str,
        execution_id: ExecutionAttemptId,
        descriptors: &[InputGateDeploymentDescriptor],
    ) -> Result<Vec<Arc<dyn InputGate>>>;
}

/// Dispatcher routing task events between producers and consumers of a
/// partition.
pub trait TaskEventDispatcher: Send + Sync {
    fn register_partition(&self, partition_id: ResultPartitionId);
    fn unregister_partition(&self, partition_id: ResultPartitionId);
}
