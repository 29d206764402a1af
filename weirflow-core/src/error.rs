//! Error kinds of the task container and their classification helpers.
//!
//! Most fallible seams use `anyhow::Result`; the kinds the worker node must
//! distinguish are typed here and recovered by downcast.

use std::panic::AssertUnwindSafe;

use anyhow::Result;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    /// Internal signal that the state drifted out of a live value during
    /// bootstrap or after the operator returned. Drives the exceptional exit
    /// but never populates the failure cause.
    #[error("task was canceled during setup or teardown")]
    CancelTask,

    /// No invokable factory is registered under the deployment's key. Kept
    /// distinct so the worker node can tell deploy bugs from runtime bugs.
    #[error("no invokable factory registered under key `{0}`")]
    MissingFactory(String),

    /// The library cache could not provide user code for the job.
    #[error("could not resolve user code: {0}")]
    UserCodeResolution(String),

    /// The task code exhausted its managed memory.
    #[error("task ran out of managed memory")]
    OutOfMemory,

    /// Unrecoverable runtime condition. The process halts on sight of this.
    #[error("fatal runtime error: {0}")]
    Fatal(String),
}

/// Transport-only wrapper used by collaborator seams to shorten propagation
/// chains. [`unwrap_transport`] removes it before classification so the
/// recorded failure cause is the underlying error.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportWrapper(pub anyhow::Error);

pub fn wrap_transport(err: anyhow::Error) -> anyhow::Error {
    anyhow::Error::new(TransportWrapper(err))
}

/// Strip a [`TransportWrapper`] if `err` is one; otherwise return `err`.
pub fn unwrap_transport(err: anyhow::Error) -> anyhow::Error {
    match err.downcast::<TransportWrapper>() {
        Ok(wrapper) => wrapper.0,
        Err(other) => other,
    }
}

pub fn is_cancel_task(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<TaskError>(), Some(TaskError::CancelTask))
}

pub fn is_out_of_memory(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<TaskError>(), Some(TaskError::OutOfMemory))
}

pub fn is_fatal(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<TaskError>(), Some(TaskError::Fatal(_)))
}

/// Run `f`, converting a panic into an error so user code escaping through a
/// panic funnels into the same exit path as a returned error.
pub fn catch_panic<T>(what: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("{what} panicked: {}", describe_panic(&*payload))),
    }
}

fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
