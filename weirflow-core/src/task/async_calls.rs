//! Dispatcher for asynchronous calls on the invokable.
//!
//! Checkpoint triggers and confirmations must never run on the caller's
//! thread (the RPC layer) nor on the task thread (which may be deep in user
//! code). A single resident worker serializes the non-blocking calls so the
//! operator observes them in submission order; blocking calls — a synchronous
//! savepoint parking its thread for the whole snapshot — run on exactly one
//! extra thread, so a concurrently arriving confirmation still goes through.
//! Further blocking submissions queue behind that slot instead of growing the
//! thread count.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, unbounded};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::invokable::InvokableRegistry;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("async call dispatcher is shut down")]
pub(crate) struct RejectedExecution;

struct AsyncCall {
    name: String,
    job: Box<dyn FnOnce() + Send>,
}

/// State of the one extra slot for blocking calls. While the slot thread is
/// alive, further blocking calls wait here.
struct BlockingSlot {
    occupied: bool,
    queue: VecDeque<AsyncCall>,
}

pub(crate) struct AsyncCallDispatcher {
    sender: Sender<AsyncCall>,
    shutdown: Arc<AtomicBool>,
    blocking: Arc<Mutex<BlockingSlot>>,
    task_name: String,
    /// Pins the job's user code for calls still queued while the task tears
    /// down.
    _user_code: Arc<InvokableRegistry>,
}

impl AsyncCallDispatcher {
    pub(crate) fn new(task_name: String, user_code: Arc<InvokableRegistry>) -> Result<Self> {
        let (sender, receiver) = unbounded::<AsyncCall>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_shutdown = Arc::clone(&shutdown);
        let worker_task_name = task_name.clone();
        thread::Builder::new()
            .name("task-async-calls".into())
            .spawn(move || {
                for call in receiver {
                    if worker_shutdown.load(Ordering::Acquire) {
                        debug!(
                            task = %worker_task_name,
                            call = %call.name,
                            "discarding queued async call after shutdown"
                        );
                        continue;
                    }
                    run_call(&worker_task_name, call);
                }
            })
            .context("could not spawn the async call worker")?;

        Ok(Self {
            sender,
            shutdown,
            blocking: Arc::new(Mutex::new(BlockingSlot {
                occupied: false,
                queue: VecDeque::new(),
            })),
            task_name,
            _user_code: user_code,
        })
    }

    /// Submit a call. Non-blocking calls run on the resident worker in
    /// submission order; blocking calls run on the single extra slot, one at
    /// a time.
    pub(crate) fn submit(
        &self,
        name: impl Into<String>,
        blocking: bool,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<(), RejectedExecution> {
        if self.is_shutdown() {
            return Err(RejectedExecution);
        }
        let call = AsyncCall {
            name: name.into(),
            job: Box::new(job),
        };
        if !blocking {
            return self.sender.send(call).map_err(|_| RejectedExecution);
        }
        self.submit_blocking(call)
    }

    fn submit_blocking(&self, call: AsyncCall) -> Result<(), RejectedExecution> {
        {
            let mut slot = self.blocking.lock().expect("blocking slot poisoned");
            if slot.occupied {
                warn!(
                    task = %self.task_name,
                    call = %call.name,
                    queued = slot.queue.len() + 1,
                    "blocking slot is occupied, queuing the blocking call behind it"
                );
                slot.queue.push_back(call);
                return Ok(());
            }
            slot.occupied = true;
        }

        let shutdown = Arc::clone(&self.shutdown);
        let blocking = Arc::clone(&self.blocking);
        let task_name = self.task_name.clone();
        let spawned = thread::Builder::new()
            .name("task-async-blocking".into())
            .spawn(move || {
                let mut call = call;
                loop {
                    if shutdown.load(Ordering::Acquire) {
                        debug!(
                            task = %task_name,
                            call = %call.name,
                            "discarding queued async call after shutdown"
                        );
                    } else {
                        run_call(&task_name, call);
                    }
                    let mut slot = blocking.lock().expect("blocking slot poisoned");
                    match slot.queue.pop_front() {
                        Some(next) => call = next,
                        None => {
                            slot.occupied = false;
                            return;
                        }
                    }
                }
            });
        if spawned.is_err() {
            // The slot was reserved by us and the queue only grows while it
            // is occupied, so there is nothing queued to hand over yet.
            let mut slot = self.blocking.lock().expect("blocking slot poisoned");
            slot.occupied = false;
            return Err(RejectedExecution);
        }
        Ok(())
    }

    /// Stop accepting work and discard anything still queued. Never waits for
    /// in-flight calls.
    pub(crate) fn shutdown_now(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

fn run_call(task_name: &str, call: AsyncCall) {
    debug!(task = %task_name, call = %call.name, "invoking async call");
    if std::panic::catch_unwind(AssertUnwindSafe(call.job)).is_err() {
        error!(task = %task_name, call = %call.name, "async call panicked");
    }
}

#[cfg(test)]
#[path = "tests/async_calls_tests.rs"]
mod tests;
