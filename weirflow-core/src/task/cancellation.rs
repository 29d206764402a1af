//! The cancellation triad and its thread primitives.
//!
//! Cancelling a running task uses three separate threads as a safety net
//! against user code that refuses to cooperate:
//!
//! - [`TaskCanceler`] calls the operator's cancel hook and closes the network
//!   resources, for fast thread termination.
//! - [`TaskInterrupter`] periodically interrupts the executing thread to pull
//!   it out of blocking waits.
//! - [`TaskCancelerWatchDog`] waits until the cancellation timeout and then
//!   escalates through the worker's fatal-error channel.
//!
//! The interrupter is separate from the canceler because the cancel hook may
//! itself block; the watchdog is separate from the interrupter so escalation
//! can never be delayed by an interrupt loop.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::contracts::WorkerActions;
use crate::invokable::Invokable;

/// Cooperative interrupt signal for the executing thread.
///
/// An interrupt sets a sticky flag and unparks the bound thread. Operators
/// observe it by polling [`Self::is_interrupted`] or by parking through
/// [`Self::interruptible_park`]; plain sleeps are not woken.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    inner: Arc<InterruptInner>,
}

#[derive(Default)]
struct InterruptInner {
    interrupted: AtomicBool,
    target: Mutex<Option<Thread>>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the handle to the calling thread. The executing thread does this
    /// once before any task code runs.
    pub fn bind_current_thread(&self) {
        let mut target = self.inner.target.lock().expect("interrupt target poisoned");
        *target = Some(thread::current());
    }

    /// Set the interrupt flag and unpark the bound thread.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
        let target = self
            .inner
            .target
            .lock()
            .expect("interrupt target poisoned")
            .clone();
        if let Some(thread) = target {
            thread.unpark();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// Park the calling thread up to `timeout`, returning early on interrupt.
    /// Returns true when the interrupt flag is set. Only meaningful on the
    /// bound thread.
    pub fn interruptible_park(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_interrupted() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
        self.is_interrupted()
    }
}

/// Liveness signal of the executing thread.
///
/// The driver marks termination as its very last action; cancellation threads
/// wait on this instead of holding the join handle, so none of them can ever
/// block on thread teardown.
#[derive(Clone)]
pub struct ThreadWatch {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Default for ThreadWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadWatch {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn mark_terminated(&self) {
        let (lock, cvar) = &*self.inner;
        let mut terminated = lock.lock().expect("thread watch poisoned");
        *terminated = true;
        cvar.notify_all();
    }

    pub fn is_alive(&self) -> bool {
        let (lock, _) = &*self.inner;
        !*lock.lock().expect("thread watch poisoned")
    }

    /// Wait until the watched thread terminates or `timeout` elapses. Returns
    /// true when the thread terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut terminated = lock.lock().expect("thread watch poisoned");
        while !*terminated {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(terminated, deadline - now)
                .expect("thread watch poisoned");
            terminated = guard;
        }
        true
    }
}

/// Calls the operator's cancel hook, closes network resources and sends the
/// initial interrupt.
pub(crate) struct TaskCanceler {
    invokable: Arc<dyn Invokable>,
    network_closer: Box<dyn FnOnce() + Send>,
    interrupt: InterruptHandle,
    task_name: String,
}

impl TaskCanceler {
    pub(crate) fn new(
        invokable: Arc<dyn Invokable>,
        network_closer: Box<dyn FnOnce() + Send>,
        interrupt: InterruptHandle,
        task_name: String,
    ) -> Self {
        Self {
            invokable,
            network_closer,
            interrupt,
            task_name,
        }
    }

    pub(crate) fn run(self) {
        // The user-defined cancel hook may fail; we continue regardless.
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.invokable.cancel())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(task = %self.task_name, error = %err, "error while canceling the task")
            }
            Err(_) => error!(task = %self.task_name, "panic while canceling the task"),
        }

        // Close partitions and gates only after the cancel hook, so auxiliary
        // threads blocked on I/O observe a closed stream rather than a
        // spurious failure while the operator still runs.
        (self.network_closer)();

        if self.invokable.should_interrupt_on_cancel() {
            self.interrupt.interrupt();
        }
    }
}

/// Sends the delayed, periodic interrupts to the executing thread.
pub(crate) struct TaskInterrupter {
    invokable: Arc<dyn Invokable>,
    watch: ThreadWatch,
    interrupt: InterruptHandle,
    task_name: String,
    interrupt_interval: Duration,
}

impl TaskInterrupter {
    pub(crate) fn new(
        invokable: Arc<dyn Invokable>,
        watch: ThreadWatch,
        interrupt: InterruptHandle,
        task_name: String,
        interrupt_interval: Duration,
    ) -> Self {
        Self {
            invokable,
            watch,
            interrupt,
            task_name,
            interrupt_interval,
        }
    }

    pub(crate) fn run(self) {
        // Initial grace period: in the common case the canceler's first
        // interrupt ends the thread before we ever act.
        if self.watch.await_termination(self.interrupt_interval) {
            return;
        }

        while self.invokable.should_interrupt_on_cancel() && self.watch.is_alive() {
            warn!(
                task = %self.task_name,
                interval_ms = self.interrupt_interval.as_millis() as u64,
                "task did not react to the cancellation signal, interrupting the executing thread again"
            );
            self.interrupt.interrupt();
            if self.watch.await_termination(self.interrupt_interval) {
                return;
            }
        }
    }
}

/// Escalates a cancellation that misses its deadline.
pub(crate) struct TaskCancelerWatchDog {
    watch: ThreadWatch,
    worker: Arc<dyn WorkerActions>,
    timeout: Duration,
    task_name: String,
}

impl TaskCancelerWatchDog {
    pub(crate) fn new(
        watch: ThreadWatch,
        worker: Arc<dyn WorkerActions>,
        timeout: Duration,
        task_name: String,
    ) -> Self {
        Self {
            watch,
            worker,
            timeout,
            task_name,
        }
    }

    pub(crate) fn run(self) {
        if self.watch.await_termination(self.timeout) {
            return;
        }
        let message = format!(
            "task {} did not exit gracefully within {} ms",
            self.task_name,
            self.timeout.as_millis()
        );
        error!(task = %self.task_name, "{message}");
        self.worker.notify_fatal_error(&message, None);
    }
}

#[cfg(test)]
#[path = "tests/cancellation_tests.rs"]
mod tests;
