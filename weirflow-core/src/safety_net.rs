//! Per-task registry guarding against leaked file system streams.
//!
//! The execution driver arms the net when it enters bootstrap and closes it
//! unconditionally during cleanup. Task code and asynchronous checkpoint work
//! receive the handle by value and register streams they open, so anything
//! the operator leaks is closed when the task exits.

use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use tracing::{debug, warn};

type CloseFn = Box<dyn FnOnce() -> Result<()> + Send>;

struct NetState {
    armed: bool,
    guarded: Vec<(String, CloseFn)>,
}

/// Cheaply cloneable handle to one task's safety net.
#[derive(Clone)]
pub struct FileSystemSafetyNet {
    owner: String,
    inner: Arc<Mutex<NetState>>,
}

impl FileSystemSafetyNet {
    /// Create an unarmed net. Registrations are rejected until [`Self::arm`].
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            inner: Arc::new(Mutex::new(NetState {
                armed: false,
                guarded: Vec::new(),
            })),
        }
    }

    pub fn arm(&self) {
        let mut state = self.inner.lock().expect("safety net poisoned");
        state.armed = true;
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().expect("safety net poisoned").armed
    }

    /// Guard a stream: `close` runs when the net closes, unless the stream
    /// was already closed by its owner.
    pub fn register(
        &self,
        label: impl Into<String>,
        close: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let mut state = self.inner.lock().expect("safety net poisoned");
        if !state.armed {
            bail!("safety net for {} is not armed", self.owner);
        }
        state.guarded.push((label.into(), Box::new(close)));
        Ok(())
    }

    pub fn guarded_count(&self) -> usize {
        self.inner.lock().expect("safety net poisoned").guarded.len()
    }

    /// Close every guarded stream, newest first, and disarm. Idempotent, and a
    /// no-op when the net was never armed. Close failures are logged only.
    pub fn close_all(&self) {
        let (was_armed, guarded) = {
            let mut state = self.inner.lock().expect("safety net poisoned");
            let was_armed = state.armed;
            state.armed = false;
            (was_armed, std::mem::take(&mut state.guarded))
        };
        if !was_armed {
            return;
        }
        if !guarded.is_empty() {
            debug!(
                task = %self.owner,
                leaked = guarded.len(),
                "closing streams left open by the task"
            );
        }
        for (label, close) in guarded.into_iter().rev() {
            if let Err(err) = close() {
                warn!(task = %self.owner, stream = %label, error = %err, "failed to close guarded stream");
            }
        }
    }
}
