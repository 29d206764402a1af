//! # Weirflow Core
//!
//! The task execution container of the weirflow dataflow worker.
//!
//! A worker node receives deployment requests and hosts one [`task::Task`]
//! per execution attempt of a subtask. The container acquires every resource
//! the user operator needs, runs the operator on a dedicated thread, exposes
//! non-blocking lifecycle control and checkpoint notifications while the
//! operator runs, and releases every resource exactly once regardless of how
//! execution ends.
//!
//! - [`execution_state`] — The lifecycle state machine:
//!   [`ExecutionState`](execution_state::ExecutionState) and the atomic
//!   [`StateCell`](execution_state::StateCell) that linearizes transitions.
//! - [`invokable`] — The user operator contract:
//!   [`Invokable`](invokable::Invokable), the
//!   [`InvokableRegistry`](invokable::InvokableRegistry) it is instantiated
//!   from, and the [`Environment`](invokable::Environment) it runs against.
//! - [`contracts`] / [`network`] — Narrow capability traits consumed from the
//!   surrounding subsystems (worker node, memory pool, library cache, BLOB
//!   store, file cache, shuffle layer).
//! - [`task`] — The container itself: bootstrap, execution, cancellation and
//!   cleanup.

pub mod config;
pub mod contracts;
pub mod error;
pub mod execution_state;
pub mod invokable;
pub mod ledger;
pub mod metrics;
pub mod network;
pub mod safety_net;
pub mod task;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
