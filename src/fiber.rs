//! The fiber contract the scheduler drives.
//!
//! The concrete coroutine/stack-switching implementation is a foreign collaborator: this crate
//! only consumes it through the [`Fiber`] trait. A host embedding this crate (e.g. a language
//! interpreter) implements [`Fiber`] over whatever stackful or stackless mechanism it already has;
//! this crate supplies the bookkeeping (`sched_id`, the scheduled flag, the `waiting` pointer) that
//! turns a bare resumable computation into something that can be scheduled, timed out, and
//! cancelled.

use std::any::Any;
use std::fmt;

use crate::pollable::ListenerId;

/// An opaque value exchanged between the scheduler and a fiber.
///
/// The host's value system is out of scope for this crate (see the crate-level docs); `Value` is
/// an owned, type-erased box so the scheduler never needs to know what's inside.
pub type Value = Box<dyn Any>;

/// Convenience for constructing a nil-ish `Value` when no payload is needed.
pub fn nil() -> Value {
    Box::new(())
}

/// The three ways a [`Fiber::resume`] call (or a fiber's own suspension) can end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Normal resumption, or a fiber ran to completion without error.
    Ok,
    /// The fiber suspended itself again (typically via `await` after registering a listener or
    /// timeout).
    Event,
    /// The fiber is being resumed with an error (e.g. a timeout or an explicit `cancel`), or it
    /// terminated carrying one.
    Error,
}

/// A resumable computation driven by the scheduler.
///
/// `resume` is called with the outcome the fiber was suspended on: a plain value and
/// [`Signal::Ok`] for a normal wake-up, or a value and [`Signal::Error`] for a cancellation. It
/// returns the fiber's new status: [`Signal::Event`] if the fiber suspended itself again (after
/// registering exactly one timeout, listener, or channel waiter; see the crate docs on
/// suspension points), or [`Signal::Ok`]/[`Signal::Error`] if it ran to completion.
pub trait Fiber {
    fn resume(&mut self, value: Value, signal: Signal) -> (Signal, Value);
}

/// Stable handle to a fiber registered with a [`crate::scheduler::Scheduler`].
///
/// Thin wrapper around a [`slab`] key.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(pub(crate) usize);

impl FiberId {
    /// Test-only / advanced-use constructor for building a `FiberId` without going through a
    /// [`crate::scheduler::Scheduler`] (e.g. to build fixture `Timeout`s in unit tests).
    pub fn from_raw(id: usize) -> Self {
        FiberId(id)
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self.0)
    }
}

/// Per-fiber bookkeeping the scheduler maintains alongside the host's [`Fiber`].
pub(crate) struct FiberState {
    pub(crate) fiber: Box<dyn Fiber>,
    pub(crate) sched_id: u64,
    pub(crate) scheduled: bool,
    pub(crate) waiting: Option<ListenerId>,
}

impl FiberState {
    pub(crate) fn new(fiber: Box<dyn Fiber>) -> Self {
        FiberState {
            fiber,
            sched_id: 0,
            scheduled: false,
            waiting: None,
        }
    }
}
