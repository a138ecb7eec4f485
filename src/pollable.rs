//! Pollables, listener chains, and the listener machine ABI.
//!
//! A [`Pollable`] wraps a single OS handle that resources (a TCP socket, a file, a signalfd...) own
//! and hand to the event loop. Any number of [`ListenerMachine`]s can be attached to it; the event
//! loop keeps them in a singly-linked chain off the pollable and dispatches lifecycle/I/O events to
//! each.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

use bitflags::bitflags;
use slab::Slab;

use crate::event_loop::DispatchContext;
use crate::fiber::{FiberId, Value};

bitflags! {
    /// Event-interest bits a listener registers with [`Mask`].
    pub struct Mask: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        /// Implies no owning fiber; always OR'd in by `listen` for listeners that service a
        /// passively-listening resource (e.g. a listening socket accepting connections).
        const SPAWNER = 0b100;
    }
}

bitflags! {
    struct PollableFlags: u8 {
        const CLOSED = 0b01;
        /// Backend-private: set once the handle has been associated with the OS completion
        /// mechanism, so a second listener on the same pollable doesn't re-register it.
        const REGISTERED = 0b10;
    }
}

struct PollableInner {
    handle: RawFd,
    flags: PollableFlags,
    head: Option<ListenerId>,
    mask: Mask,
}

/// A reference-counted handle to an OS file descriptor plus its listener chain and combined event
/// mask. Cloning a `Pollable` shares the same underlying handle bookkeeping; clone it to hand a
/// reference to the event loop while the owning resource (e.g. a socket wrapper) keeps its own.
#[derive(Clone)]
pub struct Pollable(Rc<RefCell<PollableInner>>);

impl Pollable {
    pub fn new(handle: RawFd) -> Self {
        Pollable(Rc::new(RefCell::new(PollableInner {
            handle,
            flags: PollableFlags::empty(),
            head: None,
            mask: Mask::empty(),
        })))
    }

    pub fn handle(&self) -> RawFd {
        self.0.borrow().handle
    }

    pub fn mask(&self) -> Mask {
        self.0.borrow().mask
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().flags.contains(PollableFlags::CLOSED)
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.0.borrow().flags.contains(PollableFlags::REGISTERED)
    }

    pub(crate) fn mark_registered(&self) {
        self.0.borrow_mut().flags.insert(PollableFlags::REGISTERED);
    }

    pub(crate) fn mark_closed(&self) {
        self.0.borrow_mut().flags.insert(PollableFlags::CLOSED);
    }

    fn head(&self) -> Option<ListenerId> {
        self.0.borrow().head
    }

    fn set_head(&self, head: Option<ListenerId>) {
        self.0.borrow_mut().head = head;
    }

    fn insert_mask(&self, mask: Mask) {
        self.0.borrow_mut().mask.insert(mask);
    }

    fn remove_mask(&self, mask: Mask) {
        self.0.borrow_mut().mask.remove(mask);
    }
}

/// Lifecycle and I/O events dispatched to a [`ListenerMachine`].
#[derive(Debug)]
pub enum Event {
    /// Dispatched synchronously inside `listen`, carrying the user payload passed in.
    Init { user: Value },
    /// Dispatched synchronously inside `unlisten`.
    Deinit,
    /// Dispatched when the owning pollable is being torn down.
    Close,
    /// Completion-backend dispatch; `bytes` is the raw completion result (negative on error, as
    /// an `io_uring` CQE result would be). Decode it with
    /// [`crate::backend::completion_result`] rather than inspecting the sign directly.
    Complete { bytes: i32 },
}

/// Whether a listener wants to keep running after handling an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    /// Unlisten this listener: its operation is finished.
    Done,
    NotDone,
}

/// A state machine for one I/O operation, attached to a [`Pollable`] via
/// [`crate::event_loop::EventLoop::listen`].
pub trait ListenerMachine {
    fn dispatch(&mut self, ctx: &mut DispatchContext<'_>, event: Event) -> MachineStatus;
}

/// Stable handle to a listener registered with an [`crate::event_loop::EventLoop`].
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ListenerId(pub(crate) usize);

impl std::fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ListenerId({})", self.0)
    }
}

pub(crate) struct ListenerState {
    pub(crate) machine: Box<dyn ListenerMachine>,
    pub(crate) fiber: Option<FiberId>,
    pub(crate) pollable: Pollable,
    pub(crate) mask: Mask,
    next: Option<ListenerId>,
}

/// Owns every live [`ListenerState`] across all pollables, plus the `active_listeners` count used
/// to decide whether the event loop still has I/O to wait on.
pub(crate) struct Listeners {
    slab: Slab<ListenerState>,
}

impl Listeners {
    pub(crate) fn new() -> Self {
        Listeners { slab: Slab::new() }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.slab.len()
    }

    pub(crate) fn is_live(&self, id: ListenerId) -> bool {
        self.slab.contains(id.0)
    }

    /// Allocates a listener, links it into `pollable`'s chain, and ORs `mask` into the pollable's
    /// combined mask. Does not dispatch `Init`; the caller does that once the listener (and, if
    /// owned, the fiber's `waiting` pointer) is fully linked.
    ///
    /// Panics if `mask` overlaps a bit already set by another listener on the same pollable: a
    /// duplicate registration is a contract violation (see the crate's error handling docs).
    pub(crate) fn insert(
        &mut self,
        pollable: Pollable,
        fiber: Option<FiberId>,
        mask: Mask,
        machine: Box<dyn ListenerMachine>,
    ) -> ListenerId {
        assert!(
            !pollable.mask().intersects(mask),
            "duplicate listener mask bits on the same pollable"
        );

        let next = pollable.head();
        let id = ListenerId(self.slab.insert(ListenerState {
            machine,
            fiber,
            pollable: pollable.clone(),
            mask,
            next,
        }));

        pollable.set_head(Some(id));
        pollable.insert_mask(mask);

        id
    }

    pub(crate) fn machine_mut(&mut self, id: ListenerId) -> &mut Box<dyn ListenerMachine> {
        &mut self.slab[id.0].machine
    }

    pub(crate) fn fiber_of(&self, id: ListenerId) -> Option<FiberId> {
        self.slab.get(id.0).and_then(|l| l.fiber)
    }

    pub(crate) fn pollable_of(&self, id: ListenerId) -> Pollable {
        self.slab[id.0].pollable.clone()
    }

    /// Unlinks the listener from its pollable's chain, clears its mask bits, and frees its slot.
    /// Returns the fiber that owned it, if any, so the caller can clear that fiber's `waiting`
    /// pointer (this crate's [`crate::event_loop::EventLoop`] does this as part of `unlisten`).
    pub(crate) fn remove(&mut self, id: ListenerId) -> Option<FiberId> {
        let ListenerState {
            fiber,
            pollable,
            mask,
            next,
            ..
        } = self.slab.remove(id.0);

        // Unlink from the singly-linked chain.
        if pollable.head() == Some(id) {
            pollable.set_head(next);
        } else {
            let mut cursor = pollable.head();
            while let Some(current) = cursor {
                let current_next = self.slab[current.0].next;
                if current_next == Some(id) {
                    self.slab[current.0].next = next;
                    break;
                }
                cursor = current_next;
            }
        }

        pollable.remove_mask(mask);

        fiber
    }

    /// All listeners currently chained on `pollable`, head first.
    pub(crate) fn chain(&self, pollable: &Pollable) -> Vec<ListenerId> {
        let mut ids = Vec::new();
        let mut cursor = pollable.head();
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.slab[id.0].next;
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopMachine;
    impl ListenerMachine for NoopMachine {
        fn dispatch(&mut self, _ctx: &mut DispatchContext<'_>, _event: Event) -> MachineStatus {
            MachineStatus::NotDone
        }
    }

    #[test]
    fn mask_accumulates_across_listeners() {
        let mut listeners = Listeners::new();
        let pollable = Pollable::new(3);

        listeners.insert(pollable.clone(), None, Mask::READ, Box::new(NoopMachine));
        listeners.insert(pollable.clone(), None, Mask::WRITE, Box::new(NoopMachine));

        assert_eq!(pollable.mask(), Mask::READ | Mask::WRITE);
    }

    #[test]
    #[should_panic]
    fn duplicate_mask_bits_panics() {
        let mut listeners = Listeners::new();
        let pollable = Pollable::new(3);

        listeners.insert(pollable.clone(), None, Mask::READ, Box::new(NoopMachine));
        listeners.insert(pollable.clone(), None, Mask::READ, Box::new(NoopMachine));
    }

    #[test]
    fn remove_clears_mask_bit_and_unlinks() {
        let mut listeners = Listeners::new();
        let pollable = Pollable::new(3);

        let read = listeners.insert(pollable.clone(), None, Mask::READ, Box::new(NoopMachine));
        listeners.insert(pollable.clone(), None, Mask::WRITE, Box::new(NoopMachine));

        listeners.remove(read);

        assert_eq!(pollable.mask(), Mask::WRITE);
        assert_eq!(listeners.chain(&pollable).len(), 1);
    }

    #[test]
    fn active_count_tracks_inserts_and_removes() {
        let mut listeners = Listeners::new();
        let pollable = Pollable::new(3);

        let a = listeners.insert(pollable.clone(), None, Mask::READ, Box::new(NoopMachine));
        assert_eq!(listeners.active_count(), 1);

        listeners.remove(a);
        assert_eq!(listeners.active_count(), 0);
    }
}
