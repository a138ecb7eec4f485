//! Bounded, select-capable channel.
//!
//! A [`Channel`] doesn't suspend by returning a pending future; it mutates a
//! [`crate::scheduler::Scheduler`] directly and relies on the normal resume path to deliver
//! results. A fiber that blocks on `give`/`take`/`select` is expected to yield `(Signal::Event,
//! Value::nil())` immediately afterwards; whichever counterparty unblocks it does so by scheduling
//! it with the delivered value, so it re-enters through `Fiber::resume` like any other wake-up.

use std::cell::RefCell;
use std::rc::Rc;

use rand::seq::SliceRandom;

use crate::fiber::{FiberId, Value};
use crate::ring_buffer::RingBuffer;
use crate::scheduler::Scheduler;

const INITIAL_QUEUE_CAPACITY: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq)]
enum WaiterMode {
    /// Registered by a plain `give`/`take`.
    Item,
    ChoiceRead,
    ChoiceWrite,
}

struct Waiter {
    fiber: FiberId,
    /// The fiber's `sched_id` at registration time; a mismatch on dequeue means the fiber moved
    /// on for an unrelated reason and this waiter is stale.
    sched_id: u64,
    mode: WaiterMode,
}

struct Inner {
    items: RingBuffer<Value>,
    limit: i32,
    read_pending: RingBuffer<Waiter>,
    write_pending: RingBuffer<Waiter>,
}

/// A bounded channel of opaque [`Value`]s. Cheap to clone: clones share the same underlying
/// queue, mirroring [`crate::pollable::Pollable`].
#[derive(Clone)]
pub struct Channel(Rc<RefCell<Inner>>);

impl Channel {
    /// `limit` is the number of items that may sit in the channel before a giver blocks. `0`
    /// makes every handoff a rendezvous: a giver only proceeds once a taker is already waiting.
    ///
    /// The `items` ring buffer starts pre-sized to `limit` (a zero-slot ring buffer isn't
    /// representable, so `0` still gets one backing slot) purely to avoid an early grow on the
    /// common case; `capacity()` itself reports `limit`, not the ring buffer's rounded slot count.
    pub fn new(limit: i32) -> Self {
        Channel(Rc::new(RefCell::new(Inner {
            items: RingBuffer::new(limit.max(0) as usize),
            limit,
            read_pending: RingBuffer::new(INITIAL_QUEUE_CAPACITY),
            write_pending: RingBuffer::new(INITIAL_QUEUE_CAPACITY),
        })))
    }

    pub fn limit(&self) -> i32 {
        self.0.borrow().limit
    }

    pub fn len(&self) -> usize {
        self.0.borrow().items.len()
    }

    pub fn capacity(&self) -> i32 {
        self.0.borrow().limit
    }

    pub fn is_full(&self) -> bool {
        self.len() as i32 >= self.limit()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends `value`. If delivery can't complete synchronously, `fiber` is left registered as a
    /// waiter and must yield `Signal::Event` right after this call returns.
    pub fn give(&self, scheduler: &mut Scheduler, fiber: FiberId, value: Value) {
        give(self, scheduler, fiber, value)
    }

    /// Receives a value, delivered through `scheduler.schedule` rather than returned here so a
    /// blocked and an immediate receive go through the same resume path.
    pub fn take(&self, scheduler: &mut Scheduler, fiber: FiberId) {
        take(self, scheduler, fiber)
    }

    /// GC mark hook: every fiber parked in `read_pending`/`write_pending` must stay alive, and so
    /// must every value currently sitting in `items`, not yet delivered to anyone.
    pub fn mark(&self, mut visit_fiber: impl FnMut(FiberId), mut visit_value: impl FnMut(&Value)) {
        let inner = self.0.borrow();
        for waiter in inner.read_pending.iter() {
            visit_fiber(waiter.fiber);
        }
        for waiter in inner.write_pending.iter() {
            visit_fiber(waiter.fiber);
        }
        for value in inner.items.iter() {
            visit_value(value);
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Channel::new(0)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    Block,
}

pub enum PopOutcome {
    Delivered(Value),
    Block,
}

/// What a fiber that registered as a `Choice*` waiter (via [`select`]/[`rselect`]) gets resumed
/// with once one of its clauses fires.
pub enum SelectResult {
    Give(Channel),
    Take(Channel, Value),
}

/// One arm of a [`select`]/[`rselect`] call.
pub enum SelectClause {
    Take(Channel),
    Give(Channel, Value),
}

/// The send half of the channel protocol. Dequeues a live reader first (FIFO, skipping stale
/// entries); if none, enqueues the value and blocks the giver if that pushed the channel over its
/// limit.
fn push(channel: &Channel, scheduler: &mut Scheduler, fiber: FiberId, value: Value, is_choice: bool) -> PushOutcome {
    let reader = loop {
        let candidate = channel.0.borrow_mut().read_pending.pop();
        match candidate {
            None => break None,
            Some(waiter) if waiter.sched_id == scheduler.sched_id(waiter.fiber) => break Some(waiter),
            Some(_stale) => continue,
        }
    };

    if let Some(waiter) = reader {
        match waiter.mode {
            WaiterMode::Item => scheduler.schedule(waiter.fiber, value),
            WaiterMode::ChoiceRead => {
                scheduler.schedule(waiter.fiber, Box::new(SelectResult::Take(channel.clone(), value)))
            }
            WaiterMode::ChoiceWrite => unreachable!("read_pending only ever holds reader waiters"),
        }
        return PushOutcome::Delivered;
    }

    let mut inner = channel.0.borrow_mut();
    inner.items.push(value);
    let over_limit = inner.items.len() as i32 > inner.limit;
    if over_limit {
        let mode = if is_choice { WaiterMode::ChoiceWrite } else { WaiterMode::Item };
        let sched_id = scheduler.sched_id(fiber);
        inner.write_pending.push(Waiter { fiber, sched_id, mode });
        return PushOutcome::Block;
    }

    PushOutcome::Delivered
}

/// The receive half. Pops an item if one is queued (registering as a waiter and blocking
/// otherwise); on success, also wakes one live writer so it can proceed past its limit check.
fn pop(channel: &Channel, scheduler: &mut Scheduler, fiber: FiberId, is_choice: bool) -> PopOutcome {
    let popped = channel.0.borrow_mut().items.pop();

    let value = match popped {
        Some(value) => value,
        None => {
            let mode = if is_choice { WaiterMode::ChoiceRead } else { WaiterMode::Item };
            let sched_id = scheduler.sched_id(fiber);
            channel.0.borrow_mut().read_pending.push(Waiter { fiber, sched_id, mode });
            return PopOutcome::Block;
        }
    };

    let writer = loop {
        let candidate = channel.0.borrow_mut().write_pending.pop();
        match candidate {
            None => break None,
            Some(waiter) if waiter.sched_id == scheduler.sched_id(waiter.fiber) => break Some(waiter),
            Some(_stale) => continue,
        }
    };

    if let Some(waiter) = writer {
        match waiter.mode {
            WaiterMode::Item => scheduler.schedule(waiter.fiber, Box::new(channel.clone())),
            WaiterMode::ChoiceWrite => {
                scheduler.schedule(waiter.fiber, Box::new(SelectResult::Give(channel.clone())))
            }
            WaiterMode::ChoiceRead => unreachable!("write_pending only ever holds writer waiters"),
        }
    }

    PopOutcome::Delivered(value)
}

/// Sends `value` on `channel`. If delivery can't complete synchronously, `fiber` is left
/// registered as a waiter and must yield `Signal::Event` right after this call returns.
pub fn give(channel: &Channel, scheduler: &mut Scheduler, fiber: FiberId, value: Value) {
    if let PushOutcome::Delivered = push(channel, scheduler, fiber, value, false) {
        scheduler.schedule(fiber, crate::fiber::nil());
    }
}

/// Receives from `channel`. A successful receive is still delivered through `scheduler.schedule`
/// (not returned here) so it goes through the same resume path as a blocked take.
pub fn take(channel: &Channel, scheduler: &mut Scheduler, fiber: FiberId) {
    if let PopOutcome::Delivered(value) = pop(channel, scheduler, fiber, false) {
        scheduler.schedule(fiber, value);
    }
}

/// Tries every clause in order for one that can fire without blocking; if none can, registers
/// `fiber` as a `Choice*` waiter on all of them and lets the first to fire win.
pub fn select(scheduler: &mut Scheduler, fiber: FiberId, mut clauses: Vec<SelectClause>) {
    let ready = clauses.iter().position(|clause| match clause {
        SelectClause::Take(channel) => !channel.is_empty(),
        SelectClause::Give(channel, _) => !channel.is_full(),
    });

    if let Some(index) = ready {
        match clauses.swap_remove(index) {
            SelectClause::Take(channel) => {
                if let PopOutcome::Delivered(value) = pop(&channel, scheduler, fiber, true) {
                    scheduler.schedule(fiber, Box::new(SelectResult::Take(channel, value)));
                }
            }
            SelectClause::Give(channel, value) => {
                if let PushOutcome::Delivered = push(&channel, scheduler, fiber, value, true) {
                    scheduler.schedule(fiber, Box::new(SelectResult::Give(channel)));
                }
            }
        }
        return;
    }

    for clause in clauses {
        match clause {
            SelectClause::Take(channel) => {
                pop(&channel, scheduler, fiber, true);
            }
            SelectClause::Give(channel, value) => {
                push(&channel, scheduler, fiber, value, true);
            }
        }
    }
}

/// `select`, but the clause order is shuffled first so that repeated calls on the same clause set
/// don't always favor earlier clauses.
pub fn rselect(scheduler: &mut Scheduler, fiber: FiberId, mut clauses: Vec<SelectClause>) {
    clauses.shuffle(&mut rand::thread_rng());
    select(scheduler, fiber, clauses);
}
