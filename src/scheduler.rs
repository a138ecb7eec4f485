//! Run queue, fiber table, and timer heap: the part of the core that decides *who runs next* but
//! knows nothing about I/O. [`crate::event_loop::EventLoop`] wraps a `Scheduler` together with the
//! listener table and backend to additionally decide *when to block for I/O*.

use slab::Slab;

use crate::fiber::{Fiber, FiberId, FiberState, Signal, Value};
use crate::pollable::ListenerId;
use crate::ring_buffer::RingBuffer;
use crate::timer_heap::{Timeout, TimerHeap};

/// `(fiber, value, signal)`: one entry in the run queue.
struct Task {
    fiber: FiberId,
    value: Value,
    signal: Signal,
}

/// Fiber table, run queue, and timer heap. Thread-local by construction (it owns no
/// synchronization and is meant to live behind one [`crate::event_loop::EventLoop`] per OS
/// thread).
pub struct Scheduler {
    fibers: Slab<FiberState>,
    run_queue: RingBuffer<Task>,
    timer_heap: TimerHeap,
}

impl Scheduler {
    pub fn new(run_queue_capacity: usize) -> Self {
        Scheduler {
            fibers: Slab::new(),
            run_queue: RingBuffer::new(run_queue_capacity),
            timer_heap: TimerHeap::new(),
        }
    }

    /// Registers a fiber and schedules it with `initial_value`. Mirrors the public `call`
    /// function in the scheduling API table.
    pub fn call(&mut self, fiber: Box<dyn Fiber>, initial_value: Value) -> FiberId {
        let id = FiberId(self.fibers.insert(FiberState::new(fiber)));
        self.schedule(id, initial_value);
        id
    }

    /// Drops the bookkeeping for a fiber the host knows has fully completed and won't be resumed
    /// or waited on again. Calling this on a fiber still reachable from the run queue, timer
    /// heap, or a listener is a logic error the host must avoid; this crate doesn't track fiber
    /// completion itself (that's encoded in the value/signal `resume` returns).
    pub fn forget(&mut self, fiber: FiberId) {
        self.fibers.remove(fiber.0);
    }

    pub fn sched_id(&self, fiber: FiberId) -> u64 {
        self.fibers[fiber.0].sched_id
    }

    pub(crate) fn waiting(&self, fiber: FiberId) -> Option<ListenerId> {
        self.fibers[fiber.0].waiting
    }

    pub(crate) fn set_waiting(&mut self, fiber: FiberId, listener: Option<ListenerId>) {
        self.fibers[fiber.0].waiting = listener;
    }

    pub(crate) fn resume(&mut self, fiber: FiberId, value: Value, signal: Signal) -> (Signal, Value) {
        self.fibers[fiber.0].fiber.resume(value, signal)
    }

    /// Idempotent via the `scheduled` flag: if the fiber is already scheduled this is a no-op;
    /// otherwise it bumps `sched_id` (invalidating any in-flight timeout or channel waiter
    /// registered against the old epoch) and enqueues the task.
    pub fn schedule_signal(&mut self, fiber: FiberId, value: Value, signal: Signal) {
        let state = &mut self.fibers[fiber.0];
        if state.scheduled {
            return;
        }

        state.scheduled = true;
        state.sched_id += 1;
        self.run_queue.push(Task {
            fiber,
            value,
            signal,
        });
    }

    /// `schedule_signal(..., Signal::Ok)`.
    pub fn schedule(&mut self, fiber: FiberId, value: Value) {
        self.schedule_signal(fiber, value, Signal::Ok);
    }

    /// `cancel`: `schedule_signal(..., Signal::Error)`.
    pub fn cancel(&mut self, fiber: FiberId, err: Value) {
        self.schedule_signal(fiber, err, Signal::Error);
    }

    /// Registers a timeout targeting `fiber`'s *current* `sched_id`. If the fiber resumes for any
    /// other reason before this fires, the epoch mismatch silently drops it.
    pub fn add_timeout(&mut self, fiber: FiberId, when_ms: i64, is_error: bool) {
        let sched_id = self.sched_id(fiber);
        self.timer_heap.push(Timeout {
            when: when_ms,
            fiber,
            sched_id,
            is_error,
        });
    }

    pub(crate) fn timer_heap(&self) -> &TimerHeap {
        &self.timer_heap
    }

    pub(crate) fn run_queue_is_empty(&self) -> bool {
        self.run_queue.is_empty()
    }

    pub(crate) fn timer_heap_is_empty(&self) -> bool {
        self.timer_heap.is_empty()
    }

    /// Step 1 of `loop1`: pop every expired timeout (`when <= now`), scheduling or cancelling the
    /// target fiber if it's still at the `sched_id` the timeout was registered against, dropping
    /// it silently otherwise.
    pub(crate) fn drain_expired_timers(&mut self, now_ms: i64) {
        while let Some(top) = self.timer_heap.peek() {
            if top.when > now_ms {
                break;
            }

            let timeout = self.timer_heap.pop(0);
            if timeout.sched_id != self.sched_id(timeout.fiber) {
                continue; // stale, the normal cancellation mechanism.
            }

            if timeout.is_error {
                self.cancel(timeout.fiber, Box::new("timeout".to_string()));
            } else {
                self.schedule(timeout.fiber, crate::fiber::nil());
            }
        }
    }

    /// Drops every timer-heap top whose `sched_id` no longer matches its fiber, without regard to
    /// `when`. Called right before blocking so a just-cancelled fiber's stale timeout doesn't keep
    /// the loop alive or get mistaken for the next deadline.
    pub(crate) fn drop_stale_timer_tops(&mut self) {
        while let Some(top) = self.timer_heap.peek() {
            if top.sched_id == self.sched_id(top.fiber) {
                break;
            }
            self.timer_heap.pop(0);
        }
    }

    /// Step 2 of `loop1`: drain the run queue, invoking `callback` for every task after clearing
    /// its `scheduled` flag. `callback` is responsible for the `did_resume` teardown (unlistening
    /// any listener the fiber was blocked on) and for invoking `resume`; both need access to
    /// state this `Scheduler` doesn't own (the listener table), so they're threaded through a
    /// closure rather than being inlined here.
    pub(crate) fn drain_run_queue(&mut self, mut callback: impl FnMut(&mut Scheduler, FiberId, Value, Signal)) {
        loop {
            let Task {
                fiber,
                value,
                signal,
            } = match self.run_queue.pop() {
                Some(task) => task,
                None => break,
            };

            self.fibers[fiber.0].scheduled = false;
            callback(self, fiber, value, signal);
        }
    }

    /// GC mark hook (`ev_mark`): every fiber and value queued to run, plus every fiber sitting in
    /// the timer heap, must be kept alive. Actual marking is the host's garbage collector's job
    /// (out of scope for this crate); this just enumerates the reachable set.
    pub fn mark_reachable_fibers(&self, mut visit: impl FnMut(FiberId, Option<&Value>)) {
        for task in self.run_queue.iter() {
            visit(task.fiber, Some(&task.value));
        }
        for timeout in self.timer_heap.iter() {
            visit(timeout.fiber, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct RecordingFiber {
        log: Rc<RefCell<Vec<String>>>,
        name: &'static str,
    }

    impl Fiber for RecordingFiber {
        fn resume(&mut self, _value: Value, _signal: Signal) -> (Signal, Value) {
            self.log.borrow_mut().push(self.name.to_string());
            (Signal::Ok, crate::fiber::nil())
        }
    }

    #[test]
    fn schedule_is_idempotent_while_already_scheduled() {
        let mut scheduler = Scheduler::new(4);
        let log = Rc::new(RefCell::new(Vec::new()));

        let fiber = scheduler.call(
            Box::new(RecordingFiber {
                log: log.clone(),
                name: "a",
            }),
            crate::fiber::nil(),
        );

        // call() already scheduled it once; scheduling again before it runs must no-op.
        scheduler.schedule(fiber, crate::fiber::nil());

        let mut runs = 0;
        scheduler.drain_run_queue(|_s, _f, _v, _sig| runs += 1);

        assert_eq!(runs, 1);
    }

    #[test]
    fn sched_id_increments_on_each_schedule() {
        let mut scheduler = Scheduler::new(4);
        let log = Rc::new(RefCell::new(Vec::new()));

        let fiber = scheduler.call(
            Box::new(RecordingFiber {
                log: log.clone(),
                name: "a",
            }),
            crate::fiber::nil(),
        );

        let before = scheduler.sched_id(fiber);
        scheduler.drain_run_queue(|_s, _f, _v, _sig| {});
        scheduler.schedule(fiber, crate::fiber::nil());

        assert!(scheduler.sched_id(fiber) > before);
    }

    #[test]
    fn stale_timeout_is_dropped_silently() {
        let mut scheduler = Scheduler::new(4);
        let log = Rc::new(RefCell::new(Vec::new()));

        let fiber = scheduler.call(
            Box::new(RecordingFiber {
                log: log.clone(),
                name: "a",
            }),
            crate::fiber::nil(),
        );
        scheduler.drain_run_queue(|_s, _f, _v, _sig| {});

        // Register a timeout, then resume the fiber for an unrelated reason, bumping sched_id.
        scheduler.add_timeout(fiber, 1_000, false);
        scheduler.schedule(fiber, crate::fiber::nil());
        scheduler.drain_run_queue(|_s, _f, _v, _sig| {});

        let mut scheduled_again = false;
        scheduler.drain_expired_timers(2_000);
        scheduler.drain_run_queue(|_s, _f, _v, _sig| scheduled_again = true);

        assert!(!scheduled_again, "stale timeout must not re-schedule the fiber");
    }

    #[test]
    fn fresh_timeout_schedules_with_nil() {
        let mut scheduler = Scheduler::new(4);
        let log = Rc::new(RefCell::new(Vec::new()));

        let fiber = scheduler.call(
            Box::new(RecordingFiber {
                log: log.clone(),
                name: "a",
            }),
            crate::fiber::nil(),
        );
        scheduler.drain_run_queue(|_s, _f, _v, _sig| {});

        scheduler.add_timeout(fiber, 1_000, false);
        scheduler.drain_expired_timers(1_000);

        let mut ran = false;
        scheduler.drain_run_queue(|_s, _f, _v, sig| {
            ran = true;
            assert_eq!(sig, Signal::Ok);
        });

        assert!(ran);
    }

    #[test]
    fn error_timeout_cancels_with_timeout_value() {
        let mut scheduler = Scheduler::new(4);
        let log = Rc::new(RefCell::new(Vec::new()));

        let fiber = scheduler.call(
            Box::new(RecordingFiber {
                log: log.clone(),
                name: "a",
            }),
            crate::fiber::nil(),
        );
        scheduler.drain_run_queue(|_s, _f, _v, _sig| {});

        scheduler.add_timeout(fiber, 1_000, true);
        scheduler.drain_expired_timers(1_000);

        let mut observed_signal = None;
        let mut observed_value = None;
        scheduler.drain_run_queue(|_s, _f, v, sig| {
            observed_signal = Some(sig);
            observed_value = Some(v.downcast_ref::<String>().cloned());
        });

        assert_eq!(observed_signal, Some(Signal::Error));
        assert_eq!(observed_value, Some(Some("timeout".to_string())));
    }
}
