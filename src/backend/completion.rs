//! Completion-port backend: `io_uring` on Linux.
//!
//! A thin wrapper issuing tagged SQEs and draining tagged CQEs: completions are matched to a
//! [`ListenerId`] rather than a raw fiber index, since dispatch goes through a listener's state
//! machine rather than directly resuming a fiber.

#[cfg(not(target_os = "linux"))]
compile_error!("fiberloop only supports Linux");

use std::io;

use crate::pollable::ListenerId;

/// Sentinel `user_data` tag for the loop's own wakeup timer, distinguished from real listener
/// completions (whose tags are always valid slab indices and, in practice, never collide with
/// `u64::MAX`).
const WAKEUP_TAG: u64 = u64::MAX;

pub struct CompletionBackend {
    io_uring: io_uring::IoUring,
}

impl CompletionBackend {
    pub fn new(entries: u32) -> io::Result<Self> {
        let mut builder = io_uring::IoUring::builder();
        builder.setup_clamp(); // don't panic if IORING_MAX_ENTRIES is smaller than requested
        let io_uring = builder.build(entries)?;
        Ok(CompletionBackend { io_uring })
    }

    /// Issues `sqe` tagged with `listener`'s id as `user_data`, so a later completion can be
    /// routed back to the listener that issued it. Listener machines call this (via
    /// [`crate::event_loop::DispatchContext::submit`]) from `Init` or `Complete` to arm or re-arm
    /// their operation.
    pub(crate) fn submit(&mut self, listener: ListenerId, sqe: io_uring::squeue::Entry) {
        let sqe = sqe.user_data(listener.0 as u64);

        // Safety: no other submission-queue handle is held across this call.
        let mut sq = unsafe { self.io_uring.submission_shared() };
        while sq.is_full() {
            drop(sq);
            self.io_uring.submit().expect("io_uring_enter failed submitting a full queue");
            sq = unsafe { self.io_uring.submission_shared() };
        }
        unsafe { sq.push(&sqe) }.expect("submission queue isn't full");
    }

    /// Requests cancellation of whatever operation was last tagged with `listener`'s id.
    /// Completion is still observed asynchronously; the caller must tolerate a `Complete` event
    /// arriving for an operation it no longer cares about (see the crate docs on `sched_id`-based
    /// staleness).
    pub(crate) fn request_cancel(&mut self, listener: ListenerId) {
        let sqe = io_uring::opcode::AsyncCancel::new(listener.0 as u64).build();
        self.submit_cancel(sqe);
    }

    fn submit_cancel(&mut self, sqe: io_uring::squeue::Entry) {
        let sqe = sqe.user_data(WAKEUP_TAG);
        let mut sq = unsafe { self.io_uring.submission_shared() };
        if sq.is_full() {
            drop(sq);
            self.io_uring.submit().expect("io_uring_enter failed submitting a full queue");
            sq = unsafe { self.io_uring.submission_shared() };
        }
        unsafe { sq.push(&sqe) }.expect("submission queue isn't full");
    }

    /// Blocks until at least one completion arrives or `deadline_ms` passes (an absolute
    /// millisecond timestamp on the event loop's monotonic clock; `None` blocks indefinitely).
    /// Restarts transparently on `EINTR`. Returns the raw `(listener, result)` pairs for the event
    /// loop to dispatch; this backend doesn't know about listener machines, only tags.
    pub(crate) fn wait_once(
        &mut self,
        now_ms: i64,
        deadline_ms: Option<i64>,
    ) -> io::Result<Vec<(ListenerId, i32)>> {
        if let Some(deadline_ms) = deadline_ms {
            let remaining_ms = (deadline_ms - now_ms).max(0) as u64;
            let timespec = io_uring::types::Timespec::new()
                .sec(remaining_ms / 1000)
                .nsec((remaining_ms % 1000) as u32 * 1_000_000);
            let sqe = io_uring::opcode::Timeout::new(&timespec).build();
            self.submit_cancel(sqe); // tagged WAKEUP_TAG, filtered out below
        }

        loop {
            match self.io_uring.submit_and_wait(1) {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut completions = Vec::new();
        // Safety: no other completion-queue handle is held across this call.
        for cqe in unsafe { self.io_uring.completion_shared() } {
            if cqe.user_data() == WAKEUP_TAG {
                continue; // our own timeout/cancel sentinel, or a spurious wake
            }
            completions.push((ListenerId(cqe.user_data() as usize), cqe.result()));
        }

        Ok(completions)
    }
}

/// Decodes a raw completion result (`Event::Complete`'s `bytes`, or any other `io_uring` CQE
/// `result()`) into a [`crate::IoResult`]. A negative result is an errno, translated through
/// [`crate::Error::from_io_error`] so a cancelled operation (`-ECANCELED`, the result of
/// [`CompletionBackend::request_cancel`] succeeding) surfaces as [`crate::Error::Cancelled`]
/// rather than a generic I/O error. Listener machines call this from their `Event::Complete`
/// handling instead of inspecting the sign of `bytes` themselves.
pub fn completion_result(bytes: i32) -> crate::IoResult<u32> {
    if bytes < 0 {
        Err(crate::Error::from_io_error(io::Error::from_raw_os_error(-bytes)))
    } else {
        Ok(bytes as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_result_passes_through_a_nonnegative_byte_count() {
        assert_eq!(completion_result(42).unwrap(), 42);
    }

    #[test]
    fn completion_result_maps_ecanceled_to_the_cancelled_variant() {
        let error = completion_result(-libc::ECANCELED).unwrap_err();
        assert!(matches!(error, crate::Error::Cancelled));
    }

    #[test]
    fn completion_result_maps_other_negative_results_to_the_original_io_error() {
        let error = completion_result(-libc::EBADF).unwrap_err();
        assert!(matches!(error, crate::Error::Original(e) if e.raw_os_error() == Some(libc::EBADF)));
    }
}
