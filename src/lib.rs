//! A single-threaded cooperative scheduler: run queue, timer heap, and an `io_uring` event loop,
//! plus a bounded select-capable channel built on top.
//!
//! This crate does not implement fibers (stackful or otherwise) itself; see [`fiber::Fiber`]. It
//! owns the bookkeeping that turns a bare resumable computation into something schedulable,
//! timeoutable, and cancellable, and the `io_uring`-backed loop that drives it.

pub mod backend;
pub mod channel;
pub mod event_loop;
pub mod fiber;
pub mod pollable;
pub mod ring_buffer;
pub mod scheduler;
pub mod timer_heap;

/// Errors surfaced from this crate's own OS-facing operations (the completion backend), as
/// opposed to errors a fiber produces on its own.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error<E> {
    #[error(transparent)]
    Original(#[from] E),

    /// The operation was cancelled via `IORING_OP_ASYNC_CANCEL` before it completed.
    #[error("cancelled")]
    Cancelled,
}

impl<E> Error<E> {
    #[inline]
    pub fn map<F: FnOnce(E) -> U, U>(self, f: F) -> Error<U> {
        match self {
            Error::Original(e) => Error::Original(f(e)),
            Error::Cancelled => Error::Cancelled,
        }
    }

    #[inline]
    pub fn and_then<F: FnOnce(E) -> Error<U>, U>(self, f: F) -> Error<U> {
        match self {
            Error::Original(e) => f(e),
            Error::Cancelled => Error::Cancelled,
        }
    }
}

impl Error<std::io::Error> {
    pub fn from_io_error(error: std::io::Error) -> Self {
        match error.raw_os_error() {
            Some(libc::ECANCELED) => Error::Cancelled,
            _ => Error::Original(error),
        }
    }
}

impl From<Error<std::io::Error>> for std::io::Error {
    fn from(error: Error<std::io::Error>) -> Self {
        match error {
            Error::Original(e) => e,
            Error::Cancelled => std::io::Error::from_raw_os_error(libc::ECANCELED),
        }
    }
}

pub type IoResult<T> = Result<T, Error<std::io::Error>>;
