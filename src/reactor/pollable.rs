use std::fmt;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::ready::Ready;

/// The uniform contract every endpoint the Reactor drives implements.
/// Generalizes `Common/pollableobject.py::PollableObject` and the teacher's
/// `Evented` trait (`src/evented.rs`) into one trait carrying both the
/// registration shape (a descriptor) and the per-cycle behavior
/// (read/write/update), since in this design a Pollable IS the handler, not
/// just a registration token.
pub trait Pollable: fmt::Display {
    /// The raw descriptor this Pollable polls on.
    fn fd(&self) -> RawFd;

    /// Current I/O interest: ERR is always implied by the reactor itself.
    fn io_mask(&self) -> Ready;

    /// Milliseconds until this Pollable next wants to run regardless of I/O
    /// readiness (a keep-alive, a retry, a TTL). Default: the reactor's
    /// configured timeout.
    fn sleep_time(&self) -> Duration;

    /// Called when the descriptor is readable.
    fn read(&mut self);

    /// Called when the descriptor is writable.
    fn write(&mut self);

    /// Called once per reactor iteration before polling. Default behavior
    /// (left to callers, since Rust has no default-impl-calls-self-override
    /// for `terminate` without a second trait) is: if closing and nothing
    /// left to drain, terminate.
    fn update(&mut self);

    /// Begin graceful shutdown: stop accepting new work, keep draining
    /// output already queued.
    fn init_close(&mut self);

    /// True once this Pollable has nothing left to do and should be
    /// deregistered by the Reactor.
    fn is_terminated(&self) -> bool;

    /// Hard destroy: release the underlying resource. Called by the Reactor
    /// right before deregistering; implementations should be idempotent.
    fn terminate(&mut self);
}
