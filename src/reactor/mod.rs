//! Single-threaded event loop driving every registered [`Pollable`].
//!
//! Grounded on `Common/asyncio.py::Poller` and the teacher's
//! `src/evloop/mod.rs::EventLoop`, generalized to a pluggable `poll`/`select`
//! readiness backend.

pub mod pollable;
pub mod poller;

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use indexmap::IndexMap;
use log::{debug, error, trace};

use crate::config::Config;
use crate::ready::Ready;
pub use pollable::Pollable;
use poller::Poller;

/// Shared handle a `Pollable` can stash away (e.g. at construction, before
/// it is itself registered) so that code running *inside* a dispatched
/// `read()`/`write()`/`update()` call can hand the Reactor a brand-new
/// `Pollable` without reentrantly borrowing the Reactor itself. Grounded in
/// the need for `rudp::Connection`/`data::DataListener` to register a freshly
/// dialed `DataStream` mid-dispatch.
pub type SpawnQueue = Rc<ConcurrentQueue<Box<dyn Pollable>>>;

/// Drives all I/O and timer progress for every registered [`Pollable`],
/// cooperatively, on one thread.
pub struct Reactor {
    pollables: IndexMap<RawFd, Box<dyn Pollable>>,
    poller: Poller,
    default_timeout: Duration,
    closing: bool,
    spawned: SpawnQueue,
}

impl Reactor {
    pub fn new(config: &Config) -> Reactor {
        Reactor {
            pollables: IndexMap::new(),
            poller: Poller::new(config.poller_type),
            default_timeout: config.reactor_timeout,
            closing: false,
            spawned: Rc::new(ConcurrentQueue::unbounded()),
        }
    }

    /// A clonable handle other objects can use to hand the reactor a new
    /// `Pollable` without holding a reference to the `Reactor` itself.
    pub fn spawn_queue(&self) -> SpawnQueue {
        self.spawned.clone()
    }

    /// Add `pollable` keyed by its descriptor. Fails if that descriptor is
    /// already registered.
    pub fn register(&mut self, pollable: Box<dyn Pollable>) -> std::io::Result<()> {
        let fd = pollable.fd();
        if self.pollables.contains_key(&fd) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }
        debug!("{}: registered with reactor", pollable);
        self.pollables.insert(fd, pollable);
        Ok(())
    }

    pub fn deregister(&mut self, fd: RawFd) {
        if let Some(p) = self.pollables.shift_remove(&fd) {
            debug!("{}: deregistered from reactor", p);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pollables.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pollables.len()
    }

    /// Signal every Pollable to begin a graceful shutdown.
    pub fn init_close(&mut self) {
        self.closing = true;
        for p in self.pollables.values_mut() {
            p.init_close();
        }
    }

    /// Force-destroy every Pollable immediately.
    pub fn terminate(&mut self) {
        let fds: Vec<RawFd> = self.pollables.keys().copied().collect();
        for fd in fds {
            if let Some(mut p) = self.pollables.shift_remove(&fd) {
                p.terminate();
            }
        }
    }

    /// Run until no Pollables remain.
    pub fn run(&mut self) {
        while !self.pollables.is_empty() {
            if let Err(err) = self.run_once() {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    self.init_close();
                } else {
                    error!("fatal reactor error, terminating: {}", err);
                    self.terminate();
                    return;
                }
            }
        }
    }

    /// One iteration: update, poll, dispatch, reap. Exposed for tests that
    /// want to step the loop deterministically instead of blocking in
    /// `run()`.
    pub fn run_once(&mut self) -> std::io::Result<()> {
        self.drain_spawned();

        // update() may register/deregister pollables; snapshot the key set
        // first so mutation during iteration can't invalidate the borrow.
        let fds: Vec<RawFd> = self.pollables.keys().copied().collect();
        for fd in fds {
            if let Some(p) = self.pollables.get_mut(&fd) {
                p.update();
                if p.is_terminated() {
                    self.reap(fd);
                }
            }
        }

        let sleep = self.min_sleep_time();
        let interests: Vec<(RawFd, Ready)> = self
            .pollables
            .iter()
            .map(|(fd, p)| (*fd, p.io_mask()))
            .collect();

        trace!(
            "polling {} source(s), waking up in {:?}",
            interests.len(),
            sleep
        );

        let started = Instant::now();
        let ready = self.poller.wait(&interests, sleep)?;
        trace!("woke up after {:?} with {} ready", started.elapsed(), ready.len());

        for (fd, mask) in ready {
            if mask.is_error() {
                if let Some(p) = self.pollables.get(&fd) {
                    error!("{}: error readiness, terminating", p);
                }
                self.reap(fd);
                continue;
            }
            if mask.is_writable() {
                if let Some(p) = self.pollables.get_mut(&fd) {
                    p.write();
                    if p.is_terminated() {
                        self.reap(fd);
                        continue;
                    }
                }
            }
            if mask.is_readable() {
                if let Some(p) = self.pollables.get_mut(&fd) {
                    p.read();
                    if p.is_terminated() {
                        self.reap(fd);
                    }
                }
            }
        }

        Ok(())
    }

    /// Pulls in every `Pollable` handed to [`spawn_queue`](Self::spawn_queue)
    /// since the last iteration.
    fn drain_spawned(&mut self) {
        while let Ok(pollable) = self.spawned.pop() {
            if let Err(err) = self.register(pollable) {
                error!("failed to register spawned pollable: {}", err);
            }
        }
    }

    fn reap(&mut self, fd: RawFd) {
        if let Some(mut p) = self.pollables.shift_remove(&fd) {
            p.terminate();
            debug!("reaped terminated pollable, fd {}", fd);
        }
    }

    fn min_sleep_time(&self) -> Duration {
        self.pollables
            .values()
            .map(|p| p.sleep_time())
            .min()
            .unwrap_or(self.default_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fmt;
    use std::rc::Rc;

    struct Dummy {
        fd: RawFd,
        closing: bool,
        terminated: Rc<Cell<bool>>,
    }

    impl fmt::Display for Dummy {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "Dummy({})", self.fd)
        }
    }

    impl Pollable for Dummy {
        fn fd(&self) -> RawFd {
            self.fd
        }
        fn io_mask(&self) -> Ready {
            Ready::empty()
        }
        fn sleep_time(&self) -> Duration {
            Duration::from_millis(0)
        }
        fn read(&mut self) {}
        fn write(&mut self) {}
        fn update(&mut self) {
            if self.closing {
                self.terminated.set(true);
            }
        }
        fn init_close(&mut self) {
            self.closing = true;
        }
        fn is_terminated(&self) -> bool {
            self.terminated.get()
        }
        fn terminate(&mut self) {
            self.terminated.set(true);
        }
    }

    #[test]
    fn register_rejects_duplicate_fd() {
        let config = Config::default();
        let mut reactor = Reactor::new(&config);
        let terminated = Rc::new(Cell::new(false));
        reactor
            .register(Box::new(Dummy {
                fd: 99,
                closing: false,
                terminated: terminated.clone(),
            }))
            .unwrap();
        let err = reactor
            .register(Box::new(Dummy {
                fd: 99,
                closing: false,
                terminated,
            }))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn init_close_then_update_reaps_within_one_iteration() {
        let config = Config::default();
        let mut reactor = Reactor::new(&config);
        let terminated = Rc::new(Cell::new(false));
        reactor
            .register(Box::new(Dummy {
                fd: 42,
                closing: false,
                terminated: terminated.clone(),
            }))
            .unwrap();

        reactor.init_close();
        // `update()` inside run_once observes `closing` and marks terminated.
        let fds: Vec<RawFd> = reactor.pollables.keys().copied().collect();
        for fd in fds {
            if let Some(p) = reactor.pollables.get_mut(&fd) {
                p.update();
                if p.is_terminated() {
                    reactor.reap(fd);
                }
            }
        }
        assert!(reactor.is_empty());
        assert!(terminated.get());
    }
}
