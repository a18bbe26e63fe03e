use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::config::PollerType;
use crate::ready::Ready;

/// Portable readiness wait, with two interchangeable backends sharing one
/// contract, the same way the teacher wraps a single syscall family per
/// backend (`src/poll/mod.rs` for `poll(2)`, `src/sys/epoll.rs` for `epoll`)
/// instead of hiding everything behind a trait object with dynamic dispatch
/// per syscall.
pub enum Poller {
    Poll,
    Select,
}

impl Poller {
    pub fn new(kind: PollerType) -> Poller {
        match kind {
            PollerType::Poll => Poller::Poll,
            PollerType::Select => Poller::Select,
        }
    }

    /// Wait up to `timeout` for any of `interests` to become ready. Returns
    /// the subset that are ready, each paired with the bits that fired.
    pub fn wait(
        &self,
        interests: &[(RawFd, Ready)],
        timeout: Duration,
    ) -> io::Result<Vec<(RawFd, Ready)>> {
        match self {
            Poller::Poll => poll_wait(interests, timeout),
            Poller::Select => select_wait(interests, timeout),
        }
    }
}

fn millis_clamped(timeout: Duration) -> libc::c_int {
    timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
}

fn poll_wait(interests: &[(RawFd, Ready)], timeout: Duration) -> io::Result<Vec<(RawFd, Ready)>> {
    let mut fds: Vec<libc::pollfd> = interests
        .iter()
        .map(|(fd, interest)| {
            let mut events = 0;
            if interest.is_readable() {
                events |= libc::POLLIN;
            }
            if interest.is_writable() {
                events |= libc::POLLOUT;
            }
            libc::pollfd {
                fd: *fd,
                events,
                revents: 0,
            }
        })
        .collect();

    let ret = unsafe {
        libc::poll(
            fds.as_mut_ptr(),
            fds.len() as libc::nfds_t,
            millis_clamped(timeout),
        )
    };

    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(err);
    }

    let mut ready = Vec::with_capacity(ret.max(0) as usize);
    for pfd in &fds {
        if pfd.revents == 0 {
            continue;
        }
        let mut r = Ready::empty();
        if pfd.revents & libc::POLLIN != 0 {
            r.insert(Ready::readable());
        }
        if pfd.revents & libc::POLLOUT != 0 {
            r.insert(Ready::writable());
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            r.insert(Ready::error());
        }
        if !r.is_empty() {
            ready.push((pfd.fd, r));
        }
    }
    Ok(ready)
}

fn select_wait(interests: &[(RawFd, Ready)], timeout: Duration) -> io::Result<Vec<(RawFd, Ready)>> {
    unsafe {
        let mut read_set: libc::fd_set = std::mem::zeroed();
        let mut write_set: libc::fd_set = std::mem::zeroed();
        let mut err_set: libc::fd_set = std::mem::zeroed();
        libc::FD_ZERO(&mut read_set);
        libc::FD_ZERO(&mut write_set);
        libc::FD_ZERO(&mut err_set);

        let mut max_fd: RawFd = -1;
        for (fd, interest) in interests {
            if interest.is_readable() {
                libc::FD_SET(*fd, &mut read_set);
            }
            if interest.is_writable() {
                libc::FD_SET(*fd, &mut write_set);
            }
            libc::FD_SET(*fd, &mut err_set);
            max_fd = max_fd.max(*fd);
        }

        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let ret = libc::select(
            max_fd + 1,
            &mut read_set,
            &mut write_set,
            &mut err_set,
            &mut tv,
        );

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut ready = Vec::new();
        for (fd, _) in interests {
            let mut r = Ready::empty();
            if libc::FD_ISSET(*fd, &read_set) {
                r.insert(Ready::readable());
            }
            if libc::FD_ISSET(*fd, &write_set) {
                r.insert(Ready::writable());
            }
            if libc::FD_ISSET(*fd, &err_set) {
                r.insert(Ready::error());
            }
            if !r.is_empty() {
                ready.push((*fd, r));
            }
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn poll_reports_writable_pipe() {
        let (_r, w) = nix_pipe();
        let interests = [(w.as_raw_fd(), Ready::writable())];
        let ready = Poller::Poll.wait(&interests, Duration::from_millis(100)).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].1.is_writable());
    }

    #[test]
    fn select_reports_writable_pipe() {
        let (_r, w) = nix_pipe();
        let interests = [(w.as_raw_fd(), Ready::writable())];
        let ready = Poller::Select.wait(&interests, Duration::from_millis(100)).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].1.is_writable());
    }

    // A tiny local pipe() wrapper so these tests don't need to depend on
    // `nix` just to exercise the two backends against a real descriptor.
    fn nix_pipe() -> (std::fs::File, std::fs::File) {
        use std::os::unix::io::FromRawFd;
        let mut fds = [0 as libc::c_int; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        unsafe {
            (
                std::fs::File::from_raw_fd(fds[0]),
                std::fs::File::from_raw_fd(fds[1]),
            )
        }
    }
}
