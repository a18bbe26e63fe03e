use std::{fmt, ops};

/// A set of I/O readiness bits: readable, writable, errored.
///
/// Every `io_mask()` and every readiness event is expressed in terms of this
/// type instead of a raw `libc::POLLIN`/`POLLOUT`/`POLLERR` triple.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Default)]
pub struct Ready(u8);

const READABLE: u8 = 0b001;
const WRITABLE: u8 = 0b010;
const ERROR: u8 = 0b100;

impl Ready {
    #[inline]
    pub fn empty() -> Ready {
        Ready(0)
    }

    #[inline]
    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    #[inline]
    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(Ready::readable())
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(Ready::writable())
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.contains(Ready::error())
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self == Ready::empty()
    }

    #[inline]
    pub fn contains(self, other: Ready) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    /// `self` with the readable bit withdrawn; used to compose backpressure
    /// from a source outside the underlying socket (e.g. a blocked
    /// handshake) with the socket's own interest.
    #[inline]
    pub fn intersection_without_readable(self) -> Ready {
        let mut r = self;
        r.remove(Ready::readable());
        r
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        for (val, name) in [
            (READABLE, "READABLE"),
            (WRITABLE, "WRITABLE"),
            (ERROR, "ERROR"),
        ] {
            if self.0 & val != 0 {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        if !one {
            write!(fmt, "(empty)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Ready;

    #[test]
    fn combines_and_queries() {
        let r = Ready::readable() | Ready::writable();
        assert!(r.is_readable());
        assert!(r.is_writable());
        assert!(!r.is_error());
        assert!(!r.is_empty());
    }

    #[test]
    fn empty_is_empty() {
        assert!(Ready::empty().is_empty());
    }
}
