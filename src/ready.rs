//! Readiness bookkeeping for the event loop.
//!
//! Each socket a session owns carries a [`Readiness`]: the `interest` bits
//! say what the session currently wants to do, the `event` bits accumulate
//! what the kernel reported. The intersection drives the session state
//! machine. Event bits are only cleared when an operation comes back with
//! `WouldBlock`, so a socket is assumed readable/writable until proven
//! otherwise, which is what edge-triggered polling requires.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready(pub u16);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b0001);
    pub const WRITABLE: Ready = Ready(0b0010);
    pub const HUP: Ready = Ready(0b0100);
    pub const ERROR: Ready = Ready(0b1000);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(&self) -> bool {
        self.0 & Ready::READABLE.0 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & Ready::WRITABLE.0 != 0
    }

    pub fn is_hup(&self) -> bool {
        self.0 & Ready::HUP.0 != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & Ready::ERROR.0 != 0
    }

    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut flags = Vec::new();
        if self.is_readable() {
            flags.push("R");
        }
        if self.is_writable() {
            flags.push("W");
        }
        if self.is_hup() {
            flags.push("H");
        }
        if self.is_error() {
            flags.push("E");
        }
        if flags.is_empty() {
            write!(f, "Ready()")
        } else {
            write!(f, "Ready({})", flags.join("|"))
        }
    }
}

impl From<&mio::event::Event> for Ready {
    fn from(event: &mio::event::Event) -> Ready {
        let mut ready = Ready::EMPTY;
        if event.is_readable() {
            ready.insert(Ready::READABLE);
        }
        if event.is_writable() {
            ready.insert(Ready::WRITABLE);
        }
        if event.is_read_closed() || event.is_write_closed() {
            ready.insert(Ready::HUP);
        }
        if event.is_error() {
            ready.insert(Ready::ERROR);
        }
        ready
    }
}

/// What a session wants on a socket versus what the kernel reported for it.
#[derive(Clone, Copy, Debug, Default)]
pub struct Readiness {
    /// the operations the session is interested in performing
    pub interest: Ready,
    /// the accumulated kernel events, cleared on `WouldBlock`
    pub event: Ready,
}

impl Readiness {
    pub fn new() -> Readiness {
        Readiness::default()
    }

    /// The events the session both wants and can act on right now.
    pub fn filter_interest(&self) -> Ready {
        self.event & self.interest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_interest_masks_unwanted_events() {
        let readiness = Readiness {
            interest: Ready::READABLE | Ready::HUP,
            event: Ready::READABLE | Ready::WRITABLE,
        };
        let filtered = readiness.filter_interest();
        assert!(filtered.is_readable());
        assert!(!filtered.is_writable());
        assert!(!filtered.is_hup());
    }

    #[test]
    fn insert_and_remove_are_inverse() {
        let mut ready = Ready::EMPTY;
        ready.insert(Ready::WRITABLE);
        assert!(ready.is_writable());
        ready.remove(Ready::WRITABLE);
        assert!(ready.is_empty());
    }
}
