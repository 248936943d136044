//! The two directions a `Registration` can be interested in.
//!
//! Mirrors the shape of `tokio-rs-mio`'s `Interest` (src/interests.rs) but
//! narrowed to readable/writable — this crate has no priority/AIO/LIO
//! readiness classes to track.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

/// A direction a `Registration` can arm interest in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Readable,
    Writable,
}

/// A set of directions, used when registering a fresh descriptor.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(READABLE);
    pub const WRITABLE: Interest = Interest(WRITABLE);

    pub fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub(crate) fn contains(self, direction: Direction) -> bool {
        match direction {
            Direction::Readable => self.is_readable(),
            Direction::Writable => self.is_writable(),
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.is_readable() {
            parts.push("READABLE");
        }
        if self.is_writable() {
            parts.push("WRITABLE");
        }
        write!(f, "Interest({})", parts.join(" | "))
    }
}
