use std::fmt::{Display, Formatter};

/// PGM sequence number with serial-number (RFC 1982 style) ordering:
/// `a < b  <=>  (a - b) mod 2^32 > 2^31`. Plain `Ord` is deliberately not
/// implemented because serial comparison is not a total order.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Sqn(u32);

impl Display for Sqn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Sqn {
    pub const ZERO: Sqn = Sqn(0);

    pub fn from_raw(value: u32) -> Sqn {
        Sqn(value)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Sqn {
        Sqn(self.0.wrapping_add(1))
    }

    pub fn prev(self) -> Sqn {
        Sqn(self.0.wrapping_sub(1))
    }

    pub fn plus(self, n: u32) -> Sqn {
        Sqn(self.0.wrapping_add(n))
    }

    pub fn minus(self, n: u32) -> Sqn {
        Sqn(self.0.wrapping_sub(n))
    }

    /// serial `self > other`
    pub fn is_after(self, other: Sqn) -> bool {
        let d = self.0.wrapping_sub(other.0);
        d != 0 && d < 0x8000_0000
    }

    /// serial `self >= other`
    pub fn is_after_eq(self, other: Sqn) -> bool {
        self.0.wrapping_sub(other.0) < 0x8000_0000
    }

    /// number of steps from `other` forward to `self`
    pub fn distance_from(self, other: Sqn) -> u32 {
        self.0.wrapping_sub(other.0)
    }

    /// base sequence number of the transmission group this number falls into
    pub fn tg_base(self, tg_sqn_shift: u8) -> Sqn {
        Sqn(self.0 & (u32::MAX << tg_sqn_shift))
    }

    /// index of this number within its transmission group
    pub fn tg_index(self, tg_sqn_shift: u8) -> u32 {
        self.0 & !(u32::MAX << tg_sqn_shift)
    }

    /// iterate `[self, end)` in serial order
    pub fn iter_to(self, end: Sqn) -> SqnIter {
        SqnIter { next: self, end }
    }
}

pub struct SqnIter {
    next: Sqn,
    end: Sqn,
}

impl Iterator for SqnIter {
    type Item = Sqn;

    fn next(&mut self) -> Option<Sqn> {
        if self.next == self.end {
            return None;
        }
        let current = self.next;
        self.next = self.next.next();
        Some(current)
    }
}
