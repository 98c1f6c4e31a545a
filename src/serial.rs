//! Serial number arithmetic for 32-bit sequence numbers (RFC 1982, SERIAL_BITS = 32)
//!
//! CmdSN, StatSN, DataSN and R2TSN wrap at 2^32, so "less than" is decided
//! by the sign of the wrapping difference, not by numeric order.

use std::cmp::Ordering;
use std::fmt;

/// A 32-bit sequence number with wraparound ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SerialArithmeticNumber(u32);

impl SerialArithmeticNumber {
    pub fn new(value: u32) -> Self {
        SerialArithmeticNumber(value)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Advance by one, wrapping from `u32::MAX` to 0
    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// The number `n` steps ahead
    pub fn offset(self, n: u32) -> Self {
        SerialArithmeticNumber(self.0.wrapping_add(n))
    }

    /// Signed distance from `other` to `self`
    pub fn distance(self, other: impl Into<SerialArithmeticNumber>) -> i32 {
        self.0.wrapping_sub(other.into().0) as i32
    }

    pub fn compare_to(self, other: impl Into<SerialArithmeticNumber>) -> Ordering {
        self.distance(other).cmp(&0)
    }

    pub fn less_than(self, other: impl Into<SerialArithmeticNumber>) -> bool {
        self.distance(other) < 0
    }

    pub fn greater_than(self, other: impl Into<SerialArithmeticNumber>) -> bool {
        self.distance(other) > 0
    }

    /// `low <= self <= high` in serial order
    pub fn in_window(self, low: impl Into<SerialArithmeticNumber>, high: impl Into<SerialArithmeticNumber>) -> bool {
        let low = low.into();
        let high = high.into();
        self.distance(low) >= 0 && high.distance(self) >= 0
    }
}

impl From<u32> for SerialArithmeticNumber {
    fn from(value: u32) -> Self {
        SerialArithmeticNumber(value)
    }
}

impl From<SerialArithmeticNumber> for u32 {
    fn from(sn: SerialArithmeticNumber) -> Self {
        sn.0
    }
}

impl PartialOrd for SerialArithmeticNumber {
    /// Pairs exactly 2^31 apart have no defined order
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.0.wrapping_sub(other.0) == 0x8000_0000 {
            None
        } else {
            Some(self.compare_to(*other))
        }
    }
}

impl fmt::Display for SerialArithmeticNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraparound_ordering() {
        let two = SerialArithmeticNumber::new(2);
        assert!(two.greater_than(0xFFFF_FFFE));
        assert!(SerialArithmeticNumber::new(0xFFFF_FFFE).less_than(1));
        assert!(!two.less_than(0xFFFF_FFFE));
    }

    #[test]
    fn test_increment_wraps() {
        let mut sn = SerialArithmeticNumber::new(0xFFFF_FFFF);
        sn.increment();
        assert_eq!(sn.value(), 0);
        sn.increment();
        assert_eq!(sn.value(), 1);
    }

    #[test]
    fn test_equality_is_numeric() {
        assert_eq!(SerialArithmeticNumber::new(7), SerialArithmeticNumber::from(7));
        assert_eq!(SerialArithmeticNumber::new(7).compare_to(7), Ordering::Equal);
    }

    #[test]
    fn test_window() {
        let sn = SerialArithmeticNumber::new(3);
        assert!(sn.in_window(0xFFFF_FFF0, 10));
        assert!(!sn.in_window(4, 10));
        assert!(SerialArithmeticNumber::new(10).in_window(10, 10));
    }

    #[test]
    fn test_half_range_is_unordered() {
        let a = SerialArithmeticNumber::new(0);
        let b = SerialArithmeticNumber::new(0x8000_0000);
        assert_eq!(a.partial_cmp(&b), None);
        assert!(SerialArithmeticNumber::new(1) > SerialArithmeticNumber::new(0xFFFF_FFFF));
    }
}
