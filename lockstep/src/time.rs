//! Virtual simulation time.
//!
//! Virtual time is a dimensionless count of ticks. Whether a tick stands for
//! a nanosecond, a clock cycle or anything else is a convention shared by the
//! peers of a simulation.
//!
//! Timestamps are unsigned but bounded by [`VirtualTime::MAX`], which matches
//! the largest signed 64-bit value so that timestamps can be exchanged with
//! peers that use a signed representation.
use std::fmt;
use std::ops::Add;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A virtual timestamp, in ticks.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VirtualTime(u64);

impl VirtualTime {
    /// The origin of virtual time.
    pub const ZERO: Self = Self(0);

    /// The largest representable timestamp.
    pub const MAX: Self = Self(i64::MAX as u64);

    /// Creates a timestamp from a number of ticks.
    ///
    /// # Panics
    ///
    /// This function panics if `ticks` is greater than `VirtualTime::MAX`.
    pub const fn from_ticks(ticks: u64) -> Self {
        if ticks > Self::MAX.0 {
            panic!("virtual time out of range");
        }

        Self(ticks)
    }

    /// Returns the number of ticks elapsed since the origin.
    pub const fn as_ticks(self) -> u64 {
        self.0
    }

    /// Adds a delay, returning `None` if the result would exceed
    /// `VirtualTime::MAX`.
    pub const fn checked_add(self, delay: u64) -> Option<Self> {
        match self.0.checked_add(delay) {
            Some(ticks) if ticks <= Self::MAX.0 => Some(Self(ticks)),
            _ => None,
        }
    }

    /// Returns the number of ticks from `earlier` to `self`, or `None` if
    /// `earlier` is later than `self`.
    pub const fn checked_duration_since(self, earlier: Self) -> Option<u64> {
        self.0.checked_sub(earlier.0)
    }

    /// Returns the number of ticks from `earlier` to `self`, or zero if
    /// `earlier` is later than `self`.
    pub const fn saturating_duration_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<u64> for VirtualTime {
    type Output = Self;

    /// Adds a delay to a timestamp.
    ///
    /// # Panics
    ///
    /// This panics if the result would exceed `VirtualTime::MAX`.
    fn add(self, delay: u64) -> Self {
        self.checked_add(delay)
            .expect("overflow when adding a delay to a virtual timestamp")
    }
}

impl From<VirtualTime> for u64 {
    fn from(time: VirtualTime) -> Self {
        time.0
    }
}

impl fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_time_add_near_max() {
        assert_eq!(VirtualTime::ZERO.checked_add(i64::MAX as u64), Some(VirtualTime::MAX));
        assert_eq!(VirtualTime::MAX.checked_add(1), None);
        assert_eq!(VirtualTime::from_ticks(1).checked_add(u64::MAX), None);
    }

    #[test]
    #[should_panic]
    fn virtual_time_add_overflow() {
        let _ = VirtualTime::MAX + 1;
    }

    #[test]
    fn virtual_time_duration_since() {
        let t0 = VirtualTime::from_ticks(10);
        let t1 = VirtualTime::from_ticks(25);

        assert_eq!(t1.saturating_duration_since(t0), 15);
        assert_eq!(t0.saturating_duration_since(t1), 0);
        assert_eq!(t1.checked_duration_since(t0), Some(15));
        assert_eq!(t0.checked_duration_since(t1), None);
    }
}
