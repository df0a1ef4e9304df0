// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monotonic clock and `(seconds, microseconds)` arithmetic.
//!
//! All engine deadlines are absolute [`TimeVal`]s read from a process-local
//! monotonic epoch, so wall-clock steps never disturb the schedulers.

use std::cmp::Ordering;
use std::ops::{Add, AddAssign, Sub};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Microseconds per second; the `usec` field always stays below this.
pub const USEC_PER_SEC: u32 = 1_000_000;

/// A point in (or span of) monotonic time with microsecond resolution.
///
/// Invariant: `usec < 1_000_000` after every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TimeVal {
    /// Whole seconds.
    pub sec: u32,
    /// Microsecond remainder, normalized to `[0, 10^6)`.
    pub usec: u32,
}

impl TimeVal {
    /// The zero instant / empty span.
    pub const ZERO: TimeVal = TimeVal { sec: 0, usec: 0 };

    /// Build from raw fields, normalizing a microsecond overflow.
    pub fn new(sec: u32, usec: u32) -> Self {
        let mut tv = TimeVal { sec, usec };
        tv.normalize();
        tv
    }

    /// Build from a microsecond count.
    pub fn from_micros(us: u64) -> Self {
        TimeVal {
            sec: (us / u64::from(USEC_PER_SEC)) as u32,
            usec: (us % u64::from(USEC_PER_SEC)) as u32,
        }
    }

    /// Build from a millisecond count.
    pub fn from_millis(ms: u32) -> Self {
        Self::from_micros(u64::from(ms) * 1000)
    }

    /// Total microseconds.
    pub fn as_micros(self) -> u64 {
        u64::from(self.sec) * u64::from(USEC_PER_SEC) + u64::from(self.usec)
    }

    /// Convert to a `std::time::Duration` span.
    pub fn as_duration(self) -> Duration {
        Duration::new(u64::from(self.sec), self.usec * 1000)
    }

    /// Build from a `std::time::Duration` span (sub-microsecond truncated).
    pub fn from_duration(d: Duration) -> Self {
        TimeVal {
            sec: d.as_secs() as u32,
            usec: d.subsec_micros(),
        }
    }

    /// True for the zero instant.
    pub fn is_zero(self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    /// Three-way comparison: -1, 0, +1.
    pub fn compare(self, other: TimeVal) -> i32 {
        match self.cmp(&other) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    /// Saturating subtraction; returns `ZERO` when `other` is later.
    pub fn saturating_sub(self, other: TimeVal) -> TimeVal {
        if self <= other {
            return TimeVal::ZERO;
        }
        self - other
    }

    /// Multiply a span by a small integer factor.
    pub fn scale(self, factor: u32) -> TimeVal {
        Self::from_micros(self.as_micros() * u64::from(factor))
    }

    /// Divide a span by a divisor; `div == 0` yields `ZERO`.
    pub fn div(self, div: u32) -> TimeVal {
        if div == 0 {
            return TimeVal::ZERO;
        }
        Self::from_micros(self.as_micros() / u64::from(div))
    }

    fn normalize(&mut self) {
        if self.usec >= USEC_PER_SEC {
            self.sec = self.sec.wrapping_add(self.usec / USEC_PER_SEC);
            self.usec %= USEC_PER_SEC;
        }
    }
}

impl Add for TimeVal {
    type Output = TimeVal;

    fn add(self, rhs: TimeVal) -> TimeVal {
        let mut usec = self.usec + rhs.usec;
        let mut sec = self.sec.wrapping_add(rhs.sec);
        if usec >= USEC_PER_SEC {
            usec -= USEC_PER_SEC;
            sec = sec.wrapping_add(1);
        }
        TimeVal { sec, usec }
    }
}

impl AddAssign for TimeVal {
    fn add_assign(&mut self, rhs: TimeVal) {
        *self = *self + rhs;
    }
}

impl Sub for TimeVal {
    type Output = TimeVal;

    /// Borrowing subtraction. Callers must ensure `self >= rhs`; use
    /// [`TimeVal::saturating_sub`] when that is not guaranteed.
    fn sub(self, rhs: TimeVal) -> TimeVal {
        let mut sec = self.sec.wrapping_sub(rhs.sec);
        let usec = if self.usec >= rhs.usec {
            self.usec - rhs.usec
        } else {
            sec = sec.wrapping_sub(1);
            self.usec + USEC_PER_SEC - rhs.usec
        };
        TimeVal { sec, usec }
    }
}

impl PartialOrd for TimeVal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeVal {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.sec, self.usec).cmp(&(other.sec, other.usec))
    }
}

impl std::fmt::Display for TimeVal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current monotonic time relative to the process epoch.
///
/// The epoch is latched on first use; all deadlines in a process share it.
pub fn now() -> TimeVal {
    let epoch = *EPOCH.get_or_init(Instant::now);
    TimeVal::from_duration(epoch.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_carries_microseconds() {
        let a = TimeVal::new(1, 900_000);
        let b = TimeVal::new(0, 200_000);
        assert_eq!(a + b, TimeVal::new(2, 100_000));
    }

    #[test]
    fn sub_borrows_microseconds() {
        let a = TimeVal::new(2, 100_000);
        let b = TimeVal::new(0, 200_000);
        assert_eq!(a - b, TimeVal::new(1, 900_000));
    }

    #[test]
    fn saturating_sub_clamps() {
        let a = TimeVal::new(1, 0);
        let b = TimeVal::new(2, 0);
        assert_eq!(a.saturating_sub(b), TimeVal::ZERO);
        assert_eq!(b.saturating_sub(a), TimeVal::new(1, 0));
    }

    #[test]
    fn compare_is_three_way() {
        let a = TimeVal::new(1, 500);
        let b = TimeVal::new(1, 501);
        assert_eq!(a.compare(b), -1);
        assert_eq!(b.compare(a), 1);
        assert_eq!(a.compare(a), 0);
    }

    #[test]
    fn scale_and_div() {
        let cycle = TimeVal::from_micros(100_000);
        assert_eq!(cycle.scale(10), TimeVal::new(1, 0));
        assert_eq!(TimeVal::new(1, 0).div(4), TimeVal::from_micros(250_000));
        assert_eq!(cycle.div(0), TimeVal::ZERO);
    }

    #[test]
    fn normalization_on_new() {
        assert_eq!(TimeVal::new(0, 2_500_000), TimeVal::new(2, 500_000));
    }

    #[test]
    fn monotonic_now_advances() {
        let a = now();
        std::thread::sleep(Duration::from_millis(2));
        let b = now();
        assert!(b > a);
    }

    #[test]
    fn micros_round_trip() {
        for us in [0u64, 1, 999_999, 1_000_000, 123_456_789] {
            assert_eq!(TimeVal::from_micros(us).as_micros(), us);
        }
    }
}
