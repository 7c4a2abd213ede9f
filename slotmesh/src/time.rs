//! Time types for the slot engine.
//!
//! All radio timing is expressed in microseconds. Values are passed explicitly
//! so that the engine can run against real timers or a simulated clock with
//! identical behavior.

use core::fmt;
use core::ops::{Add, AddAssign, Mul, Sub};

/// Point in time in microseconds.
///
/// Wraps a u64 to keep instants and spans from being mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant(u64);

impl Instant {
    /// Zero instant (timer epoch).
    pub const ZERO: Instant = Instant(0);

    /// Maximum instant.
    pub const MAX: Instant = Instant(u64::MAX);

    /// Create an instant from microseconds.
    #[inline]
    pub const fn from_micros(us: u64) -> Self {
        Instant(us)
    }

    /// Create an instant from milliseconds.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Instant(ms.saturating_mul(1000))
    }

    /// Create an instant from seconds.
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Instant(secs.saturating_mul(1_000_000))
    }

    /// Get the instant as microseconds.
    #[inline]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Get the instant as milliseconds (truncated).
    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1000
    }

    /// Saturating addition of a duration.
    #[inline]
    pub const fn saturating_add(self, duration: Duration) -> Self {
        Instant(self.0.saturating_add(duration.0))
    }

    /// Saturating subtraction of another instant, returning a duration.
    #[inline]
    pub const fn saturating_sub(self, other: Instant) -> Duration {
        Duration(self.0.saturating_sub(other.0))
    }

    /// Checked subtraction of another instant.
    #[inline]
    pub const fn checked_sub(self, other: Instant) -> Option<Duration> {
        match self.0.checked_sub(other.0) {
            Some(d) => Some(Duration(d)),
            None => None,
        }
    }

    /// Shift by a signed number of microseconds, clamping at zero.
    ///
    /// Drift corrections are signed and applied to slot start times.
    #[inline]
    pub const fn offset_by(self, us: i64) -> Self {
        if us >= 0 {
            Instant(self.0.saturating_add(us as u64))
        } else {
            Instant(self.0.saturating_sub(us.unsigned_abs()))
        }
    }

    /// Signed difference `self - other` in microseconds.
    #[inline]
    pub const fn signed_diff(self, other: Instant) -> i64 {
        self.0.wrapping_sub(other.0) as i64
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    #[inline]
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for Instant {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl Sub for Instant {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Instant) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    #[inline]
    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_sub(rhs.0))
    }
}

/// Time span in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(u64);

impl Duration {
    /// Zero duration.
    pub const ZERO: Duration = Duration(0);

    /// Maximum duration.
    pub const MAX: Duration = Duration(u64::MAX);

    /// Create a duration from microseconds.
    #[inline]
    pub const fn from_micros(us: u64) -> Self {
        Duration(us)
    }

    /// Create a duration from milliseconds.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms.saturating_mul(1000))
    }

    /// Create a duration from seconds.
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs.saturating_mul(1_000_000))
    }

    /// Get the duration as microseconds.
    #[inline]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Get the duration as milliseconds (truncated).
    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1000
    }

    /// Get the duration as seconds (truncated).
    #[inline]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Saturating addition.
    #[inline]
    pub const fn saturating_add(self, other: Duration) -> Self {
        Duration(self.0.saturating_add(other.0))
    }

    /// Saturating subtraction.
    #[inline]
    pub const fn saturating_sub(self, other: Duration) -> Self {
        Duration(self.0.saturating_sub(other.0))
    }

    /// Saturating multiplication by a scalar.
    #[inline]
    pub const fn saturating_mul(self, n: u64) -> Self {
        Duration(self.0.saturating_mul(n))
    }

    /// Number of whole slots of `slot_len` that fit in this span.
    #[inline]
    pub const fn as_slots(self, slot_len: Duration) -> u64 {
        if slot_len.0 == 0 {
            0
        } else {
            self.0 / slot_len.0
        }
    }
}

impl Add for Duration {
    type Output = Duration;

    #[inline]
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl Sub for Duration {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl Mul<u64> for Duration {
    type Output = Duration;

    #[inline]
    fn mul(self, rhs: u64) -> Duration {
        Duration(self.0 * rhs)
    }
}

/// Absolute Slot Number.
///
/// A 40-bit slot counter carried in a u64. Only ever moves forward while the
/// engine runs; the split into `ms1b`/`ls4b` matches the on-air layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Asn(u64);

impl Asn {
    /// Mask for the 40 significant bits.
    pub const MASK: u64 = 0xff_ffff_ffff;

    /// First slot.
    pub const ZERO: Asn = Asn(0);

    /// Create an ASN from a raw counter (truncated to 40 bits).
    #[inline]
    pub const fn new(value: u64) -> Self {
        Asn(value & Self::MASK)
    }

    /// Rebuild from the most significant byte and the low four bytes.
    #[inline]
    pub const fn from_parts(ms1b: u8, ls4b: u32) -> Self {
        Asn(((ms1b as u64) << 32) | ls4b as u64)
    }

    /// Raw counter value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Most significant byte.
    #[inline]
    pub const fn ms1b(self) -> u8 {
        (self.0 >> 32) as u8
    }

    /// Least significant four bytes.
    #[inline]
    pub const fn ls4b(self) -> u32 {
        self.0 as u32
    }

    /// Advance by `n` slots.
    #[inline]
    pub fn inc(&mut self, n: u64) {
        self.0 = self.0.wrapping_add(n) & Self::MASK;
    }

    /// Step back by `n` slots.
    #[inline]
    pub fn dec(&mut self, n: u64) {
        self.0 = self.0.wrapping_sub(n) & Self::MASK;
    }

    /// ASN `n` slots ahead.
    #[inline]
    #[must_use]
    pub const fn plus(self, n: u64) -> Asn {
        Asn(self.0.wrapping_add(n) & Self::MASK)
    }

    /// Slots elapsed from `earlier` to `self`.
    #[inline]
    pub const fn diff(self, earlier: Asn) -> u64 {
        self.0.wrapping_sub(earlier.0) & Self::MASK
    }

    /// `self mod size`, with a zero size mapping to zero.
    #[inline]
    pub const fn modulo(self, size: u16) -> u16 {
        if size == 0 {
            0
        } else {
            (self.0 % size as u64) as u16
        }
    }

    /// Absolute slotframe number for a slotframe of `size`.
    #[inline]
    pub const fn slotframe_number(self, size: u16) -> u64 {
        if size == 0 {
            0
        } else {
            self.0 / size as u64
        }
    }
}

impl fmt::Display for Asn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{:x}", self.ms1b(), self.ls4b())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instant_conversions() {
        let t = Instant::from_millis(1500);
        assert_eq!(t.as_micros(), 1_500_000);
        assert_eq!(t.as_millis(), 1500);
        assert_eq!(Instant::from_secs(2).as_millis(), 2000);
    }

    #[test]
    fn test_instant_arithmetic() {
        let t1 = Instant::from_micros(10_000);
        let t2 = t1 + Duration::from_micros(2_120);
        assert_eq!(t2.as_micros(), 12_120);
        assert_eq!(t2 - t1, Duration::from_micros(2_120));
        assert_eq!(t1 - t2, Duration::ZERO);
        assert_eq!(t2.checked_sub(t1), Some(Duration::from_micros(2_120)));
        assert_eq!(t1.checked_sub(t2), None);
    }

    #[test]
    fn test_instant_signed_offset() {
        let t = Instant::from_micros(1000);
        assert_eq!(t.offset_by(200).as_micros(), 1200);
        assert_eq!(t.offset_by(-200).as_micros(), 800);
        assert_eq!(t.offset_by(-5000), Instant::ZERO);
        assert_eq!(t.signed_diff(Instant::from_micros(1300)), -300);
    }

    #[test]
    fn test_duration_slots() {
        let slot = Duration::from_micros(10_000);
        assert_eq!(Duration::from_secs(1).as_slots(slot), 100);
        assert_eq!(Duration::from_secs(1).as_slots(Duration::ZERO), 0);
        assert_eq!((slot * 3).as_micros(), 30_000);
    }

    #[test]
    fn test_asn_parts() {
        let asn = Asn::from_parts(0x01, 0x0000_0010);
        assert_eq!(asn.value(), 0x1_0000_0010);
        assert_eq!(asn.ms1b(), 0x01);
        assert_eq!(asn.ls4b(), 0x10);
    }

    #[test]
    fn test_asn_wraps_at_40_bits() {
        let mut asn = Asn::new(Asn::MASK);
        asn.inc(1);
        assert_eq!(asn, Asn::ZERO);
        asn.dec(1);
        assert_eq!(asn.value(), Asn::MASK);
        assert_eq!(Asn::new(5).diff(Asn::new(Asn::MASK)), 6);
    }

    #[test]
    fn test_asn_modulo() {
        assert_eq!(Asn::new(5).modulo(3), 2);
        assert_eq!(Asn::new(5).modulo(0), 0);
        assert_eq!(Asn::new(100).slotframe_number(47), 2);
    }
}
