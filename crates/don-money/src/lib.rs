//! Fixed-point money type.
//!
//! All monetary amounts in this system use a 1e-2 (cents) fixed-point
//! representation stored as `i64`. Raw `i64`/binary floats are never used for
//! money: floats cannot represent exact cent amounts and silently drift under
//! repeated arithmetic, which is unacceptable for a ledger that must balance
//! to the cent.
//!
//! `Cents` wraps the raw `i64` so the type system prevents accidental
//! construction from, or mixing with, unrelated integers (ids, quantities).
//!
//! 1 unit of currency = 100 `Cents`. There is intentionally no `From<i64>`
//! impl; callers use [`Cents::new`] to be explicit about scale.

use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// A fixed-point monetary amount at 1e-2 scale (cents).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cents(i64);

impl Cents {
    pub const ZERO: Cents = Cents(0);
    pub const MAX: Cents = Cents(i64::MAX);
    pub const MIN: Cents = Cents(i64::MIN);

    /// Construct from a raw cent count.
    #[inline]
    pub const fn new(raw: i64) -> Self {
        Cents(raw)
    }

    /// Construct from a major-unit amount (dollars) and minor-unit amount
    /// (cents), e.g. `Cents::from_parts(19, 99)` for $19.99.
    #[inline]
    pub const fn from_parts(major: i64, minor: i64) -> Self {
        Cents(major * 100 + minor)
    }

    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn checked_add(self, rhs: Cents) -> Option<Cents> {
        self.0.checked_add(rhs.0).map(Cents)
    }

    #[inline]
    pub fn checked_sub(self, rhs: Cents) -> Option<Cents> {
        self.0.checked_sub(rhs.0).map(Cents)
    }

    #[inline]
    pub fn saturating_add(self, rhs: Cents) -> Cents {
        Cents(self.0.saturating_add(rhs.0))
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Cents) -> Cents {
        Cents(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    pub fn abs(self) -> Cents {
        Cents(self.0.saturating_abs())
    }

    #[inline]
    pub fn signum(self) -> i64 {
        self.0.signum()
    }

    #[inline]
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub fn is_non_negative(self) -> bool {
        self.0 >= 0
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl Add for Cents {
    type Output = Cents;
    #[inline]
    fn add(self, rhs: Cents) -> Cents {
        Cents(self.0 + rhs.0)
    }
}

impl Sub for Cents {
    type Output = Cents;
    #[inline]
    fn sub(self, rhs: Cents) -> Cents {
        Cents(self.0 - rhs.0)
    }
}

impl Neg for Cents {
    type Output = Cents;
    #[inline]
    fn neg(self) -> Cents {
        Cents(-self.0)
    }
}

impl AddAssign for Cents {
    #[inline]
    fn add_assign(&mut self, rhs: Cents) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Cents {
    #[inline]
    fn sub_assign(&mut self, rhs: Cents) {
        self.0 -= rhs.0;
    }
}

impl std::fmt::Display for Cents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let major = self.0 / 100;
        let minor = (self.0 % 100).abs();
        if self.0 < 0 && major == 0 {
            write!(f, "-{major}.{minor:02}")
        } else {
            write!(f, "{major}.{minor:02}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_additive_identity() {
        let a = Cents::new(4200);
        assert_eq!(a + Cents::ZERO, a);
        assert_eq!(Cents::ZERO + a, a);
    }

    #[test]
    fn add_and_sub_roundtrip() {
        let a = Cents::new(10_000);
        let b = Cents::new(2_500);
        assert_eq!((a + b) - b, a);
    }

    #[test]
    fn neg_produces_opposite_sign() {
        let pos = Cents::new(500);
        let neg = -pos;
        assert_eq!(neg.raw(), -500);
        assert_eq!(-neg, pos);
    }

    #[test]
    fn ord_less_than() {
        let a = Cents::new(100);
        let b = Cents::new(200);
        assert!(a < b);
        assert!(b > a);
    }

    #[test]
    fn checked_add_overflow_returns_none() {
        assert_eq!(Cents::MAX.checked_add(Cents::new(1)), None);
    }

    #[test]
    fn checked_sub_overflow_returns_none() {
        assert_eq!(Cents::MIN.checked_sub(Cents::new(1)), None);
    }

    #[test]
    fn saturating_add_clamps_at_max() {
        assert_eq!(Cents::MAX.saturating_add(Cents::new(1)), Cents::MAX);
    }

    #[test]
    fn from_parts_builds_expected_cents() {
        assert_eq!(Cents::from_parts(19, 99), Cents::new(1999));
    }

    #[test]
    fn display_formats_with_two_decimal_places() {
        assert_eq!(format!("{}", Cents::new(150)), "1.50");
    }

    #[test]
    fn display_negative_fraction_only() {
        assert_eq!(format!("{}", Cents::new(-75)), "-0.75");
    }

    #[test]
    fn is_non_negative_and_is_negative() {
        assert!(Cents::new(0).is_non_negative());
        assert!(!Cents::new(-1).is_non_negative());
        assert!(Cents::new(-1).is_negative());
    }
}
