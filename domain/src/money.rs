//! Exact fixed-point currency amounts.
//!
//! Decimal text goes through `rust_decimal`; the value itself is kept as
//! nano-units so a per-mille share of any rate with up to six decimal places
//! is representable without rounding and stores as a plain integer.

use std::fmt::{Display, Formatter};
use std::iter::Sum;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::CoreError;

/// Nano-units in one whole currency unit.
pub const NANOS_PER_UNIT: u64 = 1_000_000_000;

/// Billable events a rate is quoted against (cost per mille).
pub const EVENTS_PER_RATE: u64 = 1000;

const MAX_FRACTION_DIGITS: u32 = 9;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(u64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Whole currency units, `None` on overflow.
    pub fn from_units(units: u64) -> Option<Self> {
        units.checked_mul(NANOS_PER_UNIT).map(Self)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn saturating_add(self, other: Money) -> Money {
        Money(self.0.saturating_add(other.0))
    }

    /// Share of a per-mille rate earned by one billable event.
    pub fn per_event(self) -> Money {
        Money(self.0 / EVENTS_PER_RATE)
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::from_i128_with_scale(i128::from(self.0), MAX_FRACTION_DIGITS)
    }

    /// Exact conversion; fails on negative values, more than nine decimal
    /// places, or amounts that do not fit.
    pub fn from_decimal(d: Decimal) -> Result<Money, CoreError> {
        if d.is_sign_negative() && !d.is_zero() {
            return Err(CoreError::InvalidAmount("amount must not be negative".into()));
        }
        if d.normalize().scale() > MAX_FRACTION_DIGITS {
            return Err(CoreError::InvalidAmount("too many decimal places".into()));
        }
        d.checked_mul(Decimal::from(NANOS_PER_UNIT))
            .and_then(|n| n.to_u64())
            .map(Money)
            .ok_or_else(|| CoreError::InvalidAmount("amount too large".into()))
    }

    /// Parse a plain non-negative decimal such as `"3"`, `"3.00"` or `"0.003"`.
    pub fn parse(s: &str) -> Result<Money, CoreError> {
        let trimmed = s.trim();
        let plain = trimmed.starts_with(|c: char| c.is_ascii_digit())
            && trimmed.chars().all(|c| c.is_ascii_digit() || c == '.');
        if !plain {
            return Err(CoreError::InvalidAmount(format!("not a decimal: {trimmed}")));
        }
        let d = Decimal::from_str(trimmed)
            .map_err(|e| CoreError::InvalidAmount(format!("not a decimal: {trimmed} ({e})")))?;
        if d.scale() > MAX_FRACTION_DIGITS {
            return Err(CoreError::InvalidAmount("too many decimal places".into()));
        }
        Money::from_decimal(d)
    }
}

impl Display for Money {
    /// Renders with at least two decimals and without trailing zeros beyond
    /// them: `3.00`, `0.003`, `0.003000001`.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut d = self.to_decimal().normalize();
        if d.scale() < 2 {
            d.rescale(2);
        }
        write!(f, "{d}")
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Money::saturating_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(Money::parse("3").unwrap(), Money::from_units(3).unwrap());
        assert_eq!(Money::parse("3.00").unwrap().as_nanos(), 3_000_000_000);
        assert_eq!(Money::parse("0.003").unwrap().as_nanos(), 3_000_000);
        assert_eq!(Money::parse(" 4.5 ").unwrap().as_nanos(), 4_500_000_000);
        assert_eq!(Money::parse("0").unwrap(), Money::ZERO);
    }

    #[test]
    fn rejects_bad_input() {
        for bad in ["", "-1", "+1", "1.2.3", "abc", ".5", "1.0000000001", "1e3"] {
            assert!(Money::parse(bad).is_err(), "accepted {bad:?}");
        }
        assert!(Money::parse("99999999999999999999").is_err());
    }

    #[test]
    fn displays_with_two_decimals_minimum() {
        assert_eq!(Money::parse("3").unwrap().to_string(), "3.00");
        assert_eq!(Money::parse("4.5").unwrap().to_string(), "4.50");
        assert_eq!(Money::parse("0.003").unwrap().to_string(), "0.003");
        assert_eq!(Money::from_nanos(3_000_001).to_string(), "0.003000001");
        assert_eq!(Money::ZERO.to_string(), "0.00");
    }

    #[test]
    fn per_event_is_one_thousandth() {
        assert_eq!(Money::parse("3.00").unwrap().per_event(), Money::parse("0.003").unwrap());
        assert_eq!(Money::parse("5").unwrap().per_event(), Money::parse("0.005").unwrap());
        assert_eq!(
            Money::parse("1.234567").unwrap().per_event().as_nanos(),
            1_234_567
        );
    }

    #[test]
    fn decimal_conversion_is_exact() {
        let d = Decimal::from_str("1.234567891").unwrap();
        let m = Money::from_decimal(d).unwrap();
        assert_eq!(m.as_nanos(), 1_234_567_891);
        assert_eq!(m.to_decimal(), d);
        assert!(Money::from_decimal(Decimal::from_str("-0.5").unwrap()).is_err());
        assert!(Money::from_decimal(Decimal::from_str("0.0000000001").unwrap()).is_err());
        // Trailing zeros past nine places do not add precision.
        assert_eq!(
            Money::from_decimal(Decimal::from_str("2.50000000000").unwrap()).unwrap(),
            Money::parse("2.5").unwrap()
        );
    }

    #[test]
    fn sum_adds_amounts() {
        let total: Money = (0..1000).map(|_| Money::parse("0.003").unwrap()).sum();
        assert_eq!(total, Money::parse("3").unwrap());
    }
}
