//! A Lightning amount newtype denominated in millisatoshis.
//!
//! We don't impl `From<u64>` because we want calling code to be explicit
//! about what the input unit is: use [`Amount::from_msat`] or
//! [`Amount::from_sat`].

use std::{
    fmt::{self, Display},
    iter::Sum,
    ops::{Add, Div, Sub},
};

use serde::{Deserialize, Serialize};

/// Errors that can occur when attempting to construct an [`Amount`].
#[derive(Copy, Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("amount overflows the millisatoshi u64 range")]
    TooLarge,
}

/// A millisatoshi amount, internally represented as a [`u64`].
///
/// - Serializes to / from a bare millisatoshi integer.
/// - Checked and saturating arithmetic is provided for code paths where
///   over / underflow is reachable; the `Add` / `Sub` operators are reserved
///   for places where bounds are already known.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash,
    Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    /// An [`Amount`] of zero millisatoshis.
    pub const ZERO: Self = Self(0);

    /// The maximum representable [`Amount`].
    pub const MAX: Self = Self(u64::MAX);

    /// Construct an [`Amount`] from a millisatoshi value.
    #[inline]
    pub const fn from_msat(msat: u64) -> Self {
        Self(msat)
    }

    /// Construct an [`Amount`] from a satoshi value.
    #[inline]
    pub fn try_from_sat(sat: u64) -> Result<Self, Error> {
        sat.checked_mul(1000).map(Self).ok_or(Error::TooLarge)
    }

    /// The contained millisatoshi value.
    #[inline]
    pub const fn msat(self) -> u64 {
        self.0
    }

    /// The contained value in whole satoshis, rounded down.
    #[inline]
    pub const fn sat_floor(self) -> u64 {
        self.0 / 1000
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    #[inline]
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    #[inline]
    pub fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// Proportional fee helper: `self * proportional_millionths / 1_000_000`,
    /// computed without intermediate overflow.
    #[inline]
    pub fn proportional_millionths(self, millionths: u64) -> Self {
        let fee = u128::from(self.0) * u128::from(millionths) / 1_000_000;
        // A proportional fee rate of up to 1_000_000 ppm cannot overflow.
        Self(u64::try_from(fee).unwrap_or(u64::MAX))
    }
}

impl Add for Amount {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Div<u64> for Amount {
    type Output = Self;
    #[inline]
    fn div(self, rhs: u64) -> Self {
        Self(self.0 / rhs)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Self::saturating_add)
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// Displays the contained millisatoshi value without a unit suffix.
impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::{any, Arbitrary},
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for Amount {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            any::<u64>().prop_map(Amount::from_msat).boxed()
        }
    }
}

#[cfg(test)]
mod test {
    use crate::test_utils::roundtrip;

    use super::*;

    #[test]
    fn amount_serde_roundtrip() {
        roundtrip::json_value_canonical_proptest::<Amount>();
    }

    #[test]
    fn serializes_as_bare_msat() {
        let amount = Amount::from_msat(502_000);
        assert_eq!(serde_json::to_string(&amount).unwrap(), "502000");
    }

    #[test]
    fn saturating_arithmetic() {
        let one = Amount::from_msat(1);
        let two = Amount::from_msat(2);
        assert_eq!(one.saturating_sub(two), Amount::ZERO);
        assert_eq!(Amount::MAX.saturating_add(one), Amount::MAX);
        assert_eq!(two.checked_sub(one), Some(one));
        assert_eq!(one.checked_sub(two), None);
    }

    #[test]
    fn proportional_fee_does_not_overflow() {
        let amount = Amount::from_msat(u64::MAX);
        // 100% fee rate
        assert_eq!(
            amount.proportional_millionths(1_000_000),
            Amount::from_msat(u64::MAX)
        );
        let amount = Amount::from_msat(1_000_000);
        assert_eq!(amount.proportional_millionths(500), Amount::from_msat(500));
    }
}
