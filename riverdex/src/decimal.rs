//! Fixed-point decimal arithmetic.
//!
//! Every price, quantity and rate in the engine is a [`Decimal`]: an i128
//! mantissa with 18 fractional digits. All operations are checked; multiply
//! and divide widen through a 256-bit integer so intermediate products never
//! wrap. Quotients truncate toward zero.

use std::fmt;
use std::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uint::construct_uint;

use crate::types::{EngineError, EngineResult};

construct_uint! {
    /// 256-bit unsigned integer backing widened mul/div.
    pub struct U256(4);
}

/// Number of fractional digits.
pub const DECIMALS: u32 = 18;

/// Mantissa units per 1.0.
pub const SCALE: i128 = 1_000_000_000_000_000_000;

#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct Decimal(i128);

impl Decimal {
    pub const ZERO: Decimal = Decimal(0);
    pub const ONE: Decimal = Decimal(SCALE);

    /// Builds a decimal from a raw mantissa (value × 10^18).
    pub const fn from_scaled(mantissa: i128) -> Self {
        Decimal(mantissa)
    }

    /// Builds a decimal from a whole number.
    pub const fn int(n: i64) -> Self {
        Decimal(n as i128 * SCALE)
    }

    pub const fn mantissa(&self) -> i128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn abs(&self) -> Decimal {
        // i128::MIN never occurs: `guard` rejects it on every arithmetic path.
        Decimal(self.0.abs())
    }

    pub fn neg(&self) -> Decimal {
        Decimal(-self.0)
    }

    pub fn min(self, other: Decimal) -> Decimal {
        if self <= other {
            self
        } else {
            other
        }
    }

    pub fn max(self, other: Decimal) -> Decimal {
        if self >= other {
            self
        } else {
            other
        }
    }

    pub fn clamp(self, lo: Decimal, hi: Decimal) -> Decimal {
        self.max(lo).min(hi)
    }

    pub fn safe_add(self, rhs: Decimal) -> EngineResult<Decimal> {
        guard(
            self.0
                .checked_add(rhs.0)
                .ok_or(EngineError::ArithmeticOverflow)?,
        )
    }

    pub fn safe_sub(self, rhs: Decimal) -> EngineResult<Decimal> {
        guard(
            self.0
                .checked_sub(rhs.0)
                .ok_or(EngineError::ArithmeticOverflow)?,
        )
    }

    /// Fixed-point multiply: (a × b) / 10^18, truncated toward zero.
    pub fn safe_mul(self, rhs: Decimal) -> EngineResult<Decimal> {
        let negative = (self.0 < 0) != (rhs.0 < 0);
        let lhs = U256::from(self.0.unsigned_abs());
        let rhs = U256::from(rhs.0.unsigned_abs());
        let product = lhs
            .checked_mul(rhs)
            .ok_or(EngineError::ArithmeticOverflow)?;
        narrow(product / U256::from(SCALE as u128), negative)
    }

    /// Fixed-point divide: (a × 10^18) / b, truncated toward zero.
    pub fn safe_div(self, rhs: Decimal) -> EngineResult<Decimal> {
        if rhs.0 == 0 {
            return Err(EngineError::DivisionByZero);
        }
        let negative = (self.0 < 0) != (rhs.0 < 0);
        let lhs = U256::from(self.0.unsigned_abs());
        let scaled = lhs
            .checked_mul(U256::from(SCALE as u128))
            .ok_or(EngineError::ArithmeticOverflow)?;
        narrow(scaled / U256::from(rhs.0.unsigned_abs()), negative)
    }

    /// True when `self` is a whole multiple of `step`. `step` must be positive.
    pub fn is_multiple_of(&self, step: Decimal) -> EngineResult<bool> {
        if step.0 <= 0 {
            return Err(EngineError::DivisionByZero);
        }
        Ok(self.0 % step.0 == 0)
    }

    /// Rounds toward zero to the nearest multiple of `step`.
    pub fn align_down(&self, step: Decimal) -> EngineResult<Decimal> {
        if step.0 <= 0 {
            return Err(EngineError::DivisionByZero);
        }
        Ok(Decimal(self.0 - self.0 % step.0))
    }

    pub fn signum(&self) -> i32 {
        match self.0 {
            0 => 0,
            n if n > 0 => 1,
            _ => -1,
        }
    }
}

/// i128::MIN has no absolute value; every arithmetic result funnels through
/// here so the rest of the type can take `abs`/`neg` for granted.
fn guard(mantissa: i128) -> EngineResult<Decimal> {
    if mantissa == i128::MIN {
        return Err(EngineError::ArithmeticOverflow);
    }
    Ok(Decimal(mantissa))
}

fn narrow(wide: U256, negative: bool) -> EngineResult<Decimal> {
    if wide > U256::from(i128::MAX as u128) {
        return Err(EngineError::ArithmeticOverflow);
    }
    let magnitude = wide.as_u128() as i128;
    Ok(Decimal(if negative { -magnitude } else { magnitude }))
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        let whole = magnitude / SCALE as u128;
        let frac = magnitude % SCALE as u128;
        if frac == 0 {
            return write!(f, "{sign}{whole}");
        }
        let frac = format!("{frac:018}");
        write!(f, "{sign}{whole}.{}", frac.trim_end_matches('0'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDecimalError;

impl fmt::Display for ParseDecimalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid decimal literal")
    }
}

impl std::error::Error for ParseDecimalError {}

impl FromStr for Decimal {
    type Err = ParseDecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        if body.is_empty() {
            return Err(ParseDecimalError);
        }
        let (whole, frac) = match body.split_once('.') {
            Some((w, f)) => (w, f),
            None => (body, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(ParseDecimalError);
        }
        if frac.len() > DECIMALS as usize {
            return Err(ParseDecimalError);
        }
        let mut mantissa: i128 = 0;
        for c in whole.chars() {
            let digit = c.to_digit(10).ok_or(ParseDecimalError)? as i128;
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(digit))
                .ok_or(ParseDecimalError)?;
        }
        mantissa = mantissa.checked_mul(SCALE).ok_or(ParseDecimalError)?;
        let mut frac_units: i128 = 0;
        for c in frac.chars() {
            let digit = c.to_digit(10).ok_or(ParseDecimalError)? as i128;
            frac_units = frac_units * 10 + digit;
        }
        for _ in 0..(DECIMALS as usize - frac.len()) {
            frac_units *= 10;
        }
        mantissa = mantissa.checked_add(frac_units).ok_or(ParseDecimalError)?;
        let mantissa = if negative { -mantissa } else { mantissa };
        if mantissa == i128::MIN {
            return Err(ParseDecimalError);
        }
        Ok(Decimal(mantissa))
    }
}

impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Decimal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
