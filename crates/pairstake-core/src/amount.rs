//! Non-negative 256-bit token amounts.
//!
//! Amounts travel as decimal strings on the wire and live as `U256` in
//! memory. All arithmetic is truncating-integer: division floors, and no
//! floating point is admitted into state. Multiply-then-divide widens to
//! `U512` so the intermediate product cannot overflow.

use std::fmt;
use std::str::FromStr;

use primitive_types::{U256, U512};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{EngineError, Result};

/// A non-negative integer token amount, at least 256 bits wide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(U256);

impl Amount {
    pub fn zero() -> Self {
        Amount(U256::zero())
    }

    pub fn one() -> Self {
        Amount(U256::one())
    }

    pub fn from_u64(value: u64) -> Self {
        Amount(U256::from(value))
    }

    pub fn from_u128(value: u128) -> Self {
        Amount(U256::from(value))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Parse a decimal string. Rejects empty input, signs, and any
    /// non-digit character; rejects values that do not fit in 256 bits.
    pub fn parse_dec(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(EngineError::InvalidAmount("empty amount string".into()));
        }
        if !input.bytes().all(|b| b.is_ascii_digit()) {
            return Err(EngineError::InvalidAmount(format!(
                "non-decimal amount string: {input:?}"
            )));
        }
        U256::from_dec_str(input)
            .map(Amount)
            .map_err(|_| EngineError::InvalidAmount(format!("amount out of range: {input:?}")))
    }

    pub fn checked_add(&self, other: &Amount) -> Result<Amount> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or_else(|| EngineError::Arithmetic("addition overflow".into()))
    }

    pub fn checked_sub(&self, other: &Amount) -> Result<Amount> {
        self.0
            .checked_sub(other.0)
            .map(Amount)
            .ok_or_else(|| EngineError::Arithmetic("subtraction underflow".into()))
    }

    pub fn checked_mul(&self, other: &Amount) -> Result<Amount> {
        self.0
            .checked_mul(other.0)
            .map(Amount)
            .ok_or_else(|| EngineError::Arithmetic("multiplication overflow".into()))
    }

    /// Floor division. Division by zero is an error, never a panic.
    pub fn checked_div(&self, other: &Amount) -> Result<Amount> {
        if other.0.is_zero() {
            return Err(EngineError::Arithmetic("division by zero".into()));
        }
        Ok(Amount(self.0 / other.0))
    }

    /// `self * mul / div` with a 512-bit intermediate product, flooring.
    ///
    /// Keeps the single division at the widest intermediate so chained
    /// proportional computations lose at most one unit to rounding.
    pub fn mul_div(&self, mul: &Amount, div: &Amount) -> Result<Amount> {
        if div.0.is_zero() {
            return Err(EngineError::Arithmetic("division by zero".into()));
        }
        let wide: U512 = self.0.full_mul(mul.0);
        let quotient = wide / U512::from(div.0);
        let limbs = quotient.0;
        if limbs[4] != 0 || limbs[5] != 0 || limbs[6] != 0 || limbs[7] != 0 {
            return Err(EngineError::Arithmetic("mul_div quotient overflow".into()));
        }
        Ok(Amount(U256([limbs[0], limbs[1], limbs[2], limbs[3]])))
    }

    pub fn mul_u64(&self, factor: u64) -> Result<Amount> {
        self.checked_mul(&Amount::from_u64(factor))
    }

    pub fn div_u64(&self, divisor: u64) -> Result<Amount> {
        self.checked_div(&Amount::from_u64(divisor))
    }

    /// Saturating subtraction: zero instead of an error on underflow.
    pub fn saturating_sub(&self, other: &Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    pub fn min(self, other: Amount) -> Amount {
        if self <= other {
            self
        } else {
            other
        }
    }

    /// Narrow to u128 for fixed-point helpers; errors if out of range.
    pub fn to_u128(&self) -> Result<u128> {
        if self.0 > U256::from(u128::MAX) {
            return Err(EngineError::Arithmetic("amount exceeds 128 bits".into()));
        }
        Ok(self.0.as_u128())
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // U256 renders in decimal.
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Amount::parse_dec(s)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

struct AmountVisitor;

impl Visitor<'_> for AmountVisitor {
    type Value = Amount;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a decimal string amount")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Amount, E> {
        Amount::parse_dec(value).map_err(|e| E::custom(e.to_string()))
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Amount, D::Error> {
        deserializer.deserialize_str(AmountVisitor)
    }
}
