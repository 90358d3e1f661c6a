//! Fixed-point settlement and emission arithmetic.
//!
//! Decimal fractions never enter state: every rate is a scaled integer and
//! every step is multiply-by-numerator, divide-by-denominator with floor
//! semantics. `FIXED_POINT_SCALE` carries 8 decimal digits; allocation uses
//! a wider `ALLOCATION_PRECISION` so the single division happens at the
//! widest intermediate.

use crate::{Amount, EngineError, Result};

/// 8 decimal digits of fixed-point precision.
pub const FIXED_POINT_SCALE: u64 = 100_000_000;

/// Weekly rebase factor 0.9975, scaled by `FIXED_POINT_SCALE`.
pub const WEEKLY_REBASE_FACTOR_SCALED: u64 = 99_750_000;

/// Seconds per rebase period (one week).
pub const REBASE_PERIOD_SECS: u64 = 604_800;

/// `floor((MONTHLY_RATE / PERIODS_PER_MONTH) * 10^8)` with
/// `MONTHLY_RATE = 0.0285` and `PERIODS_PER_MONTH = 8640`.
pub const PERIOD_RATE_SCALED: u64 = 329;

/// Emission ticks per day, for the projected-daily view.
pub const PERIODS_PER_DAY: u64 = 288;

/// Scale for weighted allocation: keeps one division at the widest
/// intermediate (`emission * weight * PRECISION / total / PRECISION`).
pub const ALLOCATION_PRECISION: u64 = 10_000_000_000_000_000;

/// Number of complete weeks elapsed between two second timestamps.
pub fn weeks_elapsed(now: u64, staked_at: u64) -> u64 {
    now.saturating_sub(staked_at) / REBASE_PERIOD_SECS
}

/// `floor(0.9975^weeks * 10^8)`, by iterated fixed-point multiplication.
///
/// Monotone non-increasing in `weeks`; identity (`10^8`) at zero weeks.
pub fn rebase_factor(weeks: u64) -> u64 {
    let mut factor: u128 = FIXED_POINT_SCALE as u128;
    for _ in 0..weeks {
        factor = factor * WEEKLY_REBASE_FACTOR_SCALED as u128 / FIXED_POINT_SCALE as u128;
        if factor == 0 {
            break;
        }
    }
    factor as u64
}

/// Rebase-adjusted cost basis: `initial * rebase_factor(weeks) / 10^8`.
pub fn rebased_basis(initial: &Amount, weeks: u64) -> Result<Amount> {
    if weeks == 0 {
        return Ok(*initial);
    }
    initial.mul_div(
        &Amount::from_u64(rebase_factor(weeks)),
        &Amount::from_u64(FIXED_POINT_SCALE),
    )
}

/// Split a profit into `(protocol_fee, user_share)`.
///
/// `fee = profit * fee_percentage / fee_divisor`, flooring, so small
/// profits round the fee down to zero in the user's favor.
pub fn fee_split(profit: &Amount, fee_percentage: u64, fee_divisor: u64) -> Result<(Amount, Amount)> {
    if fee_divisor == 0 {
        return Err(EngineError::Arithmetic("zero fee divisor".into()));
    }
    let fee = profit.mul_div(
        &Amount::from_u64(fee_percentage),
        &Amount::from_u64(fee_divisor),
    )?;
    let user_share = profit.checked_sub(&fee)?;
    Ok((fee, user_share))
}

/// Weighted share of an emission: `emission * weight * P / total / P`.
pub fn proportional(emission: &Amount, weight: &Amount, total_weight: &Amount) -> Result<Amount> {
    if total_weight.is_zero() {
        return Err(EngineError::Arithmetic("zero total weight".into()));
    }
    let precision = Amount::from_u64(ALLOCATION_PRECISION);
    let scaled = emission
        .checked_mul(weight)?
        .mul_div(&precision, total_weight)?;
    scaled.checked_div(&precision)
}

/// Format `numerator / denominator` with 6 decimal digits, flooring.
pub fn format_ratio_6dp(numerator: &Amount, denominator: &Amount) -> Result<String> {
    let scaled = numerator
        .mul_div(&Amount::from_u64(1_000_000), denominator)?
        .to_u128()
        .map_err(|_| EngineError::Arithmetic("ownership ratio out of range".into()))?;
    Ok(format!("{}.{:06}", scaled / 1_000_000, scaled % 1_000_000))
}
