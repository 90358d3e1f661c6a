//! Emission engine.
//!
//! One authorized tick per interval: compute the period emission under the
//! remaining-supply cap and the MINT burn-rate cap, weight every active
//! staker by token type and stake size, and dispatch one
//! `Distribute-Rewards` message to the treasury. The engine only reads the
//! staking tables; its own state is the pair of global counters.

use std::collections::BTreeMap;

use serde_json::json;
use tracing::{debug, info};

use crate::dispatch::HandlerContext;
use crate::ledger::Ledger;
use crate::math;
use crate::wire::Outbound;
use crate::{
    Amount, EngineConfig, EngineError, IlPolicy, PriceSource, Result, StakerId, TokenId,
};

/// Period emission before the burn-rate cap:
/// `remaining * PERIOD_RATE_SCALED / 10^8`, clamped to `remaining`.
pub fn compute_emission(remaining: &Amount) -> Result<Amount> {
    let emission = remaining.mul_div(
        &Amount::from_u64(math::PERIOD_RATE_SCALED),
        &Amount::from_u64(math::FIXED_POINT_SCALE),
    )?;
    Ok(emission.min(*remaining))
}

/// Burn-rate cap: 45% of the weekly 0.25% rebase burn, spread over the
/// 2016 emission periods in a week. Zero reported supply means no cap.
pub fn burn_rate_cap(mint_token_supply: &Amount) -> Result<Option<Amount>> {
    if mint_token_supply.is_zero() {
        return Ok(None);
    }
    let weekly_burn = mint_token_supply.mul_div(
        &Amount::from_u64(25),
        &Amount::from_u64(10_000),
    )?;
    let weekly_cap = weekly_burn.mul_div(&Amount::from_u64(45), &Amount::from_u64(100))?;
    Ok(Some(weekly_cap.div_u64(2_016)?))
}

/// Weight of one stake: the special token divides by 1000, every other
/// token multiplies by its configured weight.
fn stake_weight(
    token: &TokenId,
    amount: &Amount,
    ledger: &Ledger,
    config: &EngineConfig,
) -> Result<Amount> {
    if *token == config.special_token {
        amount.div_u64(crate::config::SPECIAL_TOKEN_DIVISOR)
    } else {
        amount.mul_u64(ledger.weight_for(token))
    }
}

/// Per-staker aggregate weights and their total over all active positions.
pub fn staker_weights(
    ledger: &Ledger,
    config: &EngineConfig,
) -> Result<(BTreeMap<StakerId, Amount>, Amount)> {
    let mut weights: BTreeMap<StakerId, Amount> = BTreeMap::new();
    let mut total = Amount::zero();
    for (token, bucket) in ledger.staking_positions() {
        for (staker, position) in bucket {
            if position.amount.is_zero() {
                continue;
            }
            let w = stake_weight(token, &position.amount, ledger, config)?;
            let entry = weights.entry(staker.clone()).or_insert_with(Amount::zero);
            *entry = entry.checked_add(&w)?;
            total = total.checked_add(&w)?;
        }
    }
    Ok((weights, total))
}

/// Weighted pro-rata allocations for one emission. Zero allocations are
/// dropped; the sum never exceeds the emission.
pub fn compute_allocations(
    emission: &Amount,
    weights: &BTreeMap<StakerId, Amount>,
    total_weight: &Amount,
) -> Result<BTreeMap<StakerId, Amount>> {
    let mut allocations = BTreeMap::new();
    if total_weight.is_zero() {
        return Ok(allocations);
    }
    for (staker, weight) in weights {
        let alloc = math::proportional(emission, weight, total_weight)?;
        if !alloc.is_zero() {
            allocations.insert(staker.clone(), alloc);
        }
    }
    Ok(allocations)
}

/// Emission tick (`Request-Rewards`).
pub fn handle_request_rewards<P: PriceSource, I: IlPolicy>(
    ctx: &mut HandlerContext<'_, P, I>,
    from: &str,
) -> Result<Vec<Outbound>> {
    if from != ctx.config.cron_caller && from != ctx.config.owner.0 {
        return Err(EngineError::Unauthorized(from.to_owned()));
    }
    let next_allowed = ctx.ledger.last_reward_timestamp + ctx.config.min_distribution_interval_secs;
    if ctx.ledger.last_reward_timestamp > 0 && ctx.now < next_allowed {
        return Err(EngineError::DistributionTooSoon {
            wait_secs: next_allowed - ctx.now,
        });
    }

    let remaining = ctx
        .config
        .total_supply
        .saturating_sub(&ctx.ledger.current_rewards);
    if remaining.is_zero() {
        return Ok(vec![skip_reply(from, ctx.now, "supply-exhausted")]);
    }

    let mut emission = compute_emission(&remaining)?;
    if let Some(cap) = burn_rate_cap(&ctx.ledger.mint_token_supply)? {
        if emission > cap {
            debug!(%emission, %cap, "burn-rate cap engaged");
            emission = cap;
        }
    }

    let (weights, total_weight) = staker_weights(ctx.ledger, ctx.config)?;
    let allocations = compute_allocations(&emission, &weights, &total_weight)?;
    if emission.is_zero() || allocations.is_empty() {
        // An empty round consumes no supply; the interval still applies.
        ctx.ledger.last_reward_timestamp = ctx.now;
        return Ok(vec![skip_reply(from, ctx.now, "no-allocations")]);
    }

    let recipients = allocations.len();
    let payload = serde_json::to_string(&allocations)
        .map_err(|e| EngineError::Serialization(format!("allocation map: {e}")))?;

    ctx.ledger.current_rewards = ctx.ledger.current_rewards.checked_add(&emission)?;
    ctx.ledger.last_reward_timestamp = ctx.now;
    info!(%emission, recipients, "rewards distributed");

    Ok(vec![
        Outbound::new(ctx.config.treasury.clone(), "Distribute-Rewards")
            .tag("Total-Emission", emission.to_string())
            .tag("Timestamp", ctx.now.to_string())
            .data(payload),
        Outbound::new(from, "Distribution-Complete")
            .tag("Total-Emission", emission.to_string())
            .tag("Recipients", recipients.to_string())
            .tag("Timestamp", ctx.now.to_string()),
    ])
}

fn skip_reply(caller: &str, now: u64, reason: &str) -> Outbound {
    Outbound::new(caller, "Distribution-Skipped")
        .tag("Reason", reason)
        .tag("Timestamp", now.to_string())
}

/// MINT supply intake (`Update-MINT-Supply`), mint-policy only.
pub fn handle_update_mint_supply<P: PriceSource, I: IlPolicy>(
    ctx: &mut HandlerContext<'_, P, I>,
    from: &str,
    supply: Amount,
) -> Result<Vec<Outbound>> {
    if from != ctx.config.mint_policy {
        return Err(EngineError::Unauthorized(from.to_owned()));
    }
    ctx.ledger.mint_token_supply = supply;
    debug!(%supply, "mint supply updated");
    Ok(vec![])
}

/// `Get-Reward-Stats`: totals plus the projected daily emission.
pub fn handle_get_reward_stats(
    ledger: &Ledger,
    config: &EngineConfig,
    from: &str,
) -> Result<Vec<Outbound>> {
    let remaining = config.total_supply.saturating_sub(&ledger.current_rewards);
    let projected_daily = remaining
        .mul_div(
            &Amount::from_u64(math::PERIOD_RATE_SCALED),
            &Amount::from_u64(math::FIXED_POINT_SCALE),
        )?
        .mul_u64(math::PERIODS_PER_DAY)?;
    let stats = json!({
        "total_distributed": ledger.current_rewards,
        "remaining": remaining,
        "projected_daily_emission": projected_daily,
        "mint_token_supply": ledger.mint_token_supply,
        "last_distribution": ledger.last_reward_timestamp,
    });
    Ok(vec![Outbound::new(from, "Reward-Stats").data(stats.to_string())])
}

/// `Get-Stake-Ownership`: a staker's share of the total weight, formatted
/// to six decimals.
pub fn handle_get_stake_ownership(
    ledger: &Ledger,
    config: &EngineConfig,
    from: &str,
    staker: &StakerId,
) -> Result<Vec<Outbound>> {
    let (weights, total) = staker_weights(ledger, config)?;
    let ownership = match weights.get(staker) {
        Some(weight) if !total.is_zero() => math::format_ratio_6dp(weight, &total)?,
        _ => "0.000000".to_owned(),
    };
    Ok(vec![Outbound::new(from, "Stake-Ownership")
        .tag("Staker", staker.0.clone())
        .tag("Ownership", ownership)])
}

/// `Get-Unique-Stakers`: count of distinct stakers over all tokens.
pub fn handle_get_unique_stakers(ledger: &Ledger, from: &str) -> Vec<Outbound> {
    let mut stakers: Vec<&StakerId> = ledger
        .staking_positions()
        .values()
        .flat_map(|bucket| bucket.keys())
        .collect();
    stakers.sort();
    stakers.dedup();
    vec![Outbound::new(from, "Unique-Stakers").tag("Count", stakers.len().to_string())]
}

/// `Get-Token-Stakes`: per-token staker count and total staked.
pub fn handle_get_token_stakes(ledger: &Ledger, from: &str) -> Result<Vec<Outbound>> {
    let mut per_token = BTreeMap::new();
    for (token, bucket) in ledger.staking_positions() {
        let mut total = Amount::zero();
        for position in bucket.values() {
            total = total.checked_add(&position.amount)?;
        }
        per_token.insert(
            token.clone(),
            json!({ "stakers": bucket.len(), "total_staked": total }),
        );
    }
    let payload = serde_json::to_string(&per_token)
        .map_err(|e| EngineError::Serialization(format!("token stakes: {e}")))?;
    Ok(vec![Outbound::new(from, "Token-Stakes").data(payload)])
}
