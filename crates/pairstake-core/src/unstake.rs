//! Unstake orchestrator and settlement.
//!
//! Two-phase state machine. Phase 1 snapshots the position, clears it
//! before any outbound message leaves (checks-effects-interactions), and
//! asks the AMM to burn the LP tokens. Phase 2 consumes the burn
//! confirmation and settles: impermanent-loss compensation, user-token
//! profit share, and the MINT profit share against a rebase-adjusted cost
//! basis. The operation is completed before the outbound transfers are
//! queued.

use tracing::{info, warn};

use crate::dispatch::HandlerContext;
use crate::ledger::{OpKind, OpStatus, PendingOperation, StakingPosition};
use crate::math;
use crate::wire::Outbound;
use crate::{Amount, EngineConfig, EngineError, IlPolicy, OperationId, PriceSource, Result, StakerId, TokenId};

/// Settlement amounts for one unstake, kept together for auditability.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settlement {
    /// Impermanent-loss compensation in the user token (reserve-funded).
    pub il_compensation: Amount,
    /// Realized user-token profit over the cost basis.
    pub user_profit: Amount,
    /// Protocol fee withheld from the user-token profit.
    pub user_fee: Amount,
    /// User-token amount sent back to the staker.
    pub amount_to_user: Amount,
    /// MINT profit over the rebased cost basis.
    pub mint_profit: Amount,
    /// Protocol fee withheld from the MINT profit.
    pub mint_fee: Amount,
    /// MINT profit share sent to the staker.
    pub mint_user_share: Amount,
}

/// Pure settlement computation over the withdrawn amounts.
///
/// Every step is an integer operation; divisions floor, so a small profit
/// can round its fee down to zero.
pub fn settle(
    op: &PendingOperation,
    withdrawn_user: &Amount,
    withdrawn_mint: &Amount,
    il_compensation: Amount,
    now: u64,
    config: &EngineConfig,
) -> Result<Settlement> {
    let mut settlement = Settlement {
        il_compensation,
        ..Settlement::default()
    };

    // User-token profit share.
    if withdrawn_user <= &op.amount {
        settlement.amount_to_user = *withdrawn_user;
    } else {
        let profit = withdrawn_user.checked_sub(&op.amount)?;
        let (fee, share) = math::fee_split(
            &profit,
            config.protocol_fee_percentage,
            config.fee_divisor,
        )?;
        settlement.user_profit = share;
        settlement.user_fee = fee;
        settlement.amount_to_user = withdrawn_user.checked_sub(&fee)?;
    }

    // MINT profit share against the rebase-adjusted basis.
    if !op.mint_amount.is_zero() && !withdrawn_mint.is_zero() {
        let weeks = math::weeks_elapsed(now, op.staked_at);
        let rebased = math::rebased_basis(&op.mint_amount, weeks)?;
        if withdrawn_mint >= &rebased {
            let profit = withdrawn_mint.checked_sub(&rebased)?;
            let (fee, share) = math::fee_split(
                &profit,
                config.protocol_fee_percentage,
                config.fee_divisor,
            )?;
            settlement.mint_profit = profit;
            settlement.mint_fee = fee;
            settlement.mint_user_share = share;
        }
    }

    Ok(settlement)
}

/// Phase 1: unstake requested.
pub fn handle_unstake<P: PriceSource, I: IlPolicy>(
    ctx: &mut HandlerContext<'_, P, I>,
    token: TokenId,
    staker: StakerId,
) -> Result<Vec<Outbound>> {
    if ctx.ledger.paused {
        return Err(EngineError::Paused);
    }
    if !ctx.config.is_allowed(&token) {
        return Err(EngineError::TokenNotAllowed(token));
    }
    let snapshot: StakingPosition = ctx
        .ledger
        .staking_position(&token, &staker)
        .cloned()
        .ok_or_else(|| EngineError::NoPosition {
            token: token.clone(),
            staker: staker.clone(),
        })?;
    if ctx.ledger.has_pending(OpKind::Unstake, &token, &staker) {
        return Err(EngineError::DuplicatePending {
            kind: OpKind::Unstake,
            token,
            staker,
        });
    }
    let amm = ctx
        .config
        .amm_for(&token)
        .cloned()
        .ok_or_else(|| EngineError::TokenNotAllowed(token.clone()))?;

    // Checks-Effects-Interactions: the position is cleared before the burn
    // message leaves, so a re-entrant unstake finds nothing to unwind.
    ctx.ledger.clear_staking_position(&token, &staker);
    let op = ctx.ledger.create_unstake_operation(
        token.clone(),
        staker.clone(),
        &snapshot,
        amm.clone(),
        ctx.now,
    )?;
    info!(operation = %op.id, %token, staker = %staker, "unstake started");

    Ok(vec![
        Outbound::new(amm.0, "Burn")
            .tag("Quantity", snapshot.lp_tokens.to_string())
            .tag("X-Operation-Id", op.id.0.clone()),
        Outbound::new(staker.0, "Unstake-Started")
            .tag("Token", token.0)
            .tag("Amount", snapshot.amount.to_string())
            .tag("X-Operation-Id", op.id.0),
    ])
}

/// Phase 2: burn confirmed; settle and pay out.
#[allow(clippy::too_many_arguments)]
pub fn handle_burn_confirmation<P: PriceSource, I: IlPolicy>(
    ctx: &mut HandlerContext<'_, P, I>,
    operation_id: OperationId,
    token_a: TokenId,
    token_b: TokenId,
    withdrawn_a: Amount,
    withdrawn_b: Amount,
    burned_pool_tokens: Amount,
    from: &str,
) -> Result<Vec<Outbound>> {
    if ctx.ledger.paused {
        return Err(EngineError::Paused);
    }
    let op = ctx
        .ledger
        .verify_operation(&operation_id, OpKind::Unstake, OpStatus::Pending)?
        .clone();
    ctx.ledger.verify_operation_amm(&op, from)?;

    // The user token is whichever confirmation leg is not MINT.
    let (user_token, withdrawn_user, withdrawn_mint) = if ctx.config.is_mint_token(&token_a) {
        (token_b, withdrawn_b, withdrawn_a)
    } else if ctx.config.is_mint_token(&token_b) {
        (token_a, withdrawn_a, withdrawn_b)
    } else {
        return Err(EngineError::MalformedMessage(
            "burn confirmation names no MINT leg".into(),
        ));
    };
    if user_token != op.token {
        return Err(EngineError::MalformedMessage(format!(
            "burn confirmation user token {user_token} does not match operation token {}",
            op.token
        )));
    }

    let il_compensation = ctx
        .il_policy
        .compensation(&op, &withdrawn_user, &withdrawn_mint)?;
    let settlement = settle(
        &op,
        &withdrawn_user,
        &withdrawn_mint,
        il_compensation,
        ctx.now,
        ctx.config,
    )?;

    // Effects before interactions: the operation flips to completed before
    // any transfer is queued, so a replayed confirmation settles nothing.
    ctx.ledger.complete_operation(&operation_id)?;
    info!(
        operation = %operation_id,
        to_user = %settlement.amount_to_user,
        il = %settlement.il_compensation,
        mint_share = %settlement.mint_user_share,
        "unstake settled"
    );

    let mut out = vec![Outbound::transfer(&op.token, &op.sender, &settlement.amount_to_user)
        .tag("X-Operation-Id", operation_id.0.clone())
        .tag("X-Unstake-Payout", "base")];
    if !settlement.il_compensation.is_zero() {
        out.push(
            Outbound::transfer(&op.token, &op.sender, &settlement.il_compensation)
                .tag("X-Operation-Id", operation_id.0.clone())
                .tag("X-IL-Compensation", "reserve"),
        );
    }
    if !settlement.mint_user_share.is_zero() {
        out.push(
            Outbound::new(ctx.config.mint_token.0.clone(), "Transfer")
                .tag("Recipient", op.sender.0.clone())
                .tag("Quantity", settlement.mint_user_share.to_string())
                .tag("X-Operation-Id", operation_id.0.clone())
                .tag("X-Profit-Share", "mint"),
        );
    }
    out.push(
        Outbound::new(op.sender.0, "Unstake-Complete")
            .tag("Token", op.token.0)
            .tag("Amount", settlement.amount_to_user.to_string())
            .tag("IL-Compensation", settlement.il_compensation.to_string())
            .tag("User-Profit", settlement.user_profit.to_string())
            .tag("Protocol-Fee", settlement.user_fee.to_string())
            .tag("Mint-Profit-Share", settlement.mint_user_share.to_string())
            .tag("Burned-Pool-Tokens", burned_pool_tokens.to_string())
            .tag("X-Operation-Id", operation_id.0),
    );
    Ok(out)
}

/// Burn rejected by the AMM: the LP tokens were not consumed, so the
/// cleared position is restored from the operation's cost-basis snapshot.
pub fn handle_burn_error<P: PriceSource, I: IlPolicy>(
    ctx: &mut HandlerContext<'_, P, I>,
    operation_id: OperationId,
    from: &str,
) -> Result<Vec<Outbound>> {
    let op = ctx
        .ledger
        .verify_operation(&operation_id, OpKind::Unstake, OpStatus::Pending)?
        .clone();
    ctx.ledger.verify_operation_amm(&op, from)?;
    ctx.ledger.fail_operation(&operation_id)?;

    ctx.ledger.set_staking_position(
        op.token.clone(),
        op.sender.clone(),
        StakingPosition {
            amount: op.amount,
            lp_tokens: op.lp_tokens.unwrap_or_else(Amount::zero),
            mint_amount: op.mint_amount,
            staked_at: op.staked_at,
        },
    )?;
    warn!(operation = %operation_id, "burn failed, position restored");

    Ok(vec![Outbound::new(op.sender.0, "Unstake-Failed")
        .tag("Token", op.token.0)
        .tag("Amount", op.amount.to_string())
        .tag("X-Operation-Id", operation_id.0)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::{AmmId, FixedPriceSource, ShortfallIlPolicy};

    fn config() -> EngineConfig {
        EngineConfig::builder()
            .allowed_token("token-a", "amm-a")
            .mint_token("mint")
            .protocol_fee(1, 100)
            .build()
            .expect("config")
    }

    struct Fixture {
        ledger: Ledger,
        config: EngineConfig,
        prices: FixedPriceSource,
        il: ShortfallIlPolicy,
    }

    impl Fixture {
        fn new() -> Self {
            let config = config();
            Self {
                ledger: Ledger::from_config(&config),
                config,
                prices: FixedPriceSource::new(),
                il: ShortfallIlPolicy,
            }
        }

        fn ctx(&mut self, now: u64) -> HandlerContext<'_, FixedPriceSource, ShortfallIlPolicy> {
            HandlerContext {
                ledger: &mut self.ledger,
                config: &self.config,
                price_source: &self.prices,
                il_policy: &self.il,
                now,
            }
        }

        fn seed_position(&mut self, amount: u64, lp: u64, mint: u64, staked_at: u64) {
            self.ledger
                .set_staking_position(
                    TokenId::from("token-a"),
                    StakerId::from("staker-1"),
                    StakingPosition {
                        amount: Amount::from_u64(amount),
                        lp_tokens: Amount::from_u64(lp),
                        mint_amount: Amount::from_u64(mint),
                        staked_at,
                    },
                )
                .expect("seed");
        }

        fn request_unstake(&mut self, now: u64) -> OperationId {
            let mut ctx = self.ctx(now);
            let out = handle_unstake(
                &mut ctx,
                TokenId::from("token-a"),
                StakerId::from("staker-1"),
            )
            .expect("unstake");
            assert_eq!(out[0].action, "Burn");
            OperationId::from(out[0].tags.get("X-Operation-Id").expect("op id").as_str())
        }
    }

    fn unstake_op(amount: u64, mint: u64, staked_at: u64) -> PendingOperation {
        PendingOperation {
            id: OperationId::from("op"),
            kind: OpKind::Unstake,
            token: TokenId::from("token-a"),
            sender: StakerId::from("staker-1"),
            amount: Amount::from_u64(amount),
            amm: AmmId::from("amm-a"),
            status: OpStatus::Pending,
            timestamp: staked_at,
            mint_amount: Amount::from_u64(mint),
            lp_tokens: Some(Amount::from_u64(50)),
            staked_at,
        }
    }

    #[test]
    fn settle_no_profit_no_il() {
        let op = unstake_op(100, 200, 1_000);
        let s = settle(
            &op,
            &Amount::from_u64(100),
            &Amount::from_u64(200),
            Amount::zero(),
            1_000 + 86_400,
            &config(),
        )
        .expect("settle");
        assert_eq!(s.amount_to_user, Amount::from_u64(100));
        assert!(s.user_profit.is_zero());
        assert!(s.user_fee.is_zero());
        // Under one week: rebased basis equals the initial, zero profit,
        // zero share.
        assert!(s.mint_profit.is_zero());
        assert!(s.mint_user_share.is_zero());
    }

    #[test]
    fn settle_small_user_profit_rounds_fee_to_zero() {
        let op = unstake_op(100, 200, 1_000);
        let s = settle(
            &op,
            &Amount::from_u64(110),
            &Amount::from_u64(200),
            Amount::zero(),
            2_000,
            &config(),
        )
        .expect("settle");
        // profit = 10, fee = 10 * 1 / 100 = 0 (floor), user keeps all 110.
        assert!(s.user_fee.is_zero());
        assert_eq!(s.user_profit, Amount::from_u64(10));
        assert_eq!(s.amount_to_user, Amount::from_u64(110));
    }

    #[test]
    fn settle_user_profit_with_real_fee() {
        let op = unstake_op(100_000, 0, 1_000);
        let s = settle(
            &op,
            &Amount::from_u64(101_000),
            &Amount::zero(),
            Amount::zero(),
            2_000,
            &config(),
        )
        .expect("settle");
        // profit = 1000, fee = 10, payout = 101000 - 10.
        assert_eq!(s.user_fee, Amount::from_u64(10));
        assert_eq!(s.user_profit, Amount::from_u64(990));
        assert_eq!(s.amount_to_user, Amount::from_u64(100_990));
    }

    #[test]
    fn settle_mint_share_after_two_week_rebase() {
        let staked_at = 1_000;
        let op = unstake_op(100, 10_000_000, staked_at);
        let s = settle(
            &op,
            &Amount::from_u64(100),
            &Amount::from_u64(10_000_000),
            Amount::zero(),
            staked_at + 2 * math::REBASE_PERIOD_SECS,
            &config(),
        )
        .expect("settle");
        // rebased basis = 10_000_000 * 99_500_625 / 10^8 = 9_950_062
        // profit = 49_938, fee = 499, share = 49_439
        assert_eq!(s.mint_profit, Amount::from_u64(49_938));
        assert_eq!(s.mint_fee, Amount::from_u64(499));
        assert_eq!(s.mint_user_share, Amount::from_u64(49_439));
    }

    #[test]
    fn settle_no_mint_share_below_rebased_basis() {
        let staked_at = 1_000;
        let op = unstake_op(100, 10_000_000, staked_at);
        let s = settle(
            &op,
            &Amount::from_u64(100),
            &Amount::from_u64(9_000_000),
            Amount::zero(),
            staked_at + 2 * math::REBASE_PERIOD_SECS,
            &config(),
        )
        .expect("settle");
        assert!(s.mint_profit.is_zero());
        assert!(s.mint_user_share.is_zero());
    }

    #[test]
    fn unstake_clears_position_before_burn() {
        let mut fx = Fixture::new();
        fx.seed_position(100, 50, 200, 1_000);
        fx.request_unstake(2_000);
        assert!(fx
            .ledger
            .staking_position(&TokenId::from("token-a"), &StakerId::from("staker-1"))
            .is_none());
    }

    #[test]
    fn unstake_without_position_rejected() {
        let mut fx = Fixture::new();
        let mut ctx = fx.ctx(1);
        let err = handle_unstake(
            &mut ctx,
            TokenId::from("token-a"),
            StakerId::from("staker-1"),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::NoPosition { .. }));
    }

    #[test]
    fn burn_confirmation_settles_and_completes() {
        let mut fx = Fixture::new();
        fx.seed_position(100, 50, 200, 1_000);
        let id = fx.request_unstake(2_000);

        let mut ctx = fx.ctx(3_000);
        let out = handle_burn_confirmation(
            &mut ctx,
            id.clone(),
            TokenId::from("token-a"),
            TokenId::from("mint"),
            Amount::from_u64(100),
            Amount::from_u64(200),
            Amount::from_u64(50),
            "amm-a",
        )
        .expect("burn confirmation");

        // No profit, no IL: one base payout plus the completion notice.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].action, "Transfer");
        assert_eq!(out[0].tags.get("Quantity").map(String::as_str), Some("100"));
        assert_eq!(out[1].action, "Unstake-Complete");
        assert_eq!(
            fx.ledger.pending_operation(&id).map(|o| o.status),
            Some(OpStatus::Completed)
        );
    }

    #[test]
    fn burn_confirmation_orders_mint_leg_first_too() {
        let mut fx = Fixture::new();
        fx.seed_position(100, 50, 200, 1_000);
        let id = fx.request_unstake(2_000);

        // Token-A is the MINT leg this time.
        let mut ctx = fx.ctx(3_000);
        let out = handle_burn_confirmation(
            &mut ctx,
            id,
            TokenId::from("mint"),
            TokenId::from("token-a"),
            Amount::from_u64(200),
            Amount::from_u64(100),
            Amount::from_u64(50),
            "amm-a",
        )
        .expect("burn confirmation");
        assert_eq!(out[0].tags.get("Quantity").map(String::as_str), Some("100"));
    }

    #[test]
    fn shortfall_pays_il_compensation() {
        let mut fx = Fixture::new();
        fx.seed_position(100, 50, 200, 1_000);
        let id = fx.request_unstake(2_000);

        let mut ctx = fx.ctx(3_000);
        let out = handle_burn_confirmation(
            &mut ctx,
            id,
            TokenId::from("token-a"),
            TokenId::from("mint"),
            Amount::from_u64(90),
            Amount::from_u64(200),
            Amount::from_u64(50),
            "amm-a",
        )
        .expect("burn confirmation");

        // Base payout 90, IL compensation 10, completion notice.
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].tags.get("Quantity").map(String::as_str), Some("90"));
        assert!(out[1].tags.contains_key("X-IL-Compensation"));
        assert_eq!(out[1].tags.get("Quantity").map(String::as_str), Some("10"));
    }

    #[test]
    fn replayed_burn_confirmation_rejected() {
        let mut fx = Fixture::new();
        fx.seed_position(100, 50, 200, 1_000);
        let id = fx.request_unstake(2_000);

        let confirm = |fx: &mut Fixture, id: &OperationId| {
            let mut ctx = fx.ctx(3_000);
            handle_burn_confirmation(
                &mut ctx,
                id.clone(),
                TokenId::from("token-a"),
                TokenId::from("mint"),
                Amount::from_u64(100),
                Amount::from_u64(200),
                Amount::from_u64(50),
                "amm-a",
            )
        };
        confirm(&mut fx, &id).expect("first confirmation");
        let err = confirm(&mut fx, &id).unwrap_err();
        assert!(matches!(err, EngineError::OperationStatusMismatch { .. }));
    }

    #[test]
    fn burn_confirmation_from_wrong_amm_rejected() {
        let mut fx = Fixture::new();
        fx.seed_position(100, 50, 200, 1_000);
        let id = fx.request_unstake(2_000);

        let mut ctx = fx.ctx(3_000);
        let err = handle_burn_confirmation(
            &mut ctx,
            id,
            TokenId::from("token-a"),
            TokenId::from("mint"),
            Amount::from_u64(100),
            Amount::from_u64(200),
            Amount::from_u64(50),
            "intruder",
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::AmmMismatch { .. }));
    }

    #[test]
    fn burn_error_restores_the_position() {
        let mut fx = Fixture::new();
        fx.seed_position(100, 50, 200, 1_000);
        let id = fx.request_unstake(2_000);

        let mut ctx = fx.ctx(3_000);
        let out = handle_burn_error(&mut ctx, id.clone(), "amm-a").expect("burn error");
        assert_eq!(out[0].action, "Unstake-Failed");

        let pos = fx
            .ledger
            .staking_position(&TokenId::from("token-a"), &StakerId::from("staker-1"))
            .expect("restored");
        assert_eq!(pos.amount, Amount::from_u64(100));
        assert_eq!(pos.lp_tokens, Amount::from_u64(50));
        assert_eq!(pos.mint_amount, Amount::from_u64(200));
        assert_eq!(pos.staked_at, 1_000);
        assert_eq!(
            fx.ledger.pending_operation(&id).map(|o| o.status),
            Some(OpStatus::Failed)
        );
    }
}
