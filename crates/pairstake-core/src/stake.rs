//! Stake orchestrator.
//!
//! Four-phase state machine keyed by operation id:
//!
//! 1. `Credit-Notice` lands a deposit, computes the buffered MINT
//!    counterpart from the latest AMM price, registers a pending stake
//!    operation, and requests the mint.
//! 2. `Mint-Confirmation` records the minted amount and asks the AMM to
//!    add liquidity with both legs.
//! 3. `Liquidity-Added` finalizes the position with its cost basis and
//!    completes the operation.
//! 4. `Mint-Error` / `Liquidity-Error` fail the operation and refund every
//!    amount still custodied by the contract.
//!
//! Because a staker may hold at most one pending stake per token, phases
//! 2 and 3 for that pair arrive strictly after phase 1.

use tracing::{info, warn};

use crate::dispatch::HandlerContext;
use crate::ledger::{OpKind, OpStatus, StakingPosition};
use crate::wire::Outbound;
use crate::{
    Amount, EngineConfig, EngineError, IlPolicy, OperationId, Price, PriceSource, Result, StakerId,
    TokenId,
};

/// Counterpart MINT for a deposit: the AMM quote scaled by the excess
/// buffer so the add-liquidity step cannot come up short, floored at one.
pub fn counterpart_mint_amount(
    quantity: &Amount,
    price: &Price,
    config: &EngineConfig,
) -> Result<Amount> {
    let quote = quantity.mul_div(&price.numerator, &price.denominator)?;
    let buffered = quote.mul_div(
        &Amount::from_u64(config.excess_multiplier),
        &Amount::from_u64(config.excess_divisor),
    )?;
    if buffered.is_zero() {
        Ok(Amount::one())
    } else {
        Ok(buffered)
    }
}

/// Phase 1: deposit received.
pub fn handle_credit_notice<P: PriceSource, I: IlPolicy>(
    ctx: &mut HandlerContext<'_, P, I>,
    token: TokenId,
    sender: StakerId,
    quantity: Amount,
) -> Result<Vec<Outbound>> {
    if ctx.ledger.paused {
        return Err(EngineError::Paused);
    }
    if !ctx.config.is_allowed(&token) {
        return Err(EngineError::TokenNotAllowed(token));
    }
    if quantity.is_zero() {
        return Err(EngineError::InvalidAmount("zero deposit".into()));
    }
    if ctx.ledger.has_pending(OpKind::Stake, &token, &sender) {
        return Err(EngineError::DuplicatePending {
            kind: OpKind::Stake,
            token,
            staker: sender,
        });
    }

    let amm = ctx
        .config
        .amm_for(&token)
        .cloned()
        .ok_or_else(|| EngineError::TokenNotAllowed(token.clone()))?;

    // All fallible reads happen before the ledger is touched, so an error
    // leaves no partial state behind.
    let price = ctx.price_source.latest_price(&token)?;
    let mint_amount = counterpart_mint_amount(&quantity, &price, ctx.config)?;

    let op = ctx.ledger.create_stake_operation(
        token.clone(),
        sender.clone(),
        quantity,
        amm,
        ctx.now,
    )?;
    info!(operation = %op.id, %token, staker = %sender, amount = %quantity, "stake started");

    Ok(vec![
        Outbound::new(ctx.config.mint_policy.clone(), "Mint-Request")
            .tag("Quantity", mint_amount.to_string())
            .tag("X-Operation-Id", op.id.0.clone()),
        Outbound::new(sender.0, "Stake-Started")
            .tag("Token", token.0)
            .tag("Amount", quantity.to_string())
            .tag("X-Operation-Id", op.id.0),
    ])
}

/// Phase 2: mint confirmed; request liquidity provision.
pub fn handle_mint_confirmation<P: PriceSource, I: IlPolicy>(
    ctx: &mut HandlerContext<'_, P, I>,
    operation_id: OperationId,
    amount: Amount,
    from: &str,
) -> Result<Vec<Outbound>> {
    if from != ctx.config.mint_policy {
        return Err(EngineError::Unauthorized(from.to_owned()));
    }
    let op = ctx
        .ledger
        .verify_operation(&operation_id, OpKind::Stake, OpStatus::Pending)?
        .clone();

    ctx.ledger.set_operation_mint_amount(&operation_id, amount)?;
    info!(operation = %operation_id, minted = %amount, "counterpart minted");

    Ok(vec![Outbound::new(op.amm.0, "Add-Liquidity")
        .tag("Token-A", op.token.0)
        .tag("Quantity-A", op.amount.to_string())
        .tag("Token-B", ctx.config.mint_token.0.clone())
        .tag("Quantity-B", amount.to_string())
        .tag("X-Operation-Id", operation_id.0)])
}

/// Phase 3: liquidity added; finalize the position.
pub fn handle_liquidity_added<P: PriceSource, I: IlPolicy>(
    ctx: &mut HandlerContext<'_, P, I>,
    operation_id: OperationId,
    pool_tokens: Amount,
    from: &str,
) -> Result<Vec<Outbound>> {
    let op = ctx
        .ledger
        .verify_operation(&operation_id, OpKind::Stake, OpStatus::Pending)?
        .clone();
    ctx.ledger.verify_operation_amm(&op, from)?;

    ctx.ledger.set_operation_lp_tokens(&operation_id, pool_tokens)?;
    ctx.ledger.set_staking_position(
        op.token.clone(),
        op.sender.clone(),
        StakingPosition {
            amount: op.amount,
            lp_tokens: pool_tokens,
            mint_amount: op.mint_amount,
            staked_at: ctx.now,
        },
    )?;
    ctx.ledger.complete_operation(&operation_id)?;
    info!(operation = %operation_id, lp_tokens = %pool_tokens, "stake finalized");

    Ok(vec![Outbound::new(op.sender.0, "Stake-Complete")
        .tag("Token", op.token.0)
        .tag("Amount", op.amount.to_string())
        .tag("Pool-Tokens", pool_tokens.to_string())
        .tag("Mint-Amount", op.mint_amount.to_string())
        .tag("X-Operation-Id", operation_id.0)])
}

/// Phase 4a: the mint was rejected. Nothing beyond the deposit is
/// custodied yet, so refund just that.
pub fn handle_mint_error<P: PriceSource, I: IlPolicy>(
    ctx: &mut HandlerContext<'_, P, I>,
    operation_id: OperationId,
    from: &str,
) -> Result<Vec<Outbound>> {
    if from != ctx.config.mint_policy {
        return Err(EngineError::Unauthorized(from.to_owned()));
    }
    let op = ctx
        .ledger
        .verify_operation(&operation_id, OpKind::Stake, OpStatus::Pending)?
        .clone();
    ctx.ledger.fail_operation(&operation_id)?;
    warn!(operation = %operation_id, "mint failed, refunding deposit");

    Ok(vec![
        Outbound::transfer(&op.token, &op.sender, &op.amount)
            .tag("X-Operation-Id", operation_id.0.clone())
            .tag("X-Refund", "stake-mint-failed"),
        stake_failed_notice(&op.sender, &op.token, &op.amount, &operation_id),
    ])
}

/// Phase 4b: liquidity provision was rejected. The deposit and the minted
/// counterpart are both custodied; refund the deposit and hand the MINT
/// back to the mint policy.
pub fn handle_liquidity_error<P: PriceSource, I: IlPolicy>(
    ctx: &mut HandlerContext<'_, P, I>,
    operation_id: OperationId,
    from: &str,
) -> Result<Vec<Outbound>> {
    let op = ctx
        .ledger
        .verify_operation(&operation_id, OpKind::Stake, OpStatus::Pending)?
        .clone();
    ctx.ledger.verify_operation_amm(&op, from)?;
    ctx.ledger.fail_operation(&operation_id)?;
    warn!(operation = %operation_id, "liquidity provision failed, unwinding");

    let mut out = vec![Outbound::transfer(&op.token, &op.sender, &op.amount)
        .tag("X-Operation-Id", operation_id.0.clone())
        .tag("X-Refund", "stake-liquidity-failed")];
    if !op.mint_amount.is_zero() {
        out.push(
            Outbound::new(ctx.config.mint_token.0.clone(), "Transfer")
                .tag("Recipient", ctx.config.mint_policy.clone())
                .tag("Quantity", op.mint_amount.to_string())
                .tag("X-Operation-Id", operation_id.0.clone())
                .tag("X-Burn-Back", "stake-liquidity-failed"),
        );
    }
    out.push(stake_failed_notice(
        &op.sender,
        &op.token,
        &op.amount,
        &operation_id,
    ));
    Ok(out)
}

fn stake_failed_notice(
    staker: &StakerId,
    token: &TokenId,
    amount: &Amount,
    operation_id: &OperationId,
) -> Outbound {
    Outbound::new(staker.0.clone(), "Stake-Failed")
        .tag("Token", token.0.clone())
        .tag("Amount", amount.to_string())
        .tag("X-Operation-Id", operation_id.0.clone())
}
