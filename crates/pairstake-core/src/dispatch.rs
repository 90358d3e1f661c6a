//! Message dispatcher.
//!
//! The host runtime delivers one message at a time; each handler runs to
//! completion, commits its ledger effects in program order, and returns the
//! outbound messages to queue. There is no shared state across invocations
//! other than the ledger. A handler either fully commits or returns an
//! error with nothing mutated and nothing queued.

use tracing::{instrument, warn};

use crate::emission;
use crate::ledger::Ledger;
use crate::stake;
use crate::unstake;
use crate::wire::{Inbound, Outbound, TagBag};
use crate::{EngineConfig, EngineError, IlPolicy, PriceSource, Result, StakerId, TokenId};

/// Borrowed collaborators for one message.
///
/// The ledger borrow lasts exactly one dispatch; handlers must not retain
/// snapshots across messages.
pub struct HandlerContext<'a, P, I> {
    pub ledger: &'a mut Ledger,
    pub config: &'a EngineConfig,
    pub price_source: &'a P,
    pub il_policy: &'a I,
    /// Delivery time of the current message, Unix seconds.
    pub now: u64,
}

/// Parse and dispatch one raw message.
#[instrument(name = "dispatch", skip_all, fields(action = %bag.action, from = %bag.from))]
pub fn dispatch<P: PriceSource, I: IlPolicy>(
    ctx: &mut HandlerContext<'_, P, I>,
    bag: &TagBag,
) -> Result<Vec<Outbound>> {
    let inbound = Inbound::parse(bag)?;
    dispatch_parsed(ctx, inbound).inspect_err(|e| {
        warn!(error = %e, "handler rejected message");
    })
}

/// Dispatch an already-parsed message.
pub fn dispatch_parsed<P: PriceSource, I: IlPolicy>(
    ctx: &mut HandlerContext<'_, P, I>,
    inbound: Inbound,
) -> Result<Vec<Outbound>> {
    match inbound {
        Inbound::CreditNotice {
            token,
            sender,
            quantity,
        } => stake::handle_credit_notice(ctx, token, sender, quantity),
        Inbound::MintConfirmation {
            operation_id,
            amount,
            from,
        } => stake::handle_mint_confirmation(ctx, operation_id, amount, &from),
        Inbound::MintError { operation_id, from } => {
            stake::handle_mint_error(ctx, operation_id, &from)
        }
        Inbound::LiquidityAdded {
            operation_id,
            pool_tokens,
            from,
        } => stake::handle_liquidity_added(ctx, operation_id, pool_tokens, &from),
        Inbound::LiquidityError { operation_id, from } => {
            stake::handle_liquidity_error(ctx, operation_id, &from)
        }
        Inbound::Unstake { token, staker } => unstake::handle_unstake(ctx, token, staker),
        Inbound::BurnConfirmation {
            operation_id,
            token_a,
            token_b,
            withdrawn_a,
            withdrawn_b,
            burned_pool_tokens,
            from,
        } => unstake::handle_burn_confirmation(
            ctx,
            operation_id,
            token_a,
            token_b,
            withdrawn_a,
            withdrawn_b,
            burned_pool_tokens,
            &from,
        ),
        Inbound::BurnError { operation_id, from } => {
            unstake::handle_burn_error(ctx, operation_id, &from)
        }
        Inbound::RequestRewards { from } => emission::handle_request_rewards(ctx, &from),
        Inbound::UpdateMintSupply { from, supply } => {
            emission::handle_update_mint_supply(ctx, &from, supply)
        }
        Inbound::GetRewardStats { from } => {
            emission::handle_get_reward_stats(ctx.ledger, ctx.config, &from)
        }
        Inbound::GetStakeOwnership { from, staker } => {
            emission::handle_get_stake_ownership(ctx.ledger, ctx.config, &from, &staker)
        }
        Inbound::GetUniqueStakers { from } => {
            Ok(emission::handle_get_unique_stakers(ctx.ledger, &from))
        }
        Inbound::GetTokenStakes { from } => emission::handle_get_token_stakes(ctx.ledger, &from),
        Inbound::GetStakingPosition {
            from,
            token,
            staker,
        } => handle_get_staking_position(ctx.ledger, &from, &token, &staker),
        Inbound::GetPendingOperations { from } => handle_get_pending_operations(ctx, &from),
        Inbound::Cleanup { from } => handle_cleanup(ctx, &from),
        Inbound::Pause { from } => handle_set_paused(ctx, &from, true),
        Inbound::Unpause { from } => handle_set_paused(ctx, &from, false),
    }
}

fn require_operator<P, I>(ctx: &HandlerContext<'_, P, I>, from: &str) -> Result<()> {
    if from != ctx.config.owner.0 && from != ctx.config.cron_caller {
        return Err(EngineError::Unauthorized(from.to_owned()));
    }
    Ok(())
}

/// Stale-operation reaper (`Cleanup`), operator only.
fn handle_cleanup<P, I>(ctx: &mut HandlerContext<'_, P, I>, from: &str) -> Result<Vec<Outbound>> {
    require_operator(ctx, from)?;
    let removed = ctx
        .ledger
        .clean_stale_operations(ctx.now, ctx.config.operation_timeout_secs);
    Ok(vec![Outbound::new(from, "Cleanup-Complete")
        .tag("Operations-Removed", removed.to_string())
        .tag("Timestamp", ctx.now.to_string())])
}

/// Pause switch, owner only.
fn handle_set_paused<P, I>(
    ctx: &mut HandlerContext<'_, P, I>,
    from: &str,
    paused: bool,
) -> Result<Vec<Outbound>> {
    if from != ctx.config.owner.0 {
        return Err(EngineError::Unauthorized(from.to_owned()));
    }
    ctx.ledger.paused = paused;
    let action = if paused { "Paused" } else { "Unpaused" };
    Ok(vec![
        Outbound::new(from, action).tag("Timestamp", ctx.now.to_string())
    ])
}

/// Read-only position view.
fn handle_get_staking_position(
    ledger: &Ledger,
    from: &str,
    token: &TokenId,
    staker: &StakerId,
) -> Result<Vec<Outbound>> {
    let payload = match ledger.staking_position(token, staker) {
        Some(position) => serde_json::to_string(position)
            .map_err(|e| EngineError::Serialization(format!("position: {e}")))?,
        None => "null".to_owned(),
    };
    Ok(vec![Outbound::new(from, "Staking-Position")
        .tag("Token", token.0.clone())
        .tag("Staker", staker.0.clone())
        .data(payload)])
}

/// Read-only registry view, operator only.
fn handle_get_pending_operations<P, I>(
    ctx: &HandlerContext<'_, P, I>,
    from: &str,
) -> Result<Vec<Outbound>> {
    require_operator(ctx, from)?;
    let ops: Vec<_> = ctx.ledger.pending_operations().values().collect();
    let payload = serde_json::to_string(&ops)
        .map_err(|e| EngineError::Serialization(format!("operation list: {e}")))?;
    Ok(vec![Outbound::new(from, "Pending-Operations")
        .tag("Count", ops.len().to_string())
        .data(payload)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{OpKind, StakingPosition};
    use crate::{Amount, FixedPriceSource, ShortfallIlPolicy};

    fn config() -> EngineConfig {
        EngineConfig::builder()
            .owner("owner")
            .cron_caller("cron")
            .allowed_token("token-a", "amm-a")
            .mint_token("mint")
            .mint_policy("mint-policy")
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
                prices: FixedPriceSource::new().with_price(
                    TokenId::from("token-a"),
                    Amount::from_u64(1),
                    Amount::from_u64(1),
                ),
                il: ShortfallIlPolicy,
            }
        }

        fn dispatch(&mut self, now: u64, bag: &TagBag) -> Result<Vec<Outbound>> {
            let mut ctx = HandlerContext {
                ledger: &mut self.ledger,
                config: &self.config,
                price_source: &self.prices,
                il_policy: &self.il,
                now,
            };
            dispatch(&mut ctx, bag)
        }
    }

    #[test]
    fn malformed_message_rejected_before_any_handler() {
        let mut fx = Fixture::new();
        let bag = TagBag::new("Credit-Notice", "token-a", 1);
        assert!(matches!(
            fx.dispatch(1, &bag),
            Err(EngineError::MalformedMessage(_))
        ));
        assert_eq!(fx.ledger.count_pending_operations(), 0);
    }

    #[test]
    fn credit_notice_routes_to_stake_orchestrator() {
        let mut fx = Fixture::new();
        let bag = TagBag::new("Credit-Notice", "token-a", 1)
            .tag("Sender", "staker-1")
            .tag("Quantity", "1000");
        let out = fx.dispatch(1, &bag).expect("dispatch");
        assert_eq!(out[0].action, "Mint-Request");
        assert!(fx.ledger.has_pending(
            OpKind::Stake,
            &TokenId::from("token-a"),
            &StakerId::from("staker-1")
        ));
    }

    #[test]
    fn cleanup_requires_operator_and_reports_count() {
        let mut fx = Fixture::new();
        let bag = TagBag::new("Cleanup", "stranger", 10);
        assert!(matches!(
            fx.dispatch(10, &bag),
            Err(EngineError::Unauthorized(_))
        ));

        let bag = TagBag::new("Cleanup", "owner", 10);
        let out = fx.dispatch(10, &bag).expect("cleanup");
        assert_eq!(out[0].action, "Cleanup-Complete");
        assert_eq!(
            out[0].tags.get("Operations-Removed").map(String::as_str),
            Some("0")
        );
    }

    #[test]
    fn pause_gates_deposits_until_unpause() {
        let mut fx = Fixture::new();
        fx.dispatch(1, &TagBag::new("Pause", "owner", 1)).expect("pause");

        let deposit = TagBag::new("Credit-Notice", "token-a", 2)
            .tag("Sender", "staker-1")
            .tag("Quantity", "1000");
        assert!(matches!(fx.dispatch(2, &deposit), Err(EngineError::Paused)));

        fx.dispatch(3, &TagBag::new("Unpause", "owner", 3)).expect("unpause");
        assert!(fx.dispatch(4, &deposit).is_ok());
    }

    #[test]
    fn pause_requires_owner_not_cron() {
        let mut fx = Fixture::new();
        assert!(matches!(
            fx.dispatch(1, &TagBag::new("Pause", "cron", 1)),
            Err(EngineError::Unauthorized(_))
        ));
    }

    #[test]
    fn position_view_returns_null_for_missing_and_json_for_present() {
        let mut fx = Fixture::new();
        let query = TagBag::new("Get-Staking-Position", "anyone", 1)
            .tag("Token", "token-a")
            .tag("Staker", "staker-1");

        let out = fx.dispatch(1, &query).expect("view");
        assert_eq!(out[0].data.as_deref(), Some("null"));

        fx.ledger
            .set_staking_position(
                TokenId::from("token-a"),
                StakerId::from("staker-1"),
                StakingPosition {
                    amount: Amount::from_u64(5),
                    lp_tokens: Amount::from_u64(1),
                    mint_amount: Amount::from_u64(2),
                    staked_at: 9,
                },
            )
            .expect("seed");
        let out = fx.dispatch(2, &query).expect("view");
        let position: serde_json::Value =
            serde_json::from_str(out[0].data.as_deref().expect("data")).expect("json");
        assert_eq!(position["amount"], "5");
        assert_eq!(position["staked_at"], 9);
    }

    #[test]
    fn pending_operations_view_is_operator_only() {
        let mut fx = Fixture::new();
        assert!(matches!(
            fx.dispatch(1, &TagBag::new("Get-Pending-Operations", "anyone", 1)),
            Err(EngineError::Unauthorized(_))
        ));
        let out = fx
            .dispatch(1, &TagBag::new("Get-Pending-Operations", "cron", 1))
            .expect("view");
        assert_eq!(out[0].tags.get("Count").map(String::as_str), Some("0"));
    }
}
