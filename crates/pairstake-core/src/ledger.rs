//! Persistent engine state.
//!
//! The `Ledger` exclusively owns every mutable entity: the two-level
//! staking-position table, the pending-operation table, and the global
//! reward counters. Handlers borrow it for the duration of one message;
//! dispatch is serial, so mutation needs no locks. Maps are `BTreeMap` so
//! traversal order is deterministic wherever iteration feeds an outbound
//! message.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Amount, AmmId, EngineConfig, EngineError, OperationId, Result, StakerId, TokenId};

/// Kind of a multi-step operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Stake,
    Unstake,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Stake => f.write_str("stake"),
            OpKind::Unstake => f.write_str("unstake"),
        }
    }
}

/// Lifecycle status of a pending operation.
///
/// `pending -> completed` on success confirmation, `pending -> failed` on
/// an error confirmation or refund path. Terminal records persist until the
/// reaper removes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpStatus::Pending => f.write_str("pending"),
            OpStatus::Completed => f.write_str("completed"),
            OpStatus::Failed => f.write_str("failed"),
        }
    }
}

/// A finalized staking position.
///
/// `lp_tokens` and `mint_amount` are the cost basis captured at
/// finalization and never mutated afterwards. `staked_at` anchors the MINT
/// rebase computation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingPosition {
    pub amount: Amount,
    pub lp_tokens: Amount,
    pub mint_amount: Amount,
    pub staked_at: u64,
}

/// A persisted multi-step operation, the durable continuation between an
/// outbound request and its confirmation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: OperationId,
    pub kind: OpKind,
    pub token: TokenId,
    pub sender: StakerId,
    pub amount: Amount,
    pub amm: AmmId,
    pub status: OpStatus,
    /// Creation time in Unix seconds; staleness is measured from here.
    pub timestamp: u64,
    /// For stake: counterpart minted so far (zero until confirmed).
    /// For unstake: the position's MINT cost basis.
    pub mint_amount: Amount,
    /// For unstake: the position's LP cost basis. For stake: filled at
    /// liquidity confirmation.
    pub lp_tokens: Option<Amount>,
    /// For unstake: the position's finalization time, kept here because
    /// the position itself is cleared before the burn leaves.
    pub staked_at: u64,
}

/// All persisted state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Ledger {
    /// `token -> staker -> position`. An entry exists iff `amount > 0`.
    staking_positions: BTreeMap<TokenId, BTreeMap<StakerId, StakingPosition>>,

    /// `operation id -> operation`.
    pending_operations: BTreeMap<OperationId, PendingOperation>,

    /// Cumulative emitted rewards; never exceeds the configured supply cap.
    pub current_rewards: Amount,

    /// Unix seconds of the last emission tick.
    pub last_reward_timestamp: u64,

    /// Last externally reported MINT supply, for the burn-rate cap.
    pub mint_token_supply: Amount,

    /// Per-token emission weights.
    pub token_weights: BTreeMap<TokenId, u64>,

    /// Monotonic counter folded into operation ids.
    pub(crate) op_nonce: u64,

    /// Admin pause switch: deposit and unstake entry points reject while
    /// set; in-flight confirmations for stakes still land.
    pub paused: bool,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh ledger with weights seeded from configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            token_weights: config.token_weights.clone(),
            ..Self::default()
        }
    }

    // ---------------------------------------------------------------------
    // Staking positions
    // ---------------------------------------------------------------------

    pub fn staking_position(&self, token: &TokenId, staker: &StakerId) -> Option<&StakingPosition> {
        self.staking_positions.get(token)?.get(staker)
    }

    /// Replace a position atomically. Positions with zero amount may not
    /// exist; use [`Ledger::clear_staking_position`] to remove.
    pub fn set_staking_position(
        &mut self,
        token: TokenId,
        staker: StakerId,
        position: StakingPosition,
    ) -> Result<()> {
        if position.amount.is_zero() {
            return Err(EngineError::InvalidAmount(
                "refusing to store a zero-amount position".into(),
            ));
        }
        self.staking_positions
            .entry(token)
            .or_default()
            .insert(staker, position);
        Ok(())
    }

    /// Remove a position; prunes the token bucket when it empties.
    pub fn clear_staking_position(&mut self, token: &TokenId, staker: &StakerId) {
        if let Some(bucket) = self.staking_positions.get_mut(token) {
            bucket.remove(staker);
            if bucket.is_empty() {
                self.staking_positions.remove(token);
            }
        }
    }

    /// Point-in-time view over all positions. Handlers must not retain it
    /// across suspension points.
    pub fn staking_positions(&self) -> &BTreeMap<TokenId, BTreeMap<StakerId, StakingPosition>> {
        &self.staking_positions
    }

    // ---------------------------------------------------------------------
    // Pending operations (storage; lifecycle lives in operations.rs)
    // ---------------------------------------------------------------------

    pub fn pending_operation(&self, id: &OperationId) -> Option<&PendingOperation> {
        self.pending_operations.get(id)
    }

    pub(crate) fn pending_operation_mut(
        &mut self,
        id: &OperationId,
    ) -> Option<&mut PendingOperation> {
        self.pending_operations.get_mut(id)
    }

    pub(crate) fn insert_operation(&mut self, op: PendingOperation) {
        self.pending_operations.insert(op.id.clone(), op);
    }

    pub fn remove_operation(&mut self, id: &OperationId) -> Option<PendingOperation> {
        self.pending_operations.remove(id)
    }

    pub fn pending_operations(&self) -> &BTreeMap<OperationId, PendingOperation> {
        &self.pending_operations
    }

    pub fn count_pending_operations(&self) -> usize {
        self.pending_operations.len()
    }

    // ---------------------------------------------------------------------
    // Globals
    // ---------------------------------------------------------------------

    pub fn weight_for(&self, token: &TokenId) -> u64 {
        self.token_weights
            .get(token)
            .copied()
            .unwrap_or(crate::config::DEFAULT_TOKEN_WEIGHT)
    }

    pub(crate) fn next_op_nonce(&mut self) -> u64 {
        let nonce = self.op_nonce;
        self.op_nonce += 1;
        nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(amount: u64) -> StakingPosition {
        StakingPosition {
            amount: Amount::from_u64(amount),
            lp_tokens: Amount::from_u64(1),
            mint_amount: Amount::from_u64(2),
            staked_at: 1_700_000_000,
        }
    }

    #[test]
    fn set_get_clear_round_trip() {
        let mut ledger = Ledger::new();
        let token = TokenId::from("t");
        let staker = StakerId::from("s");

        ledger
            .set_staking_position(token.clone(), staker.clone(), position(100))
            .expect("set");
        assert_eq!(
            ledger.staking_position(&token, &staker).map(|p| p.amount),
            Some(Amount::from_u64(100))
        );

        ledger.clear_staking_position(&token, &staker);
        assert!(ledger.staking_position(&token, &staker).is_none());
        // The empty token bucket is pruned, not left behind.
        assert!(ledger.staking_positions().is_empty());
    }

    #[test]
    fn zero_amount_position_rejected() {
        let mut ledger = Ledger::new();
        let result = ledger.set_staking_position(
            TokenId::from("t"),
            StakerId::from("s"),
            position(0),
        );
        assert!(matches!(result, Err(EngineError::InvalidAmount(_))));
    }

    #[test]
    fn set_replaces_atomically() {
        let mut ledger = Ledger::new();
        let token = TokenId::from("t");
        let staker = StakerId::from("s");
        ledger
            .set_staking_position(token.clone(), staker.clone(), position(100))
            .unwrap();
        ledger
            .set_staking_position(token.clone(), staker.clone(), position(250))
            .unwrap();
        assert_eq!(
            ledger.staking_position(&token, &staker).map(|p| p.amount),
            Some(Amount::from_u64(250))
        );
    }

    #[test]
    fn op_nonce_is_monotonic() {
        let mut ledger = Ledger::new();
        assert_eq!(ledger.next_op_nonce(), 0);
        assert_eq!(ledger.next_op_nonce(), 1);
        assert_eq!(ledger.next_op_nonce(), 2);
    }

    #[test]
    fn weights_seed_from_config_with_default_fallback() {
        let config = EngineConfig::builder()
            .allowed_token("t", "amm")
            .token_weight("t", 400)
            .build()
            .unwrap();
        let ledger = Ledger::from_config(&config);
        assert_eq!(ledger.weight_for(&TokenId::from("t")), 400);
        assert_eq!(
            ledger.weight_for(&TokenId::from("unknown")),
            crate::config::DEFAULT_TOKEN_WEIGHT
        );
    }

    #[test]
    fn persisted_layout_serializes_amounts_as_strings() {
        let mut ledger = Ledger::new();
        ledger
            .set_staking_position(TokenId::from("t"), StakerId::from("s"), position(7))
            .unwrap();
        ledger.current_rewards = Amount::from_u64(99);

        let json = serde_json::to_value(&ledger).expect("serialize");
        assert_eq!(json["current_rewards"], "99");
        assert_eq!(json["staking_positions"]["t"]["s"]["amount"], "7");

        let back: Ledger = serde_json::from_value(json).expect("deserialize");
        assert_eq!(
            back.staking_position(&TokenId::from("t"), &StakerId::from("s")),
            ledger.staking_position(&TokenId::from("t"), &StakerId::from("s"))
        );
    }
}
