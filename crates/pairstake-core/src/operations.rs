//! Pending-operation registry.
//!
//! Multi-step workflows persist here between the outbound request and the
//! inbound confirmation. `verify_operation` is the single gate used by all
//! confirmation handlers and fails loudly on any mismatch: unknown id,
//! wrong kind, wrong status, or a confirmation from the wrong AMM.

use tracing::{debug, info};

use crate::ledger::{Ledger, OpKind, OpStatus, PendingOperation, StakingPosition};
use crate::{Amount, AmmId, EngineError, OperationId, Result, StakerId, TokenId};

fn derive_operation_id(
    token: &TokenId,
    kind: OpKind,
    staker: &StakerId,
    now: u64,
    nonce: u64,
) -> OperationId {
    OperationId(format!("{token}-{kind}-{staker}-{now}-{nonce}"))
}

impl Ledger {
    /// Whether a pending operation already exists for this triple.
    pub fn has_pending(&self, kind: OpKind, token: &TokenId, staker: &StakerId) -> bool {
        self.pending_operations().values().any(|op| {
            op.status == OpStatus::Pending
                && op.kind == kind
                && op.token == *token
                && op.sender == *staker
        })
    }

    fn guard_duplicate(&self, kind: OpKind, token: &TokenId, staker: &StakerId) -> Result<()> {
        if self.has_pending(kind, token, staker) {
            return Err(EngineError::DuplicatePending {
                kind,
                token: token.clone(),
                staker: staker.clone(),
            });
        }
        Ok(())
    }

    /// Register a new stake operation. The MINT cost-basis field starts at
    /// zero and is filled when the mint confirmation lands.
    pub fn create_stake_operation(
        &mut self,
        token: TokenId,
        staker: StakerId,
        amount: Amount,
        amm: AmmId,
        now: u64,
    ) -> Result<PendingOperation> {
        self.guard_duplicate(OpKind::Stake, &token, &staker)?;
        let nonce = self.next_op_nonce();
        let id = derive_operation_id(&token, OpKind::Stake, &staker, now, nonce);
        let op = PendingOperation {
            id: id.clone(),
            kind: OpKind::Stake,
            token,
            sender: staker,
            amount,
            amm,
            status: OpStatus::Pending,
            timestamp: now,
            mint_amount: Amount::zero(),
            lp_tokens: None,
            staked_at: 0,
        };
        debug!(operation = %id, "stake operation registered");
        self.insert_operation(op.clone());
        Ok(op)
    }

    /// Register a new unstake operation, snapshotting the position's cost
    /// basis (the position itself is cleared by the caller before any
    /// outbound message leaves).
    pub fn create_unstake_operation(
        &mut self,
        token: TokenId,
        staker: StakerId,
        snapshot: &StakingPosition,
        amm: AmmId,
        now: u64,
    ) -> Result<PendingOperation> {
        self.guard_duplicate(OpKind::Unstake, &token, &staker)?;
        let nonce = self.next_op_nonce();
        let id = derive_operation_id(&token, OpKind::Unstake, &staker, now, nonce);
        let op = PendingOperation {
            id: id.clone(),
            kind: OpKind::Unstake,
            token,
            sender: staker,
            amount: snapshot.amount,
            amm,
            status: OpStatus::Pending,
            timestamp: now,
            mint_amount: snapshot.mint_amount,
            lp_tokens: Some(snapshot.lp_tokens),
            staked_at: snapshot.staked_at,
        };
        debug!(operation = %id, "unstake operation registered");
        self.insert_operation(op.clone());
        Ok(op)
    }

    /// Confirmation gate: the operation must exist, be of `kind`, and be in
    /// `expected_status`.
    pub fn verify_operation(
        &self,
        id: &OperationId,
        kind: OpKind,
        expected_status: OpStatus,
    ) -> Result<&PendingOperation> {
        let op = self
            .pending_operation(id)
            .ok_or_else(|| EngineError::UnknownOperation(id.clone()))?;
        if op.kind != kind {
            return Err(EngineError::OperationKindMismatch {
                id: id.clone(),
                expected: kind,
                actual: op.kind,
            });
        }
        if op.status != expected_status {
            return Err(EngineError::OperationStatusMismatch {
                id: id.clone(),
                expected: expected_status,
                actual: op.status,
            });
        }
        Ok(op)
    }

    /// Cross-check that a confirmation came from the operation's AMM.
    pub fn verify_operation_amm(&self, op: &PendingOperation, sender: &str) -> Result<()> {
        if op.amm.0 != sender {
            return Err(EngineError::AmmMismatch {
                id: op.id.clone(),
                expected: op.amm.clone(),
                actual: sender.to_owned(),
            });
        }
        Ok(())
    }

    /// Record the minted counterpart on a pending stake operation.
    pub fn set_operation_mint_amount(&mut self, id: &OperationId, amount: Amount) -> Result<()> {
        self.verify_operation(id, OpKind::Stake, OpStatus::Pending)?;
        let op = self
            .pending_operation_mut(id)
            .ok_or_else(|| EngineError::UnknownOperation(id.clone()))?;
        op.mint_amount = amount;
        Ok(())
    }

    /// Record the LP tokens returned by the AMM on a pending stake.
    pub fn set_operation_lp_tokens(&mut self, id: &OperationId, lp_tokens: Amount) -> Result<()> {
        self.verify_operation(id, OpKind::Stake, OpStatus::Pending)?;
        let op = self
            .pending_operation_mut(id)
            .ok_or_else(|| EngineError::UnknownOperation(id.clone()))?;
        op.lp_tokens = Some(lp_tokens);
        Ok(())
    }

    fn transition(&mut self, id: &OperationId, to: OpStatus) -> Result<()> {
        let op = self
            .pending_operation_mut(id)
            .ok_or_else(|| EngineError::UnknownOperation(id.clone()))?;
        if op.status != OpStatus::Pending {
            return Err(EngineError::OperationStatusMismatch {
                id: id.clone(),
                expected: OpStatus::Pending,
                actual: op.status,
            });
        }
        op.status = to;
        Ok(())
    }

    /// `pending -> completed`. Changes only the status.
    pub fn complete_operation(&mut self, id: &OperationId) -> Result<()> {
        self.transition(id, OpStatus::Completed)
    }

    /// `pending -> failed`. Changes only the status; the record stays for
    /// audit until the reaper removes it.
    pub fn fail_operation(&mut self, id: &OperationId) -> Result<()> {
        self.transition(id, OpStatus::Failed)
    }

    /// Remove every operation older than `timeout_secs`, whatever its
    /// status, and return the removed count.
    ///
    /// Reaping a stale stake that already consumed user funds is not an
    /// automatic refund: cleanup only frees registry slots, and funds
    /// recovery stays an operator action.
    pub fn clean_stale_operations(&mut self, now: u64, timeout_secs: u64) -> usize {
        let stale: Vec<OperationId> = self
            .pending_operations()
            .values()
            .filter(|op| now.saturating_sub(op.timestamp) > timeout_secs)
            .map(|op| op.id.clone())
            .collect();
        for id in &stale {
            self.remove_operation(id);
        }
        if !stale.is_empty() {
            info!(removed = stale.len(), "stale operations reaped");
        }
        stale.len()
    }
}
