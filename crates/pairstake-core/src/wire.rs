//! Message envelope and typed inbound/outbound forms.
//!
//! Every message is a tag bag: a mandatory `Action` tag, sender identity,
//! a second-resolution timestamp, free-form tags, and an optional `Data`
//! payload (JSON when structured). Parsing is fail-closed: a missing or
//! malformed tag rejects the whole message before any handler runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Amount, EngineError, OperationId, Result, StakerId, TokenId};

/// Raw inbound message as delivered by the host runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagBag {
    /// The `Action` tag.
    pub action: String,

    /// Sender identity (`From`).
    pub from: String,

    /// Delivery time in Unix seconds.
    pub timestamp: u64,

    /// Remaining tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Optional payload.
    #[serde(default)]
    pub data: Option<String>,
}

impl TagBag {
    pub fn new(action: impl Into<String>, from: impl Into<String>, timestamp: u64) -> Self {
        Self {
            action: action.into(),
            from: from.into(),
            timestamp,
            tags: BTreeMap::new(),
            data: None,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    fn require(&self, key: &str) -> Result<&str> {
        self.tags
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| EngineError::MalformedMessage(format!("missing tag {key:?}")))
    }

    fn require_amount(&self, key: &str) -> Result<Amount> {
        Amount::parse_dec(self.require(key)?)
            .map_err(|e| EngineError::MalformedMessage(format!("bad amount in tag {key:?}: {e}")))
    }
}

/// Typed inbound message kinds.
///
/// One variant per handler; the dispatcher owns the single match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Deposit from a token contract: originates a stake.
    CreditNotice {
        token: TokenId,
        sender: StakerId,
        quantity: Amount,
    },
    /// Mint-policy confirmation of a counterpart mint.
    MintConfirmation {
        operation_id: OperationId,
        amount: Amount,
        from: String,
    },
    /// Mint-policy rejection of a counterpart mint.
    MintError {
        operation_id: OperationId,
        from: String,
    },
    /// AMM confirmation of liquidity provision.
    LiquidityAdded {
        operation_id: OperationId,
        pool_tokens: Amount,
        from: String,
    },
    /// AMM rejection of liquidity provision.
    LiquidityError {
        operation_id: OperationId,
        from: String,
    },
    /// Staker request to unwind a position.
    Unstake { token: TokenId, staker: StakerId },
    /// AMM confirmation of an LP burn with withdrawn amounts.
    BurnConfirmation {
        operation_id: OperationId,
        token_a: TokenId,
        token_b: TokenId,
        withdrawn_a: Amount,
        withdrawn_b: Amount,
        burned_pool_tokens: Amount,
        from: String,
    },
    /// AMM rejection of an LP burn.
    BurnError {
        operation_id: OperationId,
        from: String,
    },
    /// Emission tick trigger.
    RequestRewards { from: String },
    /// MINT supply report from the mint policy.
    UpdateMintSupply { from: String, supply: Amount },
    GetRewardStats { from: String },
    GetStakeOwnership { from: String, staker: StakerId },
    GetUniqueStakers { from: String },
    GetTokenStakes { from: String },
    GetStakingPosition {
        from: String,
        token: TokenId,
        staker: StakerId,
    },
    GetPendingOperations { from: String },
    /// Stale-operation reaper trigger.
    Cleanup { from: String },
    Pause { from: String },
    Unpause { from: String },
}

impl Inbound {
    /// Parse a raw tag bag into a typed message. Fail-closed: unknown
    /// actions and missing tags are rejected.
    pub fn parse(bag: &TagBag) -> Result<Inbound> {
        let from = bag.from.clone();
        let msg = match bag.action.as_str() {
            "Credit-Notice" => Inbound::CreditNotice {
                token: TokenId(from),
                sender: StakerId::from(bag.require("Sender")?),
                quantity: bag.require_amount("Quantity")?,
            },
            "Mint-Confirmation" => Inbound::MintConfirmation {
                operation_id: OperationId::from(bag.require("X-Operation-Id")?),
                amount: bag.require_amount("Amount")?,
                from,
            },
            "Mint-Error" => Inbound::MintError {
                operation_id: OperationId::from(bag.require("X-Operation-Id")?),
                from,
            },
            "Liquidity-Added" => Inbound::LiquidityAdded {
                operation_id: OperationId::from(bag.require("X-Operation-Id")?),
                pool_tokens: bag.require_amount("Pool-Tokens")?,
                from,
            },
            "Liquidity-Error" => Inbound::LiquidityError {
                operation_id: OperationId::from(bag.require("X-Operation-Id")?),
                from,
            },
            "Unstake" => Inbound::Unstake {
                token: TokenId::from(bag.require("Token")?),
                staker: StakerId(from),
            },
            "Burn-Confirmation" => {
                let token_a = TokenId::from(bag.require("Token-A")?);
                let token_b = TokenId::from(bag.require("Token-B")?);
                let withdrawn_a = bag.require_amount(&format!("Withdrawn-{token_a}"))?;
                let withdrawn_b = bag.require_amount(&format!("Withdrawn-{token_b}"))?;
                Inbound::BurnConfirmation {
                    operation_id: OperationId::from(bag.require("X-Operation-Id")?),
                    token_a,
                    token_b,
                    withdrawn_a,
                    withdrawn_b,
                    burned_pool_tokens: bag.require_amount("Burned-Pool-Tokens")?,
                    from,
                }
            }
            "Burn-Error" => Inbound::BurnError {
                operation_id: OperationId::from(bag.require("X-Operation-Id")?),
                from,
            },
            "Request-Rewards" => Inbound::RequestRewards { from },
            "Update-MINT-Supply" => {
                let data = bag.data.as_deref().ok_or_else(|| {
                    EngineError::MalformedMessage("Update-MINT-Supply without Data".into())
                })?;
                Inbound::UpdateMintSupply {
                    from,
                    supply: Amount::parse_dec(data.trim()).map_err(|e| {
                        EngineError::MalformedMessage(format!("bad supply payload: {e}"))
                    })?,
                }
            }
            "Get-Reward-Stats" => Inbound::GetRewardStats { from },
            "Get-Stake-Ownership" => Inbound::GetStakeOwnership {
                from,
                staker: StakerId::from(bag.require("Staker")?),
            },
            "Get-Unique-Stakers" => Inbound::GetUniqueStakers { from },
            "Get-Token-Stakes" => Inbound::GetTokenStakes { from },
            "Get-Staking-Position" => Inbound::GetStakingPosition {
                token: TokenId::from(bag.require("Token")?),
                staker: StakerId::from(bag.require("Staker")?),
                from,
            },
            "Get-Pending-Operations" => Inbound::GetPendingOperations { from },
            "Cleanup" => Inbound::Cleanup { from },
            "Pause" => Inbound::Pause { from },
            "Unpause" => Inbound::Unpause { from },
            other => {
                return Err(EngineError::MalformedMessage(format!(
                    "unknown action {other:?}"
                )))
            }
        };
        Ok(msg)
    }
}

/// Outbound message queued by a handler for later delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outbound {
    pub target: String,
    pub action: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub data: Option<String>,
}

impl Outbound {
    pub fn new(target: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            action: action.into(),
            tags: BTreeMap::new(),
            data: None,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Token transfer with audit tags.
    pub fn transfer(
        token: &TokenId,
        recipient: &StakerId,
        quantity: &Amount,
    ) -> Self {
        Outbound::new(token.0.clone(), "Transfer")
            .tag("Recipient", recipient.0.clone())
            .tag("Quantity", quantity.to_string())
    }
}
