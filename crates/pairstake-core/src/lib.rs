//! pairstake-core: single-sided staking and rewards engine.
//!
//! Users deposit one allowed token; the engine pairs the deposit with
//! protocol-minted MINT, supplies both to an external AMM, and holds the
//! LP position on the staker's behalf. Unstaking burns the LP tokens and
//! settles impermanent-loss compensation plus profit sharing. A periodic
//! emission schedule distributes rewards weighted by token type and stake
//! size.
//!
//! Every external interaction (mint, add-liquidity, burn, transfer) is a
//! non-atomic round trip through another actor, so multi-step workflows are
//! persisted as pending operations in the [`Ledger`] and resumed by typed
//! confirmation messages. Dispatch is single-threaded: one inbound message
//! runs to completion, commits its ledger effects in program order, and
//! queues outbound messages.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod amount;
pub mod config;
pub mod dispatch;
pub mod emission;
pub mod ledger;
pub mod math;
pub mod operations;
pub mod stake;
pub mod unstake;
pub mod wire;

pub use amount::Amount;
pub use config::EngineConfig;
pub use dispatch::{dispatch, HandlerContext};
pub use ledger::{Ledger, OpKind, OpStatus, PendingOperation, StakingPosition};
pub use wire::{Inbound, Outbound, TagBag};

/// Process identity of a token contract.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub String);

/// Process identity of a staker (message sender).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StakerId(pub String);

/// Process identity of an AMM pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AmmId(pub String);

/// Identifier of a pending multi-step operation.
///
/// Derived as `token-kind-staker-seconds-nonce`, where the nonce is a
/// ledger-persisted monotonic counter so two submissions in the same second
/// never collide.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub String);

macro_rules! impl_id_display {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $ty {
                fn from(s: &str) -> Self {
                    Self(s.to_owned())
                }
            }

            impl From<String> for $ty {
                fn from(s: String) -> Self {
                    Self(s)
                }
            }
        )*
    };
}

impl_id_display!(TokenId, StakerId, AmmId, OperationId);

/// Unified error type for engine operations.
///
/// Handlers are fail-closed: any error aborts the handler with no ledger
/// mutation and no outbound effect messages.
#[derive(Debug, Error)]
pub enum EngineError {
    // Policy violations: rejected before any state is touched.
    #[error("engine is paused")]
    Paused,

    #[error("unauthorized caller: {0}")]
    Unauthorized(String),

    #[error("token not allowed: {0}")]
    TokenNotAllowed(TokenId),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("no staking position for token {token} and staker {staker}")]
    NoPosition { token: TokenId, staker: StakerId },

    // Registry errors.
    #[error("a pending {kind} operation already exists for staker {staker} on token {token}")]
    DuplicatePending {
        kind: OpKind,
        token: TokenId,
        staker: StakerId,
    },

    #[error("unknown operation: {0}")]
    UnknownOperation(OperationId),

    #[error("operation {id} kind mismatch: expected {expected}, found {actual}")]
    OperationKindMismatch {
        id: OperationId,
        expected: OpKind,
        actual: OpKind,
    },

    #[error("operation {id} status mismatch: expected {expected}, found {actual}")]
    OperationStatusMismatch {
        id: OperationId,
        expected: OpStatus,
        actual: OpStatus,
    },

    #[error("operation {id} expects confirmations from AMM {expected}, got sender {actual}")]
    AmmMismatch {
        id: OperationId,
        expected: AmmId,
        actual: String,
    },

    // Emission errors.
    #[error("distribution too soon: next tick allowed in {wait_secs}s")]
    DistributionTooSoon { wait_secs: u64 },

    // Arithmetic: overflow cannot occur for in-range amounts, but the
    // guarded paths (division by zero, narrowing) still surface here.
    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    // Wire errors.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("price unavailable for token {0}")]
    PriceUnavailable(TokenId),

    // Configuration errors.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// AMM price of MINT in units of a user token, as an exact rational.
///
/// A deposit of `q` user tokens calls for `q * numerator / denominator`
/// counterpart MINT before the excess buffer is applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Price {
    pub numerator: Amount,
    pub denominator: Amount,
}

/// Provides the latest AMM price for an allowed token.
///
/// Postconditions:
/// - Returned `denominator` is non-zero.
/// - For fixed inputs within one dispatch, returns the same price on every
///   call (the counterpart computation is a pure function of it).
pub trait PriceSource {
    fn latest_price(&self, token: &TokenId) -> Result<Price>;
}

/// Impermanent-loss compensation policy.
///
/// Contract: deterministic in its inputs, always yields a valid
/// non-negative amount in the user token, and draws from a
/// protocol-controlled reserve rather than the user's LP position.
pub trait IlPolicy {
    fn compensation(
        &self,
        operation: &PendingOperation,
        withdrawn_user: &Amount,
        withdrawn_mint: &Amount,
    ) -> Result<Amount>;
}

/// Fixed-price source, chiefly for tests and local runs.
pub struct FixedPriceSource {
    prices: HashMap<TokenId, Price>,
}

impl FixedPriceSource {
    pub fn new() -> Self {
        Self {
            prices: HashMap::new(),
        }
    }

    pub fn with_price(mut self, token: TokenId, numerator: Amount, denominator: Amount) -> Self {
        self.prices.insert(
            token,
            Price {
                numerator,
                denominator,
            },
        );
        self
    }
}

impl Default for FixedPriceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceSource for FixedPriceSource {
    fn latest_price(&self, token: &TokenId) -> Result<Price> {
        self.prices
            .get(token)
            .cloned()
            .ok_or_else(|| EngineError::PriceUnavailable(token.clone()))
    }
}

/// Default IL policy: compensate the user-token shortfall against the
/// recorded cost basis, `max(0, initial - withdrawn_user)`.
///
/// Deployments with a richer oracle-backed formula implement [`IlPolicy`]
/// themselves; the settlement pipeline is agnostic to the formula.
pub struct ShortfallIlPolicy;

impl IlPolicy for ShortfallIlPolicy {
    fn compensation(
        &self,
        operation: &PendingOperation,
        withdrawn_user: &Amount,
        _withdrawn_mint: &Amount,
    ) -> Result<Amount> {
        if withdrawn_user >= &operation.amount {
            Ok(Amount::zero())
        } else {
            operation.amount.checked_sub(withdrawn_user)
        }
    }
}
