//! Engine configuration.
//!
//! Static deployment parameters: collaborator identities (mint policy, AMMs,
//! treasury, cron caller), fee and buffer ratios, the token allowlist with
//! per-token weights, and protocol limits.
//!
//! Configuration can come from programmatic defaults, the builder, or
//! environment variables prefixed with `PAIRSTAKE_`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Amount, AmmId, EngineError, Result, StakerId, TokenId};

/// Default token weight when `token_weights` has no entry.
pub const DEFAULT_TOKEN_WEIGHT: u64 = 100;

/// Divisor applied to the special token's stake in place of a weight.
pub const SPECIAL_TOKEN_DIVISOR: u64 = 1000;

/// Complete engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Contract owner identity (admin surface: pause, tick, cleanup).
    pub owner: StakerId,

    /// Identity allowed to trigger emission ticks alongside the owner.
    pub cron_caller: String,

    /// Mint-policy actor: receives `Mint-Request`, reports MINT supply.
    pub mint_policy: String,

    /// Treasury actor: receives `Distribute-Rewards`.
    pub treasury: String,

    /// MINT token process ids (mainnet and testnet spellings).
    pub mint_token: TokenId,
    pub mint_testnet_token: TokenId,

    /// Allowed user tokens, each mapped to the AMM pool that pairs it
    /// against MINT. Allowance check and AMM lookup are one table.
    pub allowed_tokens: BTreeMap<TokenId, AmmId>,

    /// Per-token emission weights; missing entries default to
    /// [`DEFAULT_TOKEN_WEIGHT`].
    pub token_weights: BTreeMap<TokenId, u64>,

    /// Token whose stake is weighted by division
    /// (`amount / SPECIAL_TOKEN_DIVISOR`) instead of multiplication.
    pub special_token: TokenId,

    /// Decimal places carried by token amounts.
    pub token_decimals: u32,

    /// Seconds after which a pending operation is stale and reapable.
    pub operation_timeout_secs: u64,

    /// Minimum seconds between emission ticks.
    pub min_distribution_interval_secs: u64,

    /// Protocol fee on realized profit: `fee = profit * pct / divisor`.
    pub protocol_fee_percentage: u64,
    pub fee_divisor: u64,

    /// Safety buffer on the minted counterpart so the add-liquidity step
    /// succeeds: `counterpart = price_quote * multiplier / divisor`.
    pub excess_multiplier: u64,
    pub excess_divisor: u64,

    /// Hard cap on cumulative emitted rewards.
    pub total_supply: Amount,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            owner: StakerId::from("owner"),
            cron_caller: "cron".into(),
            mint_policy: "mint-policy".into(),
            treasury: "treasury".into(),
            mint_token: TokenId::from("mint-token"),
            mint_testnet_token: TokenId::from("mint-testnet-token"),
            allowed_tokens: BTreeMap::new(),
            token_weights: BTreeMap::new(),
            special_token: TokenId::from("special-token"),
            token_decimals: 8,
            operation_timeout_secs: 3_600,
            min_distribution_interval_secs: 300,
            protocol_fee_percentage: 1,
            fee_divisor: 100,
            excess_multiplier: 105,
            excess_divisor: 100,
            total_supply: Amount::from_u128(21_000_000_00000000),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Load scalar overrides from `PAIRSTAKE_`-prefixed environment
    /// variables on top of the defaults:
    /// - `PAIRSTAKE_OPERATION_TIMEOUT_SECS`
    /// - `PAIRSTAKE_MIN_DISTRIBUTION_INTERVAL_SECS`
    /// - `PAIRSTAKE_PROTOCOL_FEE_PERCENTAGE`
    /// - `PAIRSTAKE_TOTAL_SUPPLY` (decimal string)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("PAIRSTAKE_OPERATION_TIMEOUT_SECS") {
            config.operation_timeout_secs = v.parse().map_err(|e| {
                EngineError::ConfigError(format!("invalid PAIRSTAKE_OPERATION_TIMEOUT_SECS: {e}"))
            })?;
        }

        if let Ok(v) = std::env::var("PAIRSTAKE_MIN_DISTRIBUTION_INTERVAL_SECS") {
            config.min_distribution_interval_secs = v.parse().map_err(|e| {
                EngineError::ConfigError(format!(
                    "invalid PAIRSTAKE_MIN_DISTRIBUTION_INTERVAL_SECS: {e}"
                ))
            })?;
        }

        if let Ok(v) = std::env::var("PAIRSTAKE_PROTOCOL_FEE_PERCENTAGE") {
            config.protocol_fee_percentage = v.parse().map_err(|e| {
                EngineError::ConfigError(format!("invalid PAIRSTAKE_PROTOCOL_FEE_PERCENTAGE: {e}"))
            })?;
        }

        if let Ok(v) = std::env::var("PAIRSTAKE_TOTAL_SUPPLY") {
            config.total_supply = Amount::parse_dec(&v).map_err(|e| {
                EngineError::ConfigError(format!("invalid PAIRSTAKE_TOTAL_SUPPLY: {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        if self.fee_divisor == 0 {
            return Err(EngineError::ConfigError("fee_divisor must be non-zero".into()));
        }
        if self.protocol_fee_percentage > self.fee_divisor {
            return Err(EngineError::ConfigError(
                "protocol_fee_percentage must not exceed fee_divisor".into(),
            ));
        }
        if self.excess_divisor == 0 {
            return Err(EngineError::ConfigError(
                "excess_divisor must be non-zero".into(),
            ));
        }
        if self.excess_multiplier < self.excess_divisor {
            return Err(EngineError::ConfigError(
                "excess_multiplier must be at least excess_divisor (buffer >= 1)".into(),
            ));
        }
        if self.operation_timeout_secs == 0 {
            return Err(EngineError::ConfigError(
                "operation_timeout_secs must be non-zero".into(),
            ));
        }
        if self.min_distribution_interval_secs == 0 {
            return Err(EngineError::ConfigError(
                "min_distribution_interval_secs must be non-zero".into(),
            ));
        }
        if self.total_supply.is_zero() {
            return Err(EngineError::ConfigError("total_supply must be positive".into()));
        }
        for (token, weight) in &self.token_weights {
            if *weight == 0 && *token != self.special_token {
                return Err(EngineError::ConfigError(format!(
                    "zero weight configured for token {token}"
                )));
            }
        }
        Ok(())
    }

    /// Whether `token` may be staked.
    pub fn is_allowed(&self, token: &TokenId) -> bool {
        self.allowed_tokens.contains_key(token)
    }

    /// AMM pool paired with `token`, if allowed.
    pub fn amm_for(&self, token: &TokenId) -> Option<&AmmId> {
        self.allowed_tokens.get(token)
    }

    /// Emission weight for `token` (default applies to missing entries).
    pub fn weight_for(&self, token: &TokenId) -> u64 {
        self.token_weights
            .get(token)
            .copied()
            .unwrap_or(DEFAULT_TOKEN_WEIGHT)
    }

    /// Whether `token` is the MINT token under either spelling.
    pub fn is_mint_token(&self, token: &TokenId) -> bool {
        *token == self.mint_token || *token == self.mint_testnet_token
    }
}

/// Builder for [`EngineConfig`].
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn owner(mut self, owner: impl Into<StakerId>) -> Self {
        self.config.owner = owner.into();
        self
    }

    pub fn cron_caller(mut self, caller: impl Into<String>) -> Self {
        self.config.cron_caller = caller.into();
        self
    }

    pub fn mint_policy(mut self, actor: impl Into<String>) -> Self {
        self.config.mint_policy = actor.into();
        self
    }

    pub fn treasury(mut self, actor: impl Into<String>) -> Self {
        self.config.treasury = actor.into();
        self
    }

    pub fn mint_token(mut self, token: impl Into<TokenId>) -> Self {
        self.config.mint_token = token.into();
        self
    }

    pub fn mint_testnet_token(mut self, token: impl Into<TokenId>) -> Self {
        self.config.mint_testnet_token = token.into();
        self
    }

    /// Allow `token` for staking against `amm`.
    pub fn allowed_token(mut self, token: impl Into<TokenId>, amm: impl Into<AmmId>) -> Self {
        self.config.allowed_tokens.insert(token.into(), amm.into());
        self
    }

    pub fn token_weight(mut self, token: impl Into<TokenId>, weight: u64) -> Self {
        self.config.token_weights.insert(token.into(), weight);
        self
    }

    pub fn special_token(mut self, token: impl Into<TokenId>) -> Self {
        self.config.special_token = token.into();
        self
    }

    pub fn operation_timeout_secs(mut self, secs: u64) -> Self {
        self.config.operation_timeout_secs = secs;
        self
    }

    pub fn min_distribution_interval_secs(mut self, secs: u64) -> Self {
        self.config.min_distribution_interval_secs = secs;
        self
    }

    pub fn protocol_fee(mut self, percentage: u64, divisor: u64) -> Self {
        self.config.protocol_fee_percentage = percentage;
        self.config.fee_divisor = divisor;
        self
    }

    pub fn excess_buffer(mut self, multiplier: u64, divisor: u64) -> Self {
        self.config.excess_multiplier = multiplier;
        self.config.excess_divisor = divisor;
        self
    }

    pub fn total_supply(mut self, supply: Amount) -> Self {
        self.config.total_supply = supply;
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_creates_valid_config() {
        let config = EngineConfig::builder()
            .owner("own")
            .allowed_token("token-a", "amm-a")
            .token_weight("token-a", 250)
            .protocol_fee(1, 100)
            .build()
            .expect("should build");

        assert!(config.is_allowed(&TokenId::from("token-a")));
        assert_eq!(config.weight_for(&TokenId::from("token-a")), 250);
        assert_eq!(config.amm_for(&TokenId::from("token-a")), Some(&AmmId::from("amm-a")));
    }

    #[test]
    fn missing_weight_falls_back_to_default() {
        let config = EngineConfig::default();
        assert_eq!(config.weight_for(&TokenId::from("anything")), DEFAULT_TOKEN_WEIGHT);
    }

    #[test]
    fn zero_fee_divisor_rejected() {
        let result = EngineConfig::builder().protocol_fee(1, 0).build();
        assert!(result.is_err());
    }

    #[test]
    fn sub_unit_excess_buffer_rejected() {
        let result = EngineConfig::builder().excess_buffer(90, 100).build();
        assert!(result.is_err());
    }

    #[test]
    fn fee_above_divisor_rejected() {
        let result = EngineConfig::builder().protocol_fee(101, 100).build();
        assert!(result.is_err());
    }

    #[test]
    fn zero_weight_for_regular_token_rejected() {
        let result = EngineConfig::builder()
            .allowed_token("token-a", "amm-a")
            .token_weight("token-a", 0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn mint_token_matches_both_spellings() {
        let config = EngineConfig::builder()
            .mint_token("mint")
            .mint_testnet_token("mint-test")
            .build()
            .expect("build");
        assert!(config.is_mint_token(&TokenId::from("mint")));
        assert!(config.is_mint_token(&TokenId::from("mint-test")));
        assert!(!config.is_mint_token(&TokenId::from("other")));
    }
}
