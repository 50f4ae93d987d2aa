//! Protocol abstraction layer.
//!
//! The rebalancer talks to two DeFi protocols through capability traits:
//!
//! - [`MoneyMarketClient`]: the credit facility (stable loan against a
//!   deposit, plus a stable savings deposit)
//! - [`SyntheticProtocolClient`]: synthetic-asset CDPs, their oracle,
//!   AMM pairs and LP staking
//!
//! Query methods hit the chain; builder methods are pure and only produce
//! [`Message`]s for the caller to queue.
//!
//! # Example
//!
//! ```rust,ignore
//! use rebalancer_chain::protocol::{AnchorMarket, MoneyMarketClient};
//!
//! let market = AnchorMarket::new(chain.clone(), contracts);
//! let borrowed = market.get_borrowed_value(chain.address()).await?;
//! let msg = market.repay(borrowed / dec!(10));
//! chain.sign_and_broadcast(&[msg]).await?;
//! ```

mod anchor;
mod mirror;

pub use anchor::{AnchorContracts, AnchorMarket};
pub use mirror::{MirrorAsset, MirrorContracts, MirrorProtocol};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rust_decimal::Decimal;
use serde_json::Value;
use std::fmt::Debug;

use crate::error::ChainResult;
use crate::types::{
    to_micro_string, AssetInfo, Message, OraclePrice, PoolInfo, PositionInfo, RewardInfo,
    SwapSimulation,
};

/// Money-market credit facility.
///
/// All amounts are whole stable units unless stated otherwise.
#[async_trait]
pub trait MoneyMarketClient: Send + Sync + Debug {
    /// Outstanding loan of `account`.
    async fn get_borrowed_value(&self, account: &str) -> ChainResult<Decimal>;

    /// Maximum loan the facility allows `account` right now.
    async fn get_borrow_limit(&self, account: &str) -> ChainResult<Decimal>;

    /// Stable value of the savings deposit of `account`.
    async fn get_deposit(&self, account: &str) -> ChainResult<Decimal>;

    /// Stable value of one deposit token.
    async fn get_exchange_rate(&self) -> ChainResult<Decimal>;

    /// Contract address of the deposit (interest-bearing) token.
    fn deposit_token(&self) -> &str;

    fn borrow(&self, amount: Decimal) -> Message;

    fn repay(&self, amount: Decimal) -> Message;

    fn deposit_stable(&self, amount: Decimal) -> Message;

    /// Redeem `deposit_tokens` deposit tokens for stable.
    fn withdraw_stable(&self, deposit_tokens: Decimal) -> Message;

    /// Borrower rewards accrued to `account` and not yet claimed.
    async fn get_pending_rewards(&self, account: &str) -> ChainResult<Decimal>;

    /// Stable price of one reward token at its AMM pair.
    async fn get_reward_price(&self) -> ChainResult<Decimal>;

    /// Contract address of the reward token.
    fn reward_token(&self) -> &str;

    /// Claim every pending borrower reward to the wallet.
    fn claim_rewards(&self) -> Message;

    /// Swap `amount` reward tokens for stable.
    fn sell_rewards(&self, amount: Decimal) -> Message;

    /// Stake `amount` reward tokens in governance.
    fn stake_rewards(&self, amount: Decimal) -> Message;
}

/// Minimal asset configuration of a synthetic asset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssetConfig {
    /// Protocol-mandated minimum collateral ratio before the collateral
    /// multiplier is applied
    pub min_collateral_ratio: Decimal,
}

/// Synthetic-asset protocol with oracle, AMM pairs and LP staking.
///
/// Asset parameters are the asset token contract address. Builder amounts
/// are whole units; LP amounts are whole LP tokens.
#[async_trait]
pub trait SyntheticProtocolClient: Send + Sync + Debug {
    /// Every CDP owned by `owner`.
    async fn get_positions(&self, owner: &str) -> ChainResult<Vec<PositionInfo>>;

    async fn get_position(&self, idx: &str) -> ChainResult<PositionInfo>;

    async fn get_asset_config(&self, asset_token: &str) -> ChainResult<AssetConfig>;

    /// Stable price of one collateral unit.
    async fn get_collateral_price(&self, collateral: &str) -> ChainResult<Decimal>;

    /// Multiplier applied to the minimum collateral ratio for `collateral`.
    async fn get_collateral_multiplier(&self, collateral: &str) -> ChainResult<Decimal>;

    /// Oracle rate of `asset_token` quoted against the native `denom`.
    async fn get_oracle_price(&self, denom: &str, asset_token: &str) -> ChainResult<OraclePrice>;

    /// Reserves of the asset/stable AMM pair.
    async fn get_pool_info(&self, asset_token: &str) -> ChainResult<PoolInfo>;

    /// Staking entries of `owner` for the asset's LP.
    async fn get_reward_info(&self, owner: &str, asset_token: &str)
        -> ChainResult<Vec<RewardInfo>>;

    /// Stable cost of buying `amount` of the asset from its pair.
    async fn reverse_simulate(&self, asset_token: &str, amount: Decimal)
        -> ChainResult<SwapSimulation>;

    /// Asset tokens the protocol knows by symbol.
    fn asset_token(&self, symbol: &str) -> Option<&str>;

    fn mint(&self, idx: &str, asset_token: &str, amount: Decimal) -> ChainResult<Message>;

    fn burn(&self, idx: &str, asset_token: &str, amount: Decimal) -> ChainResult<Message>;

    fn deposit(&self, idx: &str, collateral: &AssetInfo, amount: Decimal) -> ChainResult<Message>;

    fn withdraw(&self, idx: &str, collateral: &AssetInfo, amount: Decimal) -> ChainResult<Message>;

    /// Provide `asset_amount` plus `stable_amount` as liquidity and stake the LP.
    fn stake(
        &self,
        asset_token: &str,
        asset_amount: Decimal,
        stable_amount: Decimal,
    ) -> ChainResult<Vec<Message>>;

    /// Unbond staked LP back to the wallet.
    fn unstake(&self, asset_token: &str, lp_amount: Decimal) -> ChainResult<Message>;

    /// Burn LP at the pair for the underlying asset and stable.
    fn withdraw_liquidity(&self, asset_token: &str, lp_amount: Decimal) -> ChainResult<Message>;

    /// Buy `asset_amount` with `swap_stable`, then provide it with
    /// `lp_stable` and stake the LP.
    fn swap_and_provide_liquidity(
        &self,
        asset_token: &str,
        asset_amount: Decimal,
        swap_stable: Decimal,
        lp_stable: Decimal,
    ) -> ChainResult<Vec<Message>>;
}

/// CW20 `send` of `amount` (whole units) to `contract` with a hook message.
pub fn cw20_send(sender: &str, token: &str, contract: &str, amount: Decimal, hook: &Value) -> Message {
    Message::execute(
        sender,
        token,
        serde_json::json!({
            "send": {
                "contract": contract,
                "amount": to_micro_string(amount),
                "msg": BASE64.encode(hook.to_string()),
            }
        }),
    )
}

/// CW20 `increase_allowance` that never expires.
pub fn cw20_increase_allowance(sender: &str, token: &str, spender: &str, amount: Decimal) -> Message {
    Message::execute(
        sender,
        token,
        serde_json::json!({
            "increase_allowance": {
                "spender": spender,
                "amount": to_micro_string(amount),
                "expires": { "never": {} },
            }
        }),
    )
}
