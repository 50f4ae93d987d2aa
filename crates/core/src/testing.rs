//! Scripted collaborators for engine tests.
//!
//! State lives behind `parking_lot` mutexes so a test can move prices or
//! balances between cycles. Broadcasts are recorded, never applied.

use async_trait::async_trait;
use parking_lot::Mutex;
use rebalancer_api::{Event, Notifier};
use rebalancer_chain::{
    AssetConfig, AssetInfo, ChainClient, ChainError, ChainResult, Message, MoneyMarketClient,
    OraclePrice, PoolInfo, PositionInfo, RewardInfo, SwapSimulation, SyntheticProtocolClient,
    TxReceipt, MICRO_MULTIPLIER,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::gateway::Gateway;

pub const WALLET: &str = "terra1wallet";
pub const STABLE: &str = "uusd";
pub const DEPOSIT_TOKEN: &str = "terra1aust";
pub const ASSET: &str = "terra1masset";
pub const REWARD_TOKEN: &str = "terra1anc";
pub const SYMBOL: &str = "mAAPL";

#[derive(Debug, Default)]
pub struct MockChain {
    pub balances: Mutex<HashMap<String, Decimal>>,
    pub broadcasts: Mutex<Vec<Vec<Message>>>,
    pub broadcast_error: Mutex<Option<String>>,
    /// When set, balance queries wait for a `notify_one`
    pub hold: Mutex<Option<Arc<Notify>>>,
    pub balance_calls: Mutex<u32>,
}

impl MockChain {
    pub fn set_balance(&self, key: &str, amount: Decimal) {
        self.balances.lock().insert(key.to_string(), amount);
    }

    pub fn batches(&self) -> Vec<Vec<Message>> {
        self.broadcasts.lock().clone()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn address(&self) -> &str {
        WALLET
    }

    async fn get_balance(&self, denom: &str) -> ChainResult<Decimal> {
        *self.balance_calls.lock() += 1;
        let hold = self.hold.lock().clone();
        if let Some(gate) = hold {
            gate.notified().await;
        }
        Ok(self.balances.lock().get(denom).copied().unwrap_or_default())
    }

    async fn get_token_balance(&self, token: &str) -> ChainResult<Decimal> {
        Ok(self.balances.lock().get(token).copied().unwrap_or_default())
    }

    async fn query_contract(&self, contract: &str, _query: &Value) -> ChainResult<Value> {
        Err(ChainError::Status {
            path: contract.to_string(),
            status: 501,
            body: "not scripted".to_string(),
        })
    }

    async fn sign_and_broadcast(&self, messages: &[Message]) -> ChainResult<TxReceipt> {
        if let Some(raw_log) = self.broadcast_error.lock().clone() {
            return Err(ChainError::TxFailed {
                txhash: "FAILED".to_string(),
                code: 5,
                raw_log,
            });
        }
        let mut broadcasts = self.broadcasts.lock();
        broadcasts.push(messages.to_vec());
        Ok(TxReceipt {
            txhash: format!("TX{}", broadcasts.len()),
            height: 1,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MarketState {
    pub borrowed: Decimal,
    pub limit: Decimal,
    pub deposit: Decimal,
    pub exchange_rate: Decimal,
    pub pending_rewards: Decimal,
    pub reward_price: Decimal,
    pub fail: bool,
}

impl Default for MarketState {
    fn default() -> Self {
        Self {
            borrowed: dec!(4000),
            limit: dec!(5000),
            deposit: dec!(1000),
            exchange_rate: dec!(1.25),
            pending_rewards: Decimal::ZERO,
            reward_price: dec!(2),
            fail: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct MockMarket {
    pub state: Mutex<MarketState>,
}

impl MockMarket {
    fn check(&self) -> ChainResult<()> {
        if self.state.lock().fail {
            return Err(ChainError::Status {
                path: "market".to_string(),
                status: 503,
                body: "market unavailable".to_string(),
            });
        }
        Ok(())
    }
}

fn amount_msg(contract: &str, action: &str, amount: Decimal) -> Message {
    Message::execute(WALLET, contract, json!({ action: { "amount": amount.to_string() } }))
}

#[async_trait]
impl MoneyMarketClient for MockMarket {
    async fn get_borrowed_value(&self, _account: &str) -> ChainResult<Decimal> {
        self.check()?;
        Ok(self.state.lock().borrowed)
    }

    async fn get_borrow_limit(&self, _account: &str) -> ChainResult<Decimal> {
        self.check()?;
        Ok(self.state.lock().limit)
    }

    async fn get_deposit(&self, _account: &str) -> ChainResult<Decimal> {
        self.check()?;
        Ok(self.state.lock().deposit)
    }

    async fn get_exchange_rate(&self) -> ChainResult<Decimal> {
        self.check()?;
        Ok(self.state.lock().exchange_rate)
    }

    fn deposit_token(&self) -> &str {
        DEPOSIT_TOKEN
    }

    fn borrow(&self, amount: Decimal) -> Message {
        amount_msg("market", "borrow_stable", amount)
    }

    fn repay(&self, amount: Decimal) -> Message {
        amount_msg("market", "repay_stable", amount)
    }

    fn deposit_stable(&self, amount: Decimal) -> Message {
        amount_msg("market", "deposit_stable", amount)
    }

    fn withdraw_stable(&self, deposit_tokens: Decimal) -> Message {
        amount_msg(DEPOSIT_TOKEN, "redeem_stable", deposit_tokens)
    }

    async fn get_pending_rewards(&self, _account: &str) -> ChainResult<Decimal> {
        self.check()?;
        Ok(self.state.lock().pending_rewards)
    }

    async fn get_reward_price(&self) -> ChainResult<Decimal> {
        self.check()?;
        Ok(self.state.lock().reward_price)
    }

    fn reward_token(&self) -> &str {
        REWARD_TOKEN
    }

    fn claim_rewards(&self) -> Message {
        Message::execute(WALLET, "market", json!({ "claim_rewards": {} }))
    }

    fn sell_rewards(&self, amount: Decimal) -> Message {
        amount_msg(REWARD_TOKEN, "sell_rewards", amount)
    }

    fn stake_rewards(&self, amount: Decimal) -> Message {
        amount_msg(REWARD_TOKEN, "stake_rewards", amount)
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticState {
    pub positions: Vec<PositionInfo>,
    pub min_collateral_ratio: Decimal,
    pub collateral_price: Decimal,
    pub multiplier: Decimal,
    pub oracle: OraclePrice,
    pub pool: PoolInfo,
    pub rewards: Vec<RewardInfo>,
    /// Stable per asset unit charged by the reverse simulation
    pub swap_price: Decimal,
}

impl Default for SyntheticState {
    fn default() -> Self {
        Self {
            positions: vec![],
            min_collateral_ratio: dec!(1.5),
            collateral_price: dec!(1.25),
            multiplier: dec!(1),
            // asset price 100
            oracle: OraclePrice {
                rate: dec!(0.01),
                last_updated_quote: 1,
            },
            // pool price 102, 1000 LP over 100 asset
            pool: PoolInfo {
                stable_reserve: dec!(10200) * MICRO_MULTIPLIER,
                asset_reserve: dec!(100) * MICRO_MULTIPLIER,
                total_share: dec!(1000) * MICRO_MULTIPLIER,
            },
            rewards: vec![],
            swap_price: dec!(102),
        }
    }
}

/// Position of `asset_amount` asset against `collateral_amount` deposit
/// token collateral, whole units.
pub fn position(idx: &str, collateral_amount: Decimal, asset_amount: Decimal, is_short: bool) -> PositionInfo {
    PositionInfo {
        idx: idx.to_string(),
        collateral: AssetInfo::token(DEPOSIT_TOKEN),
        collateral_amount: collateral_amount * MICRO_MULTIPLIER,
        asset: AssetInfo::token(ASSET),
        asset_amount: asset_amount * MICRO_MULTIPLIER,
        is_short,
    }
}

#[derive(Debug, Default)]
pub struct MockSynthetic {
    pub state: Mutex<SyntheticState>,
}

impl MockSynthetic {
    pub fn set_positions(&self, positions: Vec<PositionInfo>) {
        self.state.lock().positions = positions;
    }
}

fn not_found(what: &str) -> ChainError {
    ChainError::Status {
        path: what.to_string(),
        status: 404,
        body: "not found".to_string(),
    }
}

fn position_msg(action: &str, idx: &str, amount: Decimal) -> Message {
    Message::execute(
        WALLET,
        "mint",
        json!({ action: { "position_idx": idx, "amount": amount.to_string() } }),
    )
}

#[async_trait]
impl SyntheticProtocolClient for MockSynthetic {
    async fn get_positions(&self, _owner: &str) -> ChainResult<Vec<PositionInfo>> {
        Ok(self.state.lock().positions.clone())
    }

    async fn get_position(&self, idx: &str) -> ChainResult<PositionInfo> {
        self.state
            .lock()
            .positions
            .iter()
            .find(|p| p.idx == idx)
            .cloned()
            .ok_or_else(|| not_found(idx))
    }

    async fn get_asset_config(&self, _asset_token: &str) -> ChainResult<AssetConfig> {
        Ok(AssetConfig {
            min_collateral_ratio: self.state.lock().min_collateral_ratio,
        })
    }

    async fn get_collateral_price(&self, _collateral: &str) -> ChainResult<Decimal> {
        Ok(self.state.lock().collateral_price)
    }

    async fn get_collateral_multiplier(&self, _collateral: &str) -> ChainResult<Decimal> {
        Ok(self.state.lock().multiplier)
    }

    async fn get_oracle_price(&self, _denom: &str, _asset_token: &str) -> ChainResult<OraclePrice> {
        Ok(self.state.lock().oracle)
    }

    async fn get_pool_info(&self, _asset_token: &str) -> ChainResult<PoolInfo> {
        Ok(self.state.lock().pool)
    }

    async fn get_reward_info(&self, _owner: &str, _asset_token: &str) -> ChainResult<Vec<RewardInfo>> {
        Ok(self.state.lock().rewards.clone())
    }

    async fn reverse_simulate(&self, _asset_token: &str, amount: Decimal) -> ChainResult<SwapSimulation> {
        let price = self.state.lock().swap_price;
        Ok(SwapSimulation {
            offer_amount: amount * price * MICRO_MULTIPLIER,
            spread_amount: Decimal::ZERO,
            commission_amount: Decimal::ZERO,
        })
    }

    fn asset_token(&self, symbol: &str) -> Option<&str> {
        (symbol == SYMBOL).then_some(ASSET)
    }

    fn mint(&self, idx: &str, _asset_token: &str, amount: Decimal) -> ChainResult<Message> {
        Ok(position_msg("mint", idx, amount))
    }

    fn burn(&self, idx: &str, _asset_token: &str, amount: Decimal) -> ChainResult<Message> {
        Ok(position_msg("burn", idx, amount))
    }

    fn deposit(&self, idx: &str, _collateral: &AssetInfo, amount: Decimal) -> ChainResult<Message> {
        Ok(position_msg("deposit", idx, amount))
    }

    fn withdraw(&self, idx: &str, _collateral: &AssetInfo, amount: Decimal) -> ChainResult<Message> {
        Ok(position_msg("withdraw", idx, amount))
    }

    fn stake(&self, _asset_token: &str, asset_amount: Decimal, stable_amount: Decimal) -> ChainResult<Vec<Message>> {
        Ok(vec![
            amount_msg(ASSET, "increase_allowance", asset_amount),
            amount_msg("staking", "auto_stake", stable_amount),
        ])
    }

    fn unstake(&self, _asset_token: &str, lp_amount: Decimal) -> ChainResult<Message> {
        Ok(amount_msg("staking", "unbond", lp_amount))
    }

    fn withdraw_liquidity(&self, _asset_token: &str, lp_amount: Decimal) -> ChainResult<Message> {
        Ok(amount_msg("pair", "withdraw_liquidity", lp_amount))
    }

    fn swap_and_provide_liquidity(
        &self,
        _asset_token: &str,
        asset_amount: Decimal,
        swap_stable: Decimal,
        lp_stable: Decimal,
    ) -> ChainResult<Vec<Message>> {
        Ok(vec![
            amount_msg("pair", "swap", swap_stable),
            amount_msg(ASSET, "increase_allowance", asset_amount),
            amount_msg("staking", "auto_stake", lp_stable),
        ])
    }
}

/// Collects every event for assertions.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier(pub Arc<Mutex<Vec<Event>>>);

impl Notifier for RecordingNotifier {
    fn notify(&self, event: Event) {
        self.0.lock().push(event);
    }
}

/// The three mocks wired into a gateway.
pub struct Harness {
    pub chain: Arc<MockChain>,
    pub market: Arc<MockMarket>,
    pub synthetic: Arc<MockSynthetic>,
    pub gateway: Gateway,
}

impl Harness {
    pub fn new() -> Self {
        let chain = Arc::new(MockChain::default());
        let market = Arc::new(MockMarket::default());
        let synthetic = Arc::new(MockSynthetic::default());
        let gateway = Gateway::new(
            chain.clone(),
            market.clone(),
            synthetic.clone(),
            STABLE,
            Duration::from_secs(5),
        );
        Self {
            chain,
            market,
            synthetic,
            gateway,
        }
    }
}

/// Action names of one batch, in order.
pub fn actions(batch: &[Message]) -> Vec<String> {
    batch
        .iter()
        .filter_map(|m| m.action().map(str::to_string))
        .collect()
}

/// The `amount` field of a mock message.
pub fn amount_of(message: &Message) -> Decimal {
    message
        .action()
        .and_then(|a| message.execute_msg[a]["amount"].as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}
