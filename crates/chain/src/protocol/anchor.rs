//! Anchor-style money market.
//!
//! Loans are taken against bAsset collateral through the market contract;
//! the borrow limit comes from the overseer. Savings are held as the
//! interest-bearing deposit token (aUST) whose stable value follows the
//! market's exchange rate.
//!
//! Borrowers also accrue a reward token. It is claimed from the market,
//! sold at its stable pair or staked in governance.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::{cw20_send, MoneyMarketClient};
use crate::client::ChainClient;
use crate::error::{ChainError, ChainResult};
use crate::types::{from_micro, parse_decimal, to_micro_string, AssetInfo, Coin, Message};

/// Contract addresses of one market deployment.
#[derive(Debug, Clone)]
pub struct AnchorContracts {
    pub market: String,
    pub overseer: String,
    /// Deposit token (aUST) contract
    pub deposit_token: String,
    /// Native denom of the stable the market lends
    pub stable_denom: String,
    /// Borrower reward token (ANC) contract
    pub reward_token: String,
    /// Reward token/stable AMM pair
    pub reward_pair: String,
    /// Governance contract reward tokens are staked in
    pub gov: String,
}

#[derive(Debug, Deserialize)]
struct RawReserve {
    info: AssetInfo,
    amount: String,
}

#[derive(Debug, Deserialize)]
struct RawPool {
    assets: Vec<RawReserve>,
}

/// Anchor money market bound to one wallet.
#[derive(Debug)]
pub struct AnchorMarket {
    contracts: AnchorContracts,
    chain: Arc<dyn ChainClient>,
}

impl AnchorMarket {
    pub fn new(chain: Arc<dyn ChainClient>, contracts: AnchorContracts) -> Self {
        Self { contracts, chain }
    }

    pub fn contracts(&self) -> &AnchorContracts {
        &self.contracts
    }

    fn sender(&self) -> &str {
        self.chain.address()
    }

    fn field(value: &Value, name: &str, context: &str) -> ChainResult<Decimal> {
        parse_decimal(&value[name])
            .ok_or_else(|| ChainError::decode(context, format!("missing {name}")))
    }
}

#[async_trait]
impl MoneyMarketClient for AnchorMarket {
    async fn get_borrowed_value(&self, account: &str) -> ChainResult<Decimal> {
        let query = json!({ "borrower_info": { "borrower": account } });
        let info = self.chain.query_contract(&self.contracts.market, &query).await?;
        let loan = Self::field(&info, "loan_amount", "borrower_info")?;
        Ok(from_micro(loan))
    }

    async fn get_borrow_limit(&self, account: &str) -> ChainResult<Decimal> {
        let query = json!({ "borrow_limit": { "borrower": account } });
        let info = self.chain.query_contract(&self.contracts.overseer, &query).await?;
        let limit = Self::field(&info, "borrow_limit", "borrow_limit")?;
        Ok(from_micro(limit))
    }

    async fn get_deposit(&self, account: &str) -> ChainResult<Decimal> {
        let query = json!({ "balance": { "address": account } });
        let (balance, rate) = futures::try_join!(
            self.chain.query_contract(&self.contracts.deposit_token, &query),
            self.get_exchange_rate(),
        )?;
        let tokens = from_micro(Self::field(&balance, "balance", "deposit token balance")?);

        debug!(deposit_tokens = %tokens, exchange_rate = %rate, "Savings deposit read");
        Ok(tokens * rate)
    }

    async fn get_exchange_rate(&self) -> ChainResult<Decimal> {
        let query = json!({ "epoch_state": {} });
        let state = self.chain.query_contract(&self.contracts.market, &query).await?;
        Self::field(&state, "exchange_rate", "epoch_state")
    }

    fn deposit_token(&self) -> &str {
        &self.contracts.deposit_token
    }

    fn borrow(&self, amount: Decimal) -> Message {
        Message::execute(
            self.sender(),
            &self.contracts.market,
            json!({ "borrow_stable": { "borrow_amount": to_micro_string(amount) } }),
        )
    }

    fn repay(&self, amount: Decimal) -> Message {
        Message::execute(self.sender(), &self.contracts.market, json!({ "repay_stable": {} }))
            .with_coins(vec![Coin::from_whole(&self.contracts.stable_denom, amount)])
    }

    fn deposit_stable(&self, amount: Decimal) -> Message {
        Message::execute(self.sender(), &self.contracts.market, json!({ "deposit_stable": {} }))
            .with_coins(vec![Coin::from_whole(&self.contracts.stable_denom, amount)])
    }

    fn withdraw_stable(&self, deposit_tokens: Decimal) -> Message {
        cw20_send(
            self.sender(),
            &self.contracts.deposit_token,
            &self.contracts.market,
            deposit_tokens,
            &json!({ "redeem_stable": {} }),
        )
    }

    async fn get_pending_rewards(&self, account: &str) -> ChainResult<Decimal> {
        let query = json!({ "borrower_info": { "borrower": account } });
        let info = self.chain.query_contract(&self.contracts.market, &query).await?;
        let pending = Self::field(&info, "pending_rewards", "borrower_info")?;
        Ok(from_micro(pending))
    }

    async fn get_reward_price(&self) -> ChainResult<Decimal> {
        let value = self
            .chain
            .query_contract(&self.contracts.reward_pair, &json!({ "pool": {} }))
            .await?;
        let pool: RawPool = serde_json::from_value(value)
            .map_err(|e| ChainError::decode("reward pool", e.to_string()))?;

        let mut stable = None;
        let mut reward = None;
        for reserve in &pool.assets {
            let amount: Decimal = reserve.amount.parse().map_err(|_| {
                ChainError::decode("reward pool", format!("bad amount {}", reserve.amount))
            })?;
            match &reserve.info {
                AssetInfo::NativeToken { denom } if *denom == self.contracts.stable_denom => {
                    stable = Some(amount)
                }
                AssetInfo::Token { contract_addr } if *contract_addr == self.contracts.reward_token => {
                    reward = Some(amount)
                }
                _ => {}
            }
        }

        match (stable, reward) {
            (Some(stable), Some(reward)) if !reward.is_zero() => Ok(stable / reward),
            _ => Err(ChainError::decode(
                &self.contracts.reward_pair,
                "pool is not a reward/stable pair",
            )),
        }
    }

    fn reward_token(&self) -> &str {
        &self.contracts.reward_token
    }

    fn claim_rewards(&self) -> Message {
        Message::execute(self.sender(), &self.contracts.market, json!({ "claim_rewards": {} }))
    }

    fn sell_rewards(&self, amount: Decimal) -> Message {
        cw20_send(
            self.sender(),
            &self.contracts.reward_token,
            &self.contracts.reward_pair,
            amount,
            &json!({ "swap": {} }),
        )
    }

    fn stake_rewards(&self, amount: Decimal) -> Message {
        cw20_send(
            self.sender(),
            &self.contracts.reward_token,
            &self.contracts.gov,
            amount,
            &json!({ "stake_voting_tokens": {} }),
        )
    }
}
