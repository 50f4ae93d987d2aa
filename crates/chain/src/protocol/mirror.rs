//! Mirror-style synthetic asset protocol.
//!
//! CDPs live in the mint contract, prices come from the oracle and the
//! collateral oracle, each asset trades against the stable in its own AMM
//! pair and LP tokens are bonded in the staking contract.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::{cw20_increase_allowance, cw20_send, AssetConfig, SyntheticProtocolClient};
use crate::client::ChainClient;
use crate::error::{ChainError, ChainResult};
use crate::types::{
    parse_decimal, AssetInfo, Coin, Message, OraclePrice, PoolInfo, PositionInfo, RewardInfo,
    SwapSimulation,
};

/// Protocol-wide contract addresses.
#[derive(Debug, Clone)]
pub struct MirrorContracts {
    pub mint: String,
    pub oracle: String,
    pub staking: String,
    pub collateral_oracle: String,
    /// Native denom the pairs quote against
    pub stable_denom: String,
}

/// One listed synthetic asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorAsset {
    pub symbol: String,
    pub token: String,
    pub pair: String,
    pub lp_token: String,
}

#[derive(Debug, Deserialize)]
struct RawAsset {
    info: AssetInfo,
    amount: String,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    idx: String,
    collateral: RawAsset,
    asset: RawAsset,
    #[serde(default)]
    is_short: bool,
}

#[derive(Debug, Deserialize)]
struct RawPositions {
    positions: Vec<RawPosition>,
}

#[derive(Debug, Deserialize)]
struct RawPool {
    assets: Vec<RawAsset>,
    total_share: String,
}

#[derive(Debug, Deserialize)]
struct RawRewardInfo {
    bond_amount: String,
    #[serde(default)]
    is_short: bool,
}

#[derive(Debug, Deserialize)]
struct RawRewardInfos {
    reward_infos: Vec<RawRewardInfo>,
}

fn micro(amount: &str, context: &str) -> ChainResult<Decimal> {
    amount
        .parse()
        .map_err(|_| ChainError::decode(context, format!("bad amount {amount}")))
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, context: &str) -> ChainResult<T> {
    serde_json::from_value(value).map_err(|e| ChainError::decode(context, e.to_string()))
}

impl TryFrom<RawPosition> for PositionInfo {
    type Error = ChainError;

    fn try_from(raw: RawPosition) -> ChainResult<Self> {
        Ok(PositionInfo {
            collateral_amount: micro(&raw.collateral.amount, "position collateral")?,
            asset_amount: micro(&raw.asset.amount, "position asset")?,
            idx: raw.idx,
            collateral: raw.collateral.info,
            asset: raw.asset.info,
            is_short: raw.is_short,
        })
    }
}

/// Mirror protocol bound to one wallet.
#[derive(Debug)]
pub struct MirrorProtocol {
    contracts: MirrorContracts,
    assets: Vec<MirrorAsset>,
    chain: Arc<dyn ChainClient>,
}

impl MirrorProtocol {
    pub fn new(chain: Arc<dyn ChainClient>, contracts: MirrorContracts, assets: Vec<MirrorAsset>) -> Self {
        Self {
            contracts,
            assets,
            chain,
        }
    }

    pub fn assets(&self) -> &[MirrorAsset] {
        &self.assets
    }

    fn sender(&self) -> &str {
        self.chain.address()
    }

    fn listed(&self, asset_token: &str) -> ChainResult<&MirrorAsset> {
        self.assets
            .iter()
            .find(|a| a.token == asset_token)
            .ok_or_else(|| ChainError::UnknownAsset(asset_token.to_string()))
    }

    fn stable_asset(&self, amount: Decimal) -> Value {
        AssetInfo::native(&self.contracts.stable_denom).to_asset_json(amount)
    }

    fn stable_coins(&self, amount: Decimal) -> Vec<Coin> {
        vec![Coin::from_whole(&self.contracts.stable_denom, amount)]
    }

    /// Provide liquidity through the staking contract and bond the LP.
    fn auto_stake(&self, asset_token: &str, asset_amount: Decimal, stable_amount: Decimal) -> Vec<Message> {
        let sender = self.sender();
        vec![
            cw20_increase_allowance(sender, asset_token, &self.contracts.staking, asset_amount),
            Message::execute(
                sender,
                &self.contracts.staking,
                json!({
                    "auto_stake": {
                        "assets": [
                            self.stable_asset(stable_amount),
                            AssetInfo::token(asset_token).to_asset_json(asset_amount),
                        ],
                        "slippage_tolerance": null,
                    }
                }),
            )
            .with_coins(self.stable_coins(stable_amount)),
        ]
    }
}

#[async_trait]
impl SyntheticProtocolClient for MirrorProtocol {
    async fn get_positions(&self, owner: &str) -> ChainResult<Vec<PositionInfo>> {
        let query = json!({ "positions": { "owner_addr": owner } });
        let value = self.chain.query_contract(&self.contracts.mint, &query).await?;
        let raw: RawPositions = decode(value, "positions")?;
        raw.positions.into_iter().map(PositionInfo::try_from).collect()
    }

    async fn get_position(&self, idx: &str) -> ChainResult<PositionInfo> {
        let query = json!({ "position": { "position_idx": idx } });
        let value = self.chain.query_contract(&self.contracts.mint, &query).await?;
        let raw: RawPosition = decode(value, "position")?;
        PositionInfo::try_from(raw)
    }

    async fn get_asset_config(&self, asset_token: &str) -> ChainResult<AssetConfig> {
        let query = json!({ "asset_config": { "asset_token": asset_token } });
        let value = self.chain.query_contract(&self.contracts.mint, &query).await?;
        let min_collateral_ratio = parse_decimal(&value["min_collateral_ratio"])
            .ok_or_else(|| ChainError::decode("asset_config", "missing min_collateral_ratio"))?;
        Ok(AssetConfig {
            min_collateral_ratio,
        })
    }

    async fn get_collateral_price(&self, collateral: &str) -> ChainResult<Decimal> {
        let query = json!({ "collateral_price": { "asset": collateral } });
        let value = self
            .chain
            .query_contract(&self.contracts.collateral_oracle, &query)
            .await?;
        parse_decimal(&value["rate"])
            .ok_or_else(|| ChainError::decode("collateral_price", "missing rate"))
    }

    async fn get_collateral_multiplier(&self, collateral: &str) -> ChainResult<Decimal> {
        let query = json!({ "collateral_asset_info": { "asset": collateral } });
        let value = self
            .chain
            .query_contract(&self.contracts.collateral_oracle, &query)
            .await?;
        parse_decimal(&value["multiplier"])
            .ok_or_else(|| ChainError::decode("collateral_asset_info", "missing multiplier"))
    }

    async fn get_oracle_price(&self, denom: &str, asset_token: &str) -> ChainResult<OraclePrice> {
        let query = json!({ "price": { "base_asset": denom, "quote_asset": asset_token } });
        let value = self.chain.query_contract(&self.contracts.oracle, &query).await?;
        let rate = parse_decimal(&value["rate"])
            .ok_or_else(|| ChainError::decode("oracle price", "missing rate"))?;
        let last_updated_quote = value["last_updated_quote"]
            .as_u64()
            .ok_or_else(|| ChainError::decode("oracle price", "missing last_updated_quote"))?;

        Ok(OraclePrice {
            rate,
            last_updated_quote,
        })
    }

    async fn get_pool_info(&self, asset_token: &str) -> ChainResult<PoolInfo> {
        let asset = self.listed(asset_token)?;
        let value = self.chain.query_contract(&asset.pair, &json!({ "pool": {} })).await?;
        let raw: RawPool = decode(value, "pool")?;

        let mut stable_reserve = None;
        let mut asset_reserve = None;
        for reserve in &raw.assets {
            let amount = micro(&reserve.amount, "pool reserve")?;
            match &reserve.info {
                AssetInfo::NativeToken { denom } if *denom == self.contracts.stable_denom => {
                    stable_reserve = Some(amount)
                }
                AssetInfo::Token { contract_addr } if *contract_addr == asset.token => {
                    asset_reserve = Some(amount)
                }
                _ => {}
            }
        }

        match (stable_reserve, asset_reserve) {
            (Some(stable_reserve), Some(asset_reserve)) => Ok(PoolInfo {
                stable_reserve,
                asset_reserve,
                total_share: micro(&raw.total_share, "pool total_share")?,
            }),
            _ => Err(ChainError::decode(&asset.pair, "pool is not an asset/stable pair")),
        }
    }

    async fn get_reward_info(&self, owner: &str, asset_token: &str) -> ChainResult<Vec<RewardInfo>> {
        let query = json!({ "reward_info": { "staker_addr": owner, "asset_token": asset_token } });
        let value = self.chain.query_contract(&self.contracts.staking, &query).await?;
        let raw: RawRewardInfos = decode(value, "reward_info")?;

        raw.reward_infos
            .into_iter()
            .map(|info| {
                Ok(RewardInfo {
                    bond_amount: micro(&info.bond_amount, "bond_amount")?,
                    is_short: info.is_short,
                })
            })
            .collect()
    }

    async fn reverse_simulate(&self, asset_token: &str, amount: Decimal) -> ChainResult<SwapSimulation> {
        let asset = self.listed(asset_token)?;
        let query = json!({
            "reverse_simulation": {
                "ask_asset": AssetInfo::token(asset_token).to_asset_json(amount)
            }
        });
        let value = self.chain.query_contract(&asset.pair, &query).await?;
        let field = |name: &str| {
            parse_decimal(&value[name])
                .ok_or_else(|| ChainError::decode("reverse_simulation", format!("missing {name}")))
        };

        let simulation = SwapSimulation {
            offer_amount: field("offer_amount")?,
            spread_amount: field("spread_amount")?,
            commission_amount: field("commission_amount")?,
        };
        debug!(asset = %asset.symbol, amount = %amount, cost = %simulation.total_cost(), "Reverse simulation");
        Ok(simulation)
    }

    fn asset_token(&self, symbol: &str) -> Option<&str> {
        self.assets
            .iter()
            .find(|a| a.symbol == symbol)
            .map(|a| a.token.as_str())
    }

    fn mint(&self, idx: &str, asset_token: &str, amount: Decimal) -> ChainResult<Message> {
        self.listed(asset_token)?;
        Ok(Message::execute(
            self.sender(),
            &self.contracts.mint,
            json!({
                "mint": {
                    "position_idx": idx,
                    "asset": AssetInfo::token(asset_token).to_asset_json(amount),
                }
            }),
        ))
    }

    fn burn(&self, idx: &str, asset_token: &str, amount: Decimal) -> ChainResult<Message> {
        self.listed(asset_token)?;
        Ok(cw20_send(
            self.sender(),
            asset_token,
            &self.contracts.mint,
            amount,
            &json!({ "burn": { "position_idx": idx } }),
        ))
    }

    fn deposit(&self, idx: &str, collateral: &AssetInfo, amount: Decimal) -> ChainResult<Message> {
        let sender = self.sender();
        Ok(match collateral {
            AssetInfo::Token { contract_addr } => cw20_send(
                sender,
                contract_addr,
                &self.contracts.mint,
                amount,
                &json!({ "deposit": { "position_idx": idx } }),
            ),
            AssetInfo::NativeToken { denom } => Message::execute(
                sender,
                &self.contracts.mint,
                json!({
                    "deposit": {
                        "position_idx": idx,
                        "collateral": collateral.to_asset_json(amount),
                    }
                }),
            )
            .with_coins(vec![Coin::from_whole(denom, amount)]),
        })
    }

    fn withdraw(&self, idx: &str, collateral: &AssetInfo, amount: Decimal) -> ChainResult<Message> {
        Ok(Message::execute(
            self.sender(),
            &self.contracts.mint,
            json!({
                "withdraw": {
                    "position_idx": idx,
                    "collateral": collateral.to_asset_json(amount),
                }
            }),
        ))
    }

    fn stake(&self, asset_token: &str, asset_amount: Decimal, stable_amount: Decimal) -> ChainResult<Vec<Message>> {
        self.listed(asset_token)?;
        Ok(self.auto_stake(asset_token, asset_amount, stable_amount))
    }

    fn unstake(&self, asset_token: &str, lp_amount: Decimal) -> ChainResult<Message> {
        self.listed(asset_token)?;
        Ok(Message::execute(
            self.sender(),
            &self.contracts.staking,
            json!({
                "unbond": {
                    "asset_token": asset_token,
                    "amount": crate::types::to_micro_string(lp_amount),
                }
            }),
        ))
    }

    fn withdraw_liquidity(&self, asset_token: &str, lp_amount: Decimal) -> ChainResult<Message> {
        let asset = self.listed(asset_token)?;
        Ok(cw20_send(
            self.sender(),
            &asset.lp_token,
            &asset.pair,
            lp_amount,
            &json!({ "withdraw_liquidity": {} }),
        ))
    }

    fn swap_and_provide_liquidity(
        &self,
        asset_token: &str,
        asset_amount: Decimal,
        swap_stable: Decimal,
        lp_stable: Decimal,
    ) -> ChainResult<Vec<Message>> {
        let asset = self.listed(asset_token)?;
        let sender = self.sender();

        let mut messages = vec![Message::execute(
            sender,
            &asset.pair,
            json!({
                "swap": {
                    "offer_asset": self.stable_asset(swap_stable),
                    "to": sender,
                }
            }),
        )
        .with_coins(self.stable_coins(swap_stable))];
        messages.extend(self.auto_stake(asset_token, asset_amount, lp_stable));
        Ok(messages)
    }
}
