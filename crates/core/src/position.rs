//! Synthetic-asset CDP tracking.
//!
//! A [`SyntheticPosition`] caches one on-chain position plus the prices
//! needed to judge it. Prices and premium carry a per-cycle freshness flag:
//! the margin and compensation math refuses to run on values that were not
//! refreshed since the last [`begin_cycle`](SyntheticPosition::begin_cycle).

use rebalancer_chain::{
    AssetInfo, ChainResult, Message, OraclePrice, PoolInfo, PositionInfo, RewardInfo,
    SyntheticProtocolClient, MICRO_MULTIPLIER,
};
use rust_decimal::{Decimal, RoundingStrategy};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{EngineError, EngineResult, PositionError};
use crate::gateway::Gateway;

/// No new oracle sequence for this long means the market is closed.
pub const MINTABLE_STALENESS: Duration = Duration::from_secs(120);

/// Asset change needed to reach a target margin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Compensation {
    /// Positive burns debt, negative mints more
    pub asset_amount: Decimal,
    /// Pool-priced stable value of `|asset_amount|`
    pub stable_value: Decimal,
}

impl Compensation {
    pub fn is_burn(&self) -> bool {
        self.asset_amount > Decimal::ZERO
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticPosition {
    idx: String,
    symbol: String,
    asset_token: String,
    collateral: AssetInfo,
    is_short: bool,
    /// Micro units
    asset_amount: Decimal,
    /// Micro units
    collateral_amount: Decimal,
    asset_price: Decimal,
    collateral_price: Decimal,
    collateral_multiplier: Decimal,
    /// Protocol ratio times collateral multiplier
    min_collateral_ratio: Decimal,
    premium: Decimal,
    mintable: bool,
    last_quote: Option<(u64, Instant)>,
    price_fresh: bool,
    premium_fresh: bool,
}

fn built<T>(operation: &'static str, result: ChainResult<T>) -> EngineResult<T> {
    result.map_err(|source| EngineError::Chain { operation, source })
}

impl SyntheticPosition {
    pub fn new(
        symbol: impl Into<String>,
        info: PositionInfo,
        collateral_multiplier: Decimal,
        protocol_min_ratio: Decimal,
    ) -> Self {
        Self {
            idx: info.idx,
            symbol: symbol.into(),
            asset_token: info.asset.key().to_string(),
            collateral: info.collateral,
            is_short: info.is_short,
            asset_amount: info.asset_amount,
            collateral_amount: info.collateral_amount,
            asset_price: Decimal::ZERO,
            collateral_price: Decimal::ZERO,
            collateral_multiplier,
            min_collateral_ratio: protocol_min_ratio * collateral_multiplier,
            premium: Decimal::ONE,
            mintable: true,
            last_quote: None,
            price_fresh: false,
            premium_fresh: false,
        }
    }

    /// Load the multiplier, asset config and first quote of a discovered position.
    pub async fn discover(
        gateway: &Gateway,
        symbol: &str,
        info: PositionInfo,
        now: Instant,
    ) -> EngineResult<Self> {
        let synthetic = gateway.synthetic();
        let asset_token = info.asset.key().to_string();
        let (multiplier, config, quote) = futures::try_join!(
            gateway.call(
                "get_collateral_multiplier",
                synthetic.get_collateral_multiplier(info.collateral.key())
            ),
            gateway.call("get_asset_config", synthetic.get_asset_config(&asset_token)),
            gateway.call(
                "get_oracle_price",
                synthetic.get_oracle_price(gateway.stable_denom(), &asset_token)
            ),
        )?;

        let mut position = Self::new(symbol, info, multiplier, config.min_collateral_ratio);
        position.observe_quote(quote.last_updated_quote, now);
        debug!(
            idx = %position.idx,
            symbol = %position.symbol,
            short = position.is_short,
            mcr = %position.min_collateral_ratio,
            "Position discovered"
        );
        Ok(position)
    }

    pub fn idx(&self) -> &str {
        &self.idx
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn asset_token(&self) -> &str {
        &self.asset_token
    }

    pub fn collateral(&self) -> &AssetInfo {
        &self.collateral
    }

    pub fn is_short(&self) -> bool {
        self.is_short
    }

    pub fn mintable(&self) -> bool {
        self.mintable
    }

    pub fn premium(&self) -> Decimal {
        self.premium
    }

    pub fn asset_price(&self) -> Decimal {
        self.asset_price
    }

    pub fn collateral_price(&self) -> Decimal {
        self.collateral_price
    }

    pub fn min_collateral_ratio(&self) -> Decimal {
        self.min_collateral_ratio
    }

    /// Debt in whole asset units.
    pub fn asset_amount(&self) -> Decimal {
        self.asset_amount / MICRO_MULTIPLIER
    }

    /// Invalidate prices and premium for a new cycle.
    pub fn begin_cycle(&mut self) {
        self.price_fresh = false;
        self.premium_fresh = false;
    }

    /// Debounce the market-open flag on the oracle sequence.
    pub fn observe_quote(&mut self, sequence: u64, now: Instant) {
        match self.last_quote {
            Some((seen, observed_at)) if seen == sequence => {
                if now.saturating_duration_since(observed_at) >= MINTABLE_STALENESS {
                    if self.mintable {
                        debug!(idx = %self.idx, sequence, "Oracle quiet, position not mintable");
                    }
                    self.mintable = false;
                }
            }
            _ => {
                self.last_quote = Some((sequence, now));
                self.mintable = true;
            }
        }
    }

    pub async fn refresh_price_and_mintability(
        &mut self,
        gateway: &Gateway,
        now: Instant,
    ) -> EngineResult<()> {
        let synthetic = gateway.synthetic();
        let (collateral_price, oracle) = futures::try_join!(
            gateway.call(
                "get_collateral_price",
                synthetic.get_collateral_price(self.collateral.key())
            ),
            gateway.call(
                "get_oracle_price",
                synthetic.get_oracle_price(gateway.stable_denom(), &self.asset_token)
            ),
        )?;
        self.apply_prices(oracle, collateral_price, now)?;
        Ok(())
    }

    pub fn apply_prices(
        &mut self,
        oracle: OraclePrice,
        collateral_price: Decimal,
        now: Instant,
    ) -> Result<(), PositionError> {
        if oracle.rate <= Decimal::ZERO {
            return Err(self.zero("oracle rate"));
        }
        if collateral_price <= Decimal::ZERO {
            return Err(self.zero("collateral price"));
        }
        self.asset_price = Decimal::ONE / oracle.rate;
        self.collateral_price = collateral_price;
        self.observe_quote(oracle.last_updated_quote, now);
        self.price_fresh = true;
        Ok(())
    }

    /// Re-read amounts and the minimum collateral ratio.
    pub async fn refresh_amounts(&mut self, gateway: &Gateway) -> EngineResult<()> {
        let synthetic = gateway.synthetic();
        let (info, config) = futures::try_join!(
            gateway.call("get_position", synthetic.get_position(&self.idx)),
            gateway.call("get_asset_config", synthetic.get_asset_config(&self.asset_token)),
        )?;
        self.apply_amounts(&info, config.min_collateral_ratio);
        Ok(())
    }

    pub fn apply_amounts(&mut self, info: &PositionInfo, protocol_min_ratio: Decimal) {
        self.asset_amount = info.asset_amount;
        self.collateral_amount = info.collateral_amount;
        self.min_collateral_ratio = protocol_min_ratio * self.collateral_multiplier;
    }

    /// Pool price over oracle price. Requires fresh prices.
    pub async fn refresh_premium(&mut self, gateway: &Gateway) -> EngineResult<Decimal> {
        self.require_price()?;
        let pool = gateway
            .call(
                "get_pool_info",
                gateway.synthetic().get_pool_info(&self.asset_token),
            )
            .await?;
        Ok(self.apply_pool(&pool)?)
    }

    pub fn apply_pool(&mut self, pool: &PoolInfo) -> Result<Decimal, PositionError> {
        self.require_price()?;
        let pool_price = pool.price().ok_or_else(|| self.zero("pool asset reserve"))?;
        self.premium = pool_price / self.asset_price;
        self.premium_fresh = true;
        Ok(self.premium)
    }

    /// Collateral value in stable.
    pub fn collateral_value(&self) -> Decimal {
        self.collateral_amount * self.collateral_price / MICRO_MULTIPLIER
    }

    /// Debt value in stable at the oracle price.
    pub fn debt_value(&self) -> Decimal {
        self.asset_amount * self.asset_price / MICRO_MULTIPLIER
    }

    /// `collateral / (debt * min_ratio) - 1`.
    pub fn relative_ocr_margin(&self) -> Result<Decimal, PositionError> {
        self.require_price()?;
        let debt = self.debt_value();
        if debt.is_zero() {
            return Err(PositionError::ZeroDebt {
                idx: self.idx.clone(),
            });
        }
        Ok(self.collateral_value() / (debt * self.min_collateral_ratio) - Decimal::ONE)
    }

    /// Debt change that puts the margin at `target` (fraction, 0.11 = 11%).
    pub fn amount_to_compensate(&self, target: Decimal) -> Result<Compensation, PositionError> {
        self.require_price()?;
        self.require_premium()?;
        let debt = self.debt_value();
        if debt.is_zero() {
            return Err(PositionError::ZeroDebt {
                idx: self.idx.clone(),
            });
        }

        let target_debt =
            self.collateral_value() / (self.min_collateral_ratio * (Decimal::ONE + target));
        let asset_amount = (debt - target_debt) / self.asset_price;
        Ok(Compensation {
            asset_amount,
            stable_value: asset_amount.abs() * self.asset_price * self.premium,
        })
    }

    /// Collateral value to add so the margin reaches `target`. Negative when
    /// the margin is already above it.
    pub fn collateral_to_compensate(&self, target: Decimal) -> Result<Decimal, PositionError> {
        self.require_price()?;
        Ok((Decimal::ONE + target) * self.debt_value() * self.min_collateral_ratio
            - self.collateral_value())
    }

    /// Collateral units worth `value` stable.
    pub fn collateral_units(&self, value: Decimal) -> Decimal {
        if self.collateral_price.is_zero() {
            return Decimal::ZERO;
        }
        value / self.collateral_price
    }

    /// Price of one asset unit in the pool.
    pub fn pool_price(&self) -> Decimal {
        self.asset_price * self.premium
    }

    fn require_price(&self) -> Result<(), PositionError> {
        if !self.price_fresh {
            return Err(PositionError::Stale {
                idx: self.idx.clone(),
                what: "price",
            });
        }
        Ok(())
    }

    fn require_premium(&self) -> Result<(), PositionError> {
        if !self.premium_fresh {
            return Err(PositionError::Stale {
                idx: self.idx.clone(),
                what: "premium",
            });
        }
        Ok(())
    }

    fn zero(&self, what: &'static str) -> PositionError {
        PositionError::ZeroPrice {
            idx: self.idx.clone(),
            what,
        }
    }

    pub fn burn_msg(&self, synthetic: &dyn SyntheticProtocolClient, amount: Decimal) -> EngineResult<Message> {
        built("burn", synthetic.burn(&self.idx, &self.asset_token, amount))
    }

    pub fn mint_msg(&self, synthetic: &dyn SyntheticProtocolClient, amount: Decimal) -> EngineResult<Message> {
        built("mint", synthetic.mint(&self.idx, &self.asset_token, amount))
    }

    /// Deposit collateral worth `value` stable.
    pub fn deposit_msg(&self, synthetic: &dyn SyntheticProtocolClient, value: Decimal) -> EngineResult<Message> {
        let units = self.collateral_units(value);
        built("deposit", synthetic.deposit(&self.idx, &self.collateral, units))
    }

    /// Withdraw collateral worth `value` stable.
    pub fn withdraw_msg(&self, synthetic: &dyn SyntheticProtocolClient, value: Decimal) -> EngineResult<Message> {
        let units = self.collateral_units(value);
        built("withdraw", synthetic.withdraw(&self.idx, &self.collateral, units))
    }

    pub fn unstake_msg(&self, synthetic: &dyn SyntheticProtocolClient, lp: Decimal) -> EngineResult<Message> {
        built("unstake", synthetic.unstake(&self.asset_token, lp))
    }

    pub fn unbond_msg(&self, synthetic: &dyn SyntheticProtocolClient, lp: Decimal) -> EngineResult<Message> {
        built("withdraw_liquidity", synthetic.withdraw_liquidity(&self.asset_token, lp))
    }

    pub fn buy_and_lp_msgs(
        &self,
        synthetic: &dyn SyntheticProtocolClient,
        asset_amount: Decimal,
        swap_stable: Decimal,
        lp_stable: Decimal,
    ) -> EngineResult<Vec<Message>> {
        built(
            "swap_and_provide_liquidity",
            synthetic.swap_and_provide_liquidity(&self.asset_token, asset_amount, swap_stable, lp_stable),
        )
    }

    pub fn stake_msgs(
        &self,
        synthetic: &dyn SyntheticProtocolClient,
        asset_amount: Decimal,
        stable_amount: Decimal,
    ) -> EngineResult<Vec<Message>> {
        built("stake", synthetic.stake(&self.asset_token, asset_amount, stable_amount))
    }
}

/// LP tokens to withdraw for `asset_amount` of the asset side.
///
/// Proportional withdrawal: `asset * total_share / asset_reserve`, rounded
/// up to the micro unit.
pub fn lp_for_asset(pool: &PoolInfo, asset_amount: Decimal) -> Option<Decimal> {
    if pool.asset_reserve.is_zero() || asset_amount <= Decimal::ZERO {
        return None;
    }
    let lp = asset_amount * pool.total_share / pool.asset_reserve;
    Some(lp.round_dp_with_strategy(6, RoundingStrategy::AwayFromZero))
}

/// Asset side of `lp` LP tokens.
pub fn asset_for_lp(pool: &PoolInfo, lp: Decimal) -> Decimal {
    if pool.total_share.is_zero() {
        return Decimal::ZERO;
    }
    lp * pool.asset_reserve / pool.total_share
}

/// Long (non-short) LP the wallet has bonded, whole units.
pub fn staked_long_lp(rewards: &[RewardInfo]) -> Decimal {
    rewards
        .iter()
        .filter(|r| !r.is_short)
        .map(|r| r.bond_amount)
        .sum::<Decimal>()
        / MICRO_MULTIPLIER
}
