//! Stable liquidity sourcing.
//!
//! Given a stable requirement, decide how much comes from wallet cash, the
//! money-market deposit, optionally sold borrower rewards, and unwinding the
//! largest mintable synthetic position, and build the operations that free
//! it.

use rebalancer_api::FundingEvent;
use rebalancer_chain::AssetInfo;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::config::SourcingConfig;
use crate::error::EngineResult;
use crate::gateway::Gateway;
use crate::position::{asset_for_lp, lp_for_asset, staked_long_lp, SyntheticPosition};
use crate::queue::{Operation, OperationKind};
use crate::snapshot::CycleSnapshot;

/// Where the requirement is funded from and the operations that free it.
#[derive(Debug, Clone, PartialEq)]
pub struct FundingPlan {
    pub required: Decimal,
    pub from_cash: Decimal,
    pub from_deposit: Decimal,
    pub from_rewards: Decimal,
    pub from_unwind: Decimal,
    pub shortfall: Decimal,
    pub operations: Vec<Operation>,
    /// Position the unwind drew from
    pub unwound: Option<String>,
}

impl FundingPlan {
    fn new(required: Decimal) -> Self {
        Self {
            required,
            from_cash: Decimal::ZERO,
            from_deposit: Decimal::ZERO,
            from_rewards: Decimal::ZERO,
            from_unwind: Decimal::ZERO,
            shortfall: Decimal::ZERO,
            operations: Vec::new(),
            unwound: None,
        }
    }

    /// Stable the plan makes available.
    pub fn funded(&self) -> Decimal {
        (self.from_cash + self.from_deposit + self.from_rewards + self.from_unwind)
            .min(self.required)
    }

    pub fn is_fully_funded(&self) -> bool {
        self.shortfall <= Decimal::ZERO
    }

    pub fn to_event(&self) -> FundingEvent {
        FundingEvent {
            required: self.required,
            from_cash: self.from_cash,
            from_deposit: self.from_deposit,
            from_rewards: self.from_rewards,
            from_unwind: self.from_unwind,
            shortfall: self.shortfall,
        }
    }
}

/// How withdrawn collateral turns into stable.
enum Redemption {
    /// Deposit token, redeemed at the money market
    Deposit,
    /// Already the stable
    Stable,
    /// Not counted toward the requirement
    Other,
}

#[derive(Debug, Clone)]
pub struct LiquiditySourcer {
    cash_buffer: Decimal,
    deposit_dust: Decimal,
    use_rewards: bool,
}

impl LiquiditySourcer {
    pub fn new(config: &SourcingConfig) -> Self {
        Self {
            cash_buffer: config.cash_buffer,
            deposit_dust: config.deposit_dust,
            use_rewards: config.use_rewards,
        }
    }

    /// Plan funding for `required` stable.
    #[instrument(skip_all, fields(required = %required))]
    pub async fn plan(
        &self,
        gateway: &Gateway,
        snapshot: &CycleSnapshot,
        positions: &mut [SyntheticPosition],
        required: Decimal,
        now: Instant,
    ) -> EngineResult<FundingPlan> {
        let mut plan = FundingPlan::new(required);
        if required <= Decimal::ZERO {
            return Ok(plan);
        }

        let cash = snapshot.cash.max(Decimal::ZERO);
        if cash >= required + self.cash_buffer {
            plan.from_cash = required;
            debug!(cash = %cash, "Funded from cash");
            return Ok(plan);
        }

        let market = gateway.market();
        if snapshot.deposit >= required {
            plan.from_cash = cash.min(required);
            plan.from_deposit = required - plan.from_cash;
            if plan.from_deposit > Decimal::ZERO {
                plan.operations.push(Operation::new(
                    OperationKind::WithdrawDeposit,
                    market.withdraw_stable(snapshot.deposit_tokens_for(plan.from_deposit)),
                ));
            }
            debug!(from_cash = %plan.from_cash, from_deposit = %plan.from_deposit, "Funded from deposit");
            return Ok(plan);
        }

        plan.from_cash = cash.min(required);
        let mut remaining = required - plan.from_cash;

        if remaining > Decimal::ZERO && snapshot.deposit > self.deposit_dust {
            plan.from_deposit = snapshot.deposit.min(remaining);
            remaining -= plan.from_deposit;
            plan.operations.push(Operation::new(
                OperationKind::WithdrawDeposit,
                market.withdraw_stable(snapshot.deposit_tokens_for(plan.from_deposit)),
            ));
        }

        if remaining > Decimal::ZERO && self.use_rewards {
            plan.from_rewards = self.sell_rewards(gateway, remaining, &mut plan).await?;
            remaining -= plan.from_rewards;
        }

        if remaining > Decimal::ZERO {
            let target = positions
                .iter_mut()
                .filter(|p| p.mintable() && p.collateral_value() > Decimal::ZERO)
                .max_by(|a, b| a.collateral_value().cmp(&b.collateral_value()));

            match target {
                Some(position) => {
                    let freed = self
                        .unwind(gateway, snapshot, position, remaining, now, &mut plan)
                        .await?;
                    plan.from_unwind = freed;
                    remaining -= freed;
                }
                None => info!(remaining = %remaining, "No mintable position to unwind"),
            }
        }

        plan.shortfall = remaining.max(Decimal::ZERO);
        Ok(plan)
    }

    /// Claim pending rewards, sell enough of them for `needed` stable and
    /// stake whatever is left.
    async fn sell_rewards(
        &self,
        gateway: &Gateway,
        needed: Decimal,
        plan: &mut FundingPlan,
    ) -> EngineResult<Decimal> {
        let market = gateway.market();
        let (pending, held, price) = futures::try_join!(
            gateway.call("get_pending_rewards", market.get_pending_rewards(gateway.address())),
            gateway.token_balance(market.reward_token()),
            gateway.call("get_reward_price", market.get_reward_price()),
        )?;
        let pending = pending.max(Decimal::ZERO);
        let total = pending + held.max(Decimal::ZERO);
        if total <= Decimal::ZERO || price <= Decimal::ZERO {
            debug!(total = %total, price = %price, "No rewards to sell");
            return Ok(Decimal::ZERO);
        }

        let (sell, freed) = if total * price >= needed {
            (needed / price, needed)
        } else {
            (total, total * price)
        };

        if pending > Decimal::ZERO {
            plan.operations.push(Operation::new(
                OperationKind::ClaimRewards,
                market.claim_rewards(),
            ));
        }
        plan.operations.push(Operation::new(
            OperationKind::SellRewards,
            market.sell_rewards(sell),
        ));
        let stake = total - sell;
        if stake > Decimal::ZERO {
            plan.operations.push(Operation::new(
                OperationKind::StakeRewards,
                market.stake_rewards(stake),
            ));
        }

        info!(
            claimed = %pending,
            sold = %sell,
            staked = %stake,
            price = %price,
            freed = %freed,
            "Selling rewards"
        );
        Ok(freed)
    }

    /// Burn debt and withdraw collateral from `position` at its current
    /// collateral ratio to free about `needed` stable.
    ///
    /// Wallet-held asset is burned first; the rest comes out of staked long
    /// LP and is capped by what is staked.
    async fn unwind(
        &self,
        gateway: &Gateway,
        snapshot: &CycleSnapshot,
        position: &mut SyntheticPosition,
        needed: Decimal,
        now: Instant,
        plan: &mut FundingPlan,
    ) -> EngineResult<Decimal> {
        position.refresh_amounts(gateway).await?;
        position.refresh_price_and_mintability(gateway, now).await?;
        if !position.mintable() {
            info!(idx = %position.idx(), "Unwind target closed since selection");
            return Ok(Decimal::ZERO);
        }
        position.refresh_premium(gateway).await?;

        let synthetic = gateway.synthetic();
        let (wallet_asset, pool, rewards) = futures::try_join!(
            gateway.token_balance(position.asset_token()),
            gateway.call("get_pool_info", synthetic.get_pool_info(position.asset_token())),
            gateway.call(
                "get_reward_info",
                synthetic.get_reward_info(gateway.address(), position.asset_token())
            ),
        )?;

        let price = position.asset_price();
        let debt = position.debt_value();
        let collateral = position.collateral_value();
        let redemption = self.redemption(gateway, position.collateral());

        plan.unwound = Some(position.idx().to_string());

        // no debt left: collateral can leave freely
        if debt.is_zero() {
            let withdraw = needed.min(collateral);
            self.withdraw_collateral(gateway, snapshot, position, withdraw, &redemption, plan)?;
            return Ok(self.counted(withdraw, &redemption));
        }

        let ltv = debt / collateral;
        let wallet_burn = wallet_asset.max(Decimal::ZERO).min(position.asset_amount());
        let wallet_value = wallet_burn * price / ltv;

        let mut lp = Decimal::ZERO;
        let mut lp_asset = Decimal::ZERO;
        let rest = needed - wallet_value;
        if rest > Decimal::ZERO {
            let headroom = (debt - wallet_burn * price).max(Decimal::ZERO);
            let burn_value = (rest * ltv / (Decimal::ONE + ltv * position.premium())).min(headroom);
            let wanted = burn_value / price;
            let staked = staked_long_lp(&rewards);

            match lp_for_asset(&pool, wanted) {
                Some(required_lp) if required_lp <= staked => {
                    lp = required_lp;
                    lp_asset = wanted;
                }
                Some(required_lp) => {
                    info!(
                        required_lp = %required_lp,
                        staked = %staked,
                        "Staked liquidity caps the unwind"
                    );
                    lp = staked;
                    lp_asset = asset_for_lp(&pool, staked);
                }
                None => {}
            }
        }

        if lp > Decimal::ZERO {
            plan.operations.push(Operation::new(
                OperationKind::Unstake,
                position.unstake_msg(synthetic, lp)?,
            ));
            plan.operations.push(Operation::new(
                OperationKind::WithdrawLiquidity,
                position.unbond_msg(synthetic, lp)?,
            ));
        }

        let burn = lp_asset + wallet_burn;
        if burn > Decimal::ZERO {
            plan.operations.push(Operation::new(
                OperationKind::Burn,
                position.burn_msg(synthetic, burn)?,
            ));
        }

        let lp_value = lp_asset * price;
        let withdraw = wallet_value + lp_value / ltv;
        self.withdraw_collateral(gateway, snapshot, position, withdraw, &redemption, plan)?;

        let freed = self.counted(withdraw, &redemption) + lp_value * position.premium();
        info!(
            idx = %position.idx(),
            lp = %lp,
            burn = %burn,
            withdraw = %withdraw,
            freed = %freed,
            "Unwinding position"
        );
        Ok(freed)
    }

    fn withdraw_collateral(
        &self,
        gateway: &Gateway,
        snapshot: &CycleSnapshot,
        position: &SyntheticPosition,
        value: Decimal,
        redemption: &Redemption,
        plan: &mut FundingPlan,
    ) -> EngineResult<()> {
        if value <= Decimal::ZERO {
            return Ok(());
        }
        plan.operations.push(Operation::new(
            OperationKind::WithdrawCollateral,
            position.withdraw_msg(gateway.synthetic(), value)?,
        ));
        if let Redemption::Deposit = redemption {
            plan.operations.push(Operation::new(
                OperationKind::WithdrawDeposit,
                gateway
                    .market()
                    .withdraw_stable(snapshot.deposit_tokens_for(value)),
            ));
        }
        Ok(())
    }

    fn redemption(&self, gateway: &Gateway, collateral: &AssetInfo) -> Redemption {
        match collateral {
            AssetInfo::Token { contract_addr } if contract_addr == gateway.market().deposit_token() => {
                Redemption::Deposit
            }
            AssetInfo::NativeToken { denom } if denom == gateway.stable_denom() => Redemption::Stable,
            _ => Redemption::Other,
        }
    }

    fn counted(&self, value: Decimal, redemption: &Redemption) -> Decimal {
        match redemption {
            Redemption::Deposit | Redemption::Stable => value,
            Redemption::Other => Decimal::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, actions, amount_of, Harness, ASSET, REWARD_TOKEN};
    use rebalancer_chain::{Message, OraclePrice, RewardInfo, MICRO_MULTIPLIER};
    use rust_decimal_macros::dec;

    fn sourcer() -> LiquiditySourcer {
        LiquiditySourcer::new(&SourcingConfig::default())
    }

    fn reward_sourcer() -> LiquiditySourcer {
        LiquiditySourcer::new(&SourcingConfig {
            use_rewards: true,
            ..Default::default()
        })
    }

    fn snapshot(cash: Decimal, deposit: Decimal) -> CycleSnapshot {
        CycleSnapshot {
            cash,
            deposit,
            exchange_rate: dec!(1.25),
            taken_at: Instant::now(),
        }
    }

    fn messages(plan: &FundingPlan) -> Vec<Message> {
        crate::queue::messages_of(&plan.operations)
    }

    /// 1000 aUST at 1.25 against 8 asset at 100, premium 1.02.
    async fn unwindable(harness: &Harness) -> Vec<SyntheticPosition> {
        let info = testing::position("1", dec!(1000), dec!(8), true);
        harness.synthetic.set_positions(vec![info.clone()]);
        let mut position = SyntheticPosition::new(testing::SYMBOL, info, dec!(1), dec!(1.5));
        let quote = OraclePrice {
            rate: dec!(0.01),
            last_updated_quote: 1,
        };
        position.apply_prices(quote, dec!(1.25), Instant::now()).unwrap();
        vec![position]
    }

    fn stake_long_lp(harness: &Harness, lp: Decimal) {
        harness.synthetic.state.lock().rewards = vec![RewardInfo {
            bond_amount: lp * MICRO_MULTIPLIER,
            is_short: false,
        }];
    }

    #[tokio::test]
    async fn test_zero_requirement_issues_nothing() {
        let harness = Harness::new();
        let mut positions = unwindable(&harness).await;
        let plan = sourcer()
            .plan(&harness.gateway, &snapshot(dec!(0), dec!(0)), &mut positions, Decimal::ZERO, Instant::now())
            .await
            .unwrap();
        assert!(plan.operations.is_empty());
        assert_eq!(plan.funded(), Decimal::ZERO);
        assert!(plan.is_fully_funded());
    }

    #[tokio::test]
    async fn test_cash_covers_with_buffer() {
        let harness = Harness::new();
        let plan = sourcer()
            .plan(&harness.gateway, &snapshot(dec!(300), dec!(500)), &mut [], dec!(200), Instant::now())
            .await
            .unwrap();
        assert_eq!(plan.from_cash, dec!(200));
        assert!(plan.operations.is_empty());
    }

    #[tokio::test]
    async fn test_deposit_tops_up_cash() {
        let harness = Harness::new();
        let mut positions = unwindable(&harness).await;
        let plan = sourcer()
            .plan(&harness.gateway, &snapshot(dec!(50), dec!(500)), &mut positions, dec!(200), Instant::now())
            .await
            .unwrap();

        assert_eq!(plan.from_cash, dec!(50));
        assert_eq!(plan.from_deposit, dec!(150));
        assert_eq!(plan.from_unwind, Decimal::ZERO);
        assert!(plan.unwound.is_none());

        let msgs = messages(&plan);
        assert_eq!(actions(&msgs), vec!["redeem_stable"]);
        // 150 stable at 1.25 per deposit token
        assert_eq!(amount_of(&msgs[0]), dec!(120));
    }

    #[tokio::test]
    async fn test_unwind_largest_position() {
        let harness = Harness::new();
        stake_long_lp(&harness, dec!(1000));
        let mut positions = unwindable(&harness).await;

        let plan = sourcer()
            .plan(&harness.gateway, &snapshot(dec!(0), dec!(5)), &mut positions, dec!(300), Instant::now())
            .await
            .unwrap();

        assert_eq!(plan.from_deposit, Decimal::ZERO, "dust deposit is left alone");
        assert_eq!(plan.unwound.as_deref(), Some("1"));
        assert!((plan.from_unwind - dec!(300)).abs() < dec!(0.000001));
        assert!(plan.shortfall < dec!(0.000001));

        let msgs = messages(&plan);
        assert_eq!(
            actions(&msgs),
            vec!["unbond", "withdraw_liquidity", "burn", "withdraw", "redeem_stable"]
        );

        // burn value b = 300 * 0.64 / (1 + 0.64 * 1.02)
        let burn_value = dec!(300) * dec!(0.64) / (dec!(1) + dec!(0.64) * dec!(1.02));
        assert!((amount_of(&msgs[2]) - burn_value / dec!(100)).abs() < dec!(0.000001));
        // LP is pro-rata: 10 LP per asset in the mock pool
        assert!(amount_of(&msgs[0]) >= amount_of(&msgs[2]) * dec!(10));
    }

    #[tokio::test]
    async fn test_unwind_capped_by_stake() {
        let harness = Harness::new();
        stake_long_lp(&harness, dec!(5));
        let mut positions = unwindable(&harness).await;

        let plan = sourcer()
            .plan(&harness.gateway, &snapshot(dec!(0), dec!(0)), &mut positions, dec!(300), Instant::now())
            .await
            .unwrap();

        // 5 LP is 0.5 asset: 50 stable of debt, 78.125 of collateral, 51 of LP stable
        assert_eq!(plan.from_unwind, dec!(129.125));
        assert_eq!(plan.shortfall, dec!(170.875));
        assert!(!plan.is_fully_funded());
        assert_eq!(plan.funded(), dec!(129.125));
    }

    #[tokio::test]
    async fn test_wallet_asset_burned_first() {
        let harness = Harness::new();
        harness.chain.set_balance(ASSET, dec!(1));
        let mut positions = unwindable(&harness).await;

        let plan = sourcer()
            .plan(&harness.gateway, &snapshot(dec!(0), dec!(0)), &mut positions, dec!(100), Instant::now())
            .await
            .unwrap();

        let msgs = messages(&plan);
        assert_eq!(actions(&msgs), vec!["burn", "withdraw", "redeem_stable"]);
        assert_eq!(amount_of(&msgs[0]), dec!(1));
        // 100 of debt at ltv 0.64 releases 156.25 of collateral, 125 aUST
        assert_eq!(amount_of(&msgs[1]), dec!(125));
        assert_eq!(plan.from_unwind, dec!(156.25));
        assert!(plan.is_fully_funded());
    }

    #[tokio::test]
    async fn test_no_mintable_position_returns_remainder() {
        let harness = Harness::new();
        let mut positions = unwindable(&harness).await;
        positions[0].observe_quote(1, Instant::now() + std::time::Duration::from_secs(300));
        assert!(!positions[0].mintable());

        let plan = sourcer()
            .plan(&harness.gateway, &snapshot(dec!(20), dec!(100)), &mut positions, dec!(300), Instant::now())
            .await
            .unwrap();

        assert_eq!(plan.from_cash, dec!(20));
        assert_eq!(plan.from_deposit, dec!(100));
        assert_eq!(plan.shortfall, dec!(180));
        assert_eq!(actions(&messages(&plan)), vec!["redeem_stable"]);
    }

    #[tokio::test]
    async fn test_cash_within_buffer_leaves_deposit() {
        let harness = Harness::new();
        let plan = sourcer()
            .plan(&harness.gateway, &snapshot(dec!(205), dec!(100)), &mut [], dec!(200), Instant::now())
            .await
            .unwrap();

        assert_eq!(plan.from_cash, dec!(200));
        assert_eq!(plan.from_deposit, Decimal::ZERO);
        assert!(plan.operations.is_empty());
        assert!(plan.is_fully_funded());
    }

    #[tokio::test]
    async fn test_partial_deposit_withdraws_only_the_gap() {
        let harness = Harness::new();
        let plan = sourcer()
            .plan(&harness.gateway, &snapshot(dec!(150), dec!(100)), &mut [], dec!(200), Instant::now())
            .await
            .unwrap();

        assert_eq!(plan.from_cash, dec!(150));
        assert_eq!(plan.from_deposit, dec!(50));
        let msgs = messages(&plan);
        assert_eq!(actions(&msgs), vec!["redeem_stable"]);
        assert_eq!(amount_of(&msgs[0]), dec!(40));
    }

    #[tokio::test]
    async fn test_rewards_sold_before_unwind() {
        let harness = Harness::new();
        {
            let mut market = harness.market.state.lock();
            market.pending_rewards = dec!(30);
            market.reward_price = dec!(2.5);
        }
        harness.chain.set_balance(REWARD_TOKEN, dec!(20));
        let mut positions = unwindable(&harness).await;

        let plan = reward_sourcer()
            .plan(&harness.gateway, &snapshot(dec!(0), dec!(0)), &mut positions, dec!(100), Instant::now())
            .await
            .unwrap();

        assert_eq!(plan.from_rewards, dec!(100));
        assert_eq!(plan.from_unwind, Decimal::ZERO);
        assert!(plan.unwound.is_none());
        assert!(plan.is_fully_funded());

        let msgs = messages(&plan);
        assert_eq!(actions(&msgs), vec!["claim_rewards", "sell_rewards", "stake_rewards"]);
        // 100 stable at 2.5 is 40 of the 50 held and pending
        assert_eq!(amount_of(&msgs[1]), dec!(40));
        assert_eq!(amount_of(&msgs[2]), dec!(10));
        assert_eq!(plan.to_event().from_rewards, dec!(100));
    }

    #[tokio::test]
    async fn test_short_rewards_fall_through_to_unwind() {
        let harness = Harness::new();
        harness.market.state.lock().pending_rewards = dec!(10);
        harness.chain.set_balance(ASSET, dec!(1));
        let mut positions = unwindable(&harness).await;

        let plan = reward_sourcer()
            .plan(&harness.gateway, &snapshot(dec!(0), dec!(0)), &mut positions, dec!(120), Instant::now())
            .await
            .unwrap();

        // 10 rewards at the default price of 2 cover 20
        assert_eq!(plan.from_rewards, dec!(20));
        assert_eq!(plan.unwound.as_deref(), Some("1"));
        let msgs = messages(&plan);
        assert_eq!(
            actions(&msgs)[..3],
            ["claim_rewards", "sell_rewards", "burn"]
        );
    }

    #[tokio::test]
    async fn test_rewards_ignored_unless_enabled() {
        let harness = Harness::new();
        harness.market.state.lock().pending_rewards = dec!(500);

        let plan = sourcer()
            .plan(&harness.gateway, &snapshot(dec!(0), dec!(0)), &mut [], dec!(100), Instant::now())
            .await
            .unwrap();

        assert_eq!(plan.from_rewards, Decimal::ZERO);
        assert_eq!(plan.shortfall, dec!(100));
        assert!(plan.operations.is_empty());
    }
}
