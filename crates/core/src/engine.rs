//! The rebalancing engine.
//!
//! Owns the credit facility, the discovered synthetic positions and the
//! pending queues, and runs one cycle at a time behind an
//! `Idle -> Running -> Idle` guard. Re-entry while running counts as a
//! failure; enough consecutive failures pause the engine until an
//! automatic resume.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rebalancer_api::{Event, FacilityAction, Notifier};
use rebalancer_chain::{TxReceipt, MICRO_MULTIPLIER};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{BotConfig, ConfigField};
use crate::error::{EngineError, EngineResult, PositionError, ValidationError};
use crate::facility::CreditFacility;
use crate::gateway::Gateway;
use crate::position::{lp_for_asset, staked_long_lp, SyntheticPosition};
use crate::queue::{messages_of, Channel, Operation, OperationKind, PendingQueues};
use crate::snapshot::CycleSnapshot;
use crate::sourcer::LiquiditySourcer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Idle,
    Running,
    Paused,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
        }
    }
}

/// Result of one `execute` call.
#[derive(Debug)]
pub enum ExecuteOutcome {
    Completed,
    /// Engine paused, or the target override was out of range
    Rejected,
    /// A cycle was already in flight
    Busy { failures: u32 },
    Failed(EngineError),
}

/// Outcome of flushing one channel.
#[derive(Debug)]
pub enum BroadcastOutcome {
    Empty,
    Submitted(TxReceipt),
    /// Rejected; the queue was discarded
    Failed,
}

impl BroadcastOutcome {
    pub fn submitted(&self) -> bool {
        matches!(self, Self::Submitted(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionView {
    pub idx: String,
    pub symbol: String,
    pub is_short: bool,
    pub mintable: bool,
    pub premium: Decimal,
    pub collateral_value: Decimal,
    pub debt_value: Decimal,
}

/// Read-only view for the command surface.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub status: EngineStatus,
    pub failures: u32,
    pub cycles: u64,
    pub auto_resume_in: Option<Duration>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// `None` while a cycle holds the state
    pub ltv: Option<Decimal>,
    pub positions: Vec<PositionView>,
    pub config: BotConfig,
}

#[derive(Debug)]
struct Control {
    status: EngineStatus,
    failures: u32,
    auto_resume_at: Option<Instant>,
    /// Set by `pause` while a cycle was in flight
    reset_requested: bool,
    last_cycle_at: Option<DateTime<Utc>>,
    /// Completed cycles since start or the last reset
    cycles: u64,
}

impl Control {
    /// Lift a failure pause whose cooldown has elapsed.
    fn resume_if_due(&mut self, now: Instant) -> Option<Event> {
        let due = self.status == EngineStatus::Paused
            && self.auto_resume_at.is_some_and(|at| now >= at);
        if !due {
            return None;
        }
        self.status = EngineStatus::Idle;
        self.auto_resume_at = None;
        self.failures = 0;
        info!("Failure pause elapsed, resuming");
        Some(status_event(EngineStatus::Paused, EngineStatus::Idle, "auto-resume"))
    }
}

#[derive(Debug)]
struct CycleState {
    facility: CreditFacility,
    positions: Vec<SyntheticPosition>,
    queues: PendingQueues,
    counter: u64,
}

impl CycleState {
    fn reset(&mut self) {
        self.positions.clear();
        self.queues.clear_all();
        self.counter = 0;
    }
}

pub struct RebalancingEngine {
    gateway: Gateway,
    watch: Vec<String>,
    config: RwLock<BotConfig>,
    control: Mutex<Control>,
    cycle: tokio::sync::Mutex<CycleState>,
    notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for RebalancingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RebalancingEngine")
            .field("watch", &self.watch)
            .field("status", &self.control.lock().status)
            .finish()
    }
}

impl RebalancingEngine {
    pub fn new(
        gateway: Gateway,
        config: BotConfig,
        watch: Vec<String>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let facility = CreditFacility::new(config.facility.collateral_factor);
        Self {
            gateway,
            watch,
            config: RwLock::new(config),
            control: Mutex::new(Control {
                status: EngineStatus::Idle,
                failures: 0,
                auto_resume_at: None,
                reset_requested: false,
                last_cycle_at: None,
                cycles: 0,
            }),
            cycle: tokio::sync::Mutex::new(CycleState {
                facility,
                positions: Vec::new(),
                queues: PendingQueues::new(),
                counter: 0,
            }),
            notifier,
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.read_control(|control| control.status)
    }

    pub fn failures(&self) -> u32 {
        self.read_control(|control| control.failures)
    }

    pub fn config(&self) -> BotConfig {
        self.config.read().clone()
    }

    /// Run one cycle unless paused or already running.
    pub async fn execute(&self, target_override: Option<Decimal>, channel: Channel) -> ExecuteOutcome {
        let config = self.config();

        if let Some(target) = target_override {
            let ceiling = config.facility.hard_ceiling();
            if target < Decimal::ZERO || target > ceiling {
                warn!(target = %target, ceiling = %ceiling, "Target LTV out of range");
                return ExecuteOutcome::Rejected;
            }
        }

        let mut events = Vec::new();
        let failures_at_start = {
            let mut control = self.control.lock();
            events.extend(control.resume_if_due(Instant::now()));
            let status = control.status;
            match status {
                EngineStatus::Paused => {
                    info!(channel = %channel, "Engine paused, execute rejected");
                    return ExecuteOutcome::Rejected;
                }
                EngineStatus::Running => {
                    control.failures += 1;
                    let failures = control.failures;
                    warn!(channel = %channel, failures, "Cycle already running");
                    if failures >= config.engine.max_failure {
                        events.push(self.pause_for_failures(&mut control, &config));
                    }
                    drop(control);
                    self.emit(events);
                    return ExecuteOutcome::Busy { failures };
                }
                EngineStatus::Idle => {}
            }
            control.status = EngineStatus::Running;
            control.failures
        };
        self.emit(std::mem::take(&mut events));
        debug!(channel = %channel, "Cycle started");

        let result = {
            let mut state = self.cycle.lock().await;
            let result = self
                .run_cycle(&mut state, &config, target_override, channel, failures_at_start)
                .await;
            if result.is_err() {
                state.queues.clear(channel);
            }
            state.counter += 1;

            let mut control = self.control.lock();
            if std::mem::take(&mut control.reset_requested) {
                debug!("Applying reset requested during the cycle");
                state.reset();
            }
            control.cycles = state.counter;
            result
        };

        let mut control = self.control.lock();
        control.last_cycle_at = Some(Utc::now());
        let outcome = match result {
            Ok(()) => {
                control.failures = 0;
                ExecuteOutcome::Completed
            }
            Err(error) => {
                control.failures += 1;
                let failures = control.failures;
                warn!(failures, retryable = error.is_retryable(), error = %error, "Cycle failed");
                events.push(Event::CycleFailed {
                    failures,
                    error: error.to_string(),
                });
                if control.status == EngineStatus::Running && failures >= config.engine.max_failure {
                    events.push(self.pause_for_failures(&mut control, &config));
                }
                ExecuteOutcome::Failed(error)
            }
        };
        if control.status == EngineStatus::Running {
            control.status = EngineStatus::Idle;
        }
        drop(control);
        self.emit(events);
        outcome
    }

    /// Block future cycles and drop all cycle state.
    pub fn pause(&self) {
        let mut control = self.control.lock();
        let from = control.status;
        control.status = EngineStatus::Paused;
        control.failures = 0;
        control.auto_resume_at = None;

        match self.cycle.try_lock() {
            Ok(mut state) => {
                state.reset();
                control.cycles = 0;
            }
            Err(_) => control.reset_requested = true,
        }
        drop(control);

        self.notifier
            .notify(status_event(from, EngineStatus::Paused, "manual pause"));
    }

    /// Lift a pause.
    pub fn run(&self) -> EngineResult<()> {
        let mut control = self.control.lock();
        if control.status != EngineStatus::Paused {
            return Err(EngineError::NotPaused);
        }
        control.status = EngineStatus::Idle;
        control.failures = 0;
        control.auto_resume_at = None;
        drop(control);

        self.notifier
            .notify(status_event(EngineStatus::Paused, EngineStatus::Idle, "manual run"));
        Ok(())
    }

    /// Query the facility LTV without touching cycle state.
    pub async fn compute_current_ltv(&self) -> EngineResult<Decimal> {
        let mut facility = CreditFacility::new(self.config.read().facility.collateral_factor);
        facility.refresh(&self.gateway).await
    }

    /// Change one runtime field.
    pub fn set_config_value(&self, path: &str, value: &str) -> Result<String, ValidationError> {
        let result = path
            .parse::<ConfigField>()
            .and_then(|field| self.config.write().update_field(field, value));

        match &result {
            Ok(applied) => self.notifier.notify(Event::ConfigChanged {
                field: path.to_string(),
                value: applied.clone(),
            }),
            Err(e) => self.notifier.notify(Event::ConfigRejected {
                field: path.to_string(),
                reason: e.to_string(),
            }),
        }
        result
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        let (status, failures, cycles, auto_resume_at, last_cycle_at) =
            self.read_control(|control| {
                (
                    control.status,
                    control.failures,
                    control.cycles,
                    control.auto_resume_at,
                    control.last_cycle_at,
                )
            });
        let now = Instant::now();
        let mut snapshot = StatusSnapshot {
            status,
            failures,
            cycles,
            auto_resume_in: auto_resume_at.map(|at| at.saturating_duration_since(now)),
            last_cycle_at,
            ltv: None,
            positions: Vec::new(),
            config: self.config(),
        };

        if let Ok(state) = self.cycle.try_lock() {
            snapshot.ltv = Some(state.facility.ltv());
            snapshot.positions = state
                .positions
                .iter()
                .map(|p| PositionView {
                    idx: p.idx().to_string(),
                    symbol: p.symbol().to_string(),
                    is_short: p.is_short(),
                    mintable: p.mintable(),
                    premium: p.premium(),
                    collateral_value: p.collateral_value(),
                    debt_value: p.debt_value(),
                })
                .collect();
        }
        snapshot
    }

    /// Fixed-delay loop on the scheduled channel. Never returns.
    pub async fn run_forever(&self) {
        loop {
            match self.execute(None, Channel::Scheduled).await {
                ExecuteOutcome::Failed(e) => debug!(error = %e, "Scheduled cycle failed"),
                outcome => debug!(?outcome, "Scheduled cycle finished"),
            }
            let wait = self.config.read().engine.wait_for();
            tokio::time::sleep(wait).await;
        }
    }

    fn pause_for_failures(&self, control: &mut Control, config: &BotConfig) -> Event {
        let from = control.status;
        control.status = EngineStatus::Paused;
        control.auto_resume_at = Some(Instant::now() + config.engine.auto_resume());
        warn!(
            failures = control.failures,
            resume_in_secs = config.engine.auto_resume_secs,
            "Too many failures, pausing"
        );
        status_event(
            from,
            EngineStatus::Paused,
            &format!(
                "{} consecutive failures, resuming in {}s",
                control.failures, config.engine.auto_resume_secs
            ),
        )
    }

    /// Read the control block after applying any due auto-resume.
    fn read_control<T>(&self, read: impl FnOnce(&Control) -> T) -> T {
        let (value, resumed) = {
            let mut control = self.control.lock();
            let resumed = control.resume_if_due(Instant::now());
            (read(&control), resumed)
        };
        if let Some(event) = resumed {
            self.notifier.notify(event);
        }
        value
    }

    fn emit(&self, events: Vec<Event>) {
        for event in events {
            self.notifier.notify(event);
        }
    }

    #[instrument(skip_all, fields(channel = %channel, cycle = state.counter))]
    async fn run_cycle(
        &self,
        state: &mut CycleState,
        config: &BotConfig,
        target_override: Option<Decimal>,
        channel: Channel,
        failures_at_start: u32,
    ) -> EngineResult<()> {
        let now = Instant::now();
        for position in &mut state.positions {
            position.begin_cycle();
        }

        let interval = config.engine.rediscovery_interval.max(1);
        if state.counter % interval == 0 || failures_at_start > 0 {
            self.discover(state, now).await?;
        }

        let mut snapshot = CycleSnapshot::capture(&self.gateway).await?;
        state
            .facility
            .set_collateral_factor(config.facility.collateral_factor);
        let ltv = state.facility.refresh(&self.gateway).await?;
        debug!(ltv = %ltv, cash = %snapshot.cash, deposit = %snapshot.deposit, "Balances refreshed");

        self.maintain_facility(state, config, &mut snapshot, target_override, channel, now)
            .await?;
        self.maintain_positions(state, config, &mut snapshot, channel, now)
            .await?;
        self.redeploy(state, config, &mut snapshot, channel, now)
            .await?;
        Ok(())
    }

    /// Match on-chain positions against the watch list, keeping known ones.
    async fn discover(&self, state: &mut CycleState, now: Instant) -> EngineResult<()> {
        let synthetic = self.gateway.synthetic();
        let infos = self
            .gateway
            .call("get_positions", synthetic.get_positions(self.gateway.address()))
            .await?;

        let mut discovered = Vec::new();
        for info in infos {
            let Some(symbol) = self
                .watch
                .iter()
                .find(|s| synthetic.asset_token(s) == Some(info.asset.key()))
            else {
                continue;
            };

            match state.positions.iter().position(|p| p.idx() == info.idx) {
                Some(i) => discovered.push(state.positions.swap_remove(i)),
                None => {
                    let position =
                        SyntheticPosition::discover(&self.gateway, symbol, info, now).await?;
                    info!(idx = %position.idx(), symbol = %symbol, "Tracking position");
                    discovered.push(position);
                }
            }
        }

        for dropped in &state.positions {
            info!(idx = %dropped.idx(), "Position no longer on chain");
        }
        state.positions = discovered;
        Ok(())
    }

    async fn maintain_facility(
        &self,
        state: &mut CycleState,
        config: &BotConfig,
        snapshot: &mut CycleSnapshot,
        target_override: Option<Decimal>,
        channel: Channel,
        now: Instant,
    ) -> EngineResult<()> {
        let ltv = state.facility.ltv();
        let band = config.ltv;

        let (action, target) = match target_override {
            Some(target) if ltv > target => (FacilityAction::Repay, target),
            Some(target) if ltv < target => (FacilityAction::Borrow, target),
            Some(_) => return Ok(()),
            None if ltv > band.limit => (FacilityAction::Repay, band.safe),
            None if ltv < band.borrow && config.facility.should_borrow_more => {
                (FacilityAction::Borrow, band.safe)
            }
            None => return Ok(()),
        };

        let market = self.gateway.market();
        let amount = match action {
            FacilityAction::Repay => {
                let required = state.facility.amount_to_repay(target)?;
                if required <= Decimal::ZERO {
                    return Ok(());
                }
                info!(ltv = %ltv, target = %target, required = %required, "Repaying facility");
                for position in &mut state.positions {
                    position
                        .refresh_price_and_mintability(&self.gateway, now)
                        .await?;
                }

                let sourcer = LiquiditySourcer::new(&config.sourcing);
                let plan = sourcer
                    .plan(&self.gateway, snapshot, &mut state.positions, required, now)
                    .await?;
                self.notifier.notify(Event::Funding(plan.to_event()));

                let repay = plan.funded();
                if repay <= Decimal::ZERO {
                    warn!(required = %required, "No liquidity to repay with, skipping");
                    return Ok(());
                }
                state.queues.extend(channel, plan.operations);
                state
                    .queues
                    .push(channel, Operation::new(OperationKind::Repay, market.repay(repay)));
                repay
            }
            FacilityAction::Borrow => {
                let amount = state.facility.amount_to_borrow(target)?;
                if amount <= Decimal::ZERO {
                    return Ok(());
                }
                info!(ltv = %ltv, target = %target, amount = %amount, "Borrowing more");
                state
                    .queues
                    .push(channel, Operation::new(OperationKind::Borrow, market.borrow(amount)));
                state.queues.push(
                    channel,
                    Operation::new(OperationKind::DepositStable, market.deposit_stable(amount)),
                );
                amount
            }
        };

        if self.broadcast(&mut state.queues, channel).await.submitted() {
            match action {
                FacilityAction::Repay => state.facility.record_repay(amount),
                FacilityAction::Borrow => state.facility.record_borrow(amount),
            }
            self.notifier.notify(Event::FacilityRebalanced {
                action,
                amount,
                ltv: state.facility.ltv(),
            });
            *snapshot = CycleSnapshot::capture(&self.gateway).await?;
        }
        Ok(())
    }

    async fn maintain_positions(
        &self,
        state: &mut CycleState,
        config: &BotConfig,
        snapshot: &mut CycleSnapshot,
        channel: Channel,
        now: Instant,
    ) -> EngineResult<()> {
        let (limit, safe, borrow) = config.ocr.as_fractions();
        let CycleState {
            positions, queues, ..
        } = state;

        for position in positions.iter_mut() {
            position.refresh_amounts(&self.gateway).await?;
            position
                .refresh_price_and_mintability(&self.gateway, now)
                .await?;

            let margin = match position.relative_ocr_margin() {
                Ok(margin) => margin,
                Err(PositionError::ZeroDebt { .. }) => {
                    debug!(idx = %position.idx(), "No debt, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            debug!(
                idx = %position.idx(),
                margin = %margin,
                mintable = position.mintable(),
                "Position margin"
            );

            let submitted = if margin < limit {
                self.repair(position, queues, margin, safe, channel).await?
            } else if margin > borrow {
                self.expand(position, queues, snapshot, config, margin, safe, channel)
                    .await?
            } else {
                false
            };

            if submitted {
                position.refresh_amounts(&self.gateway).await?;
                *snapshot = CycleSnapshot::capture(&self.gateway).await?;
            }
        }
        Ok(())
    }

    /// Raise the margin to `safe`: LP unwind, then wallet burn, then collateral.
    async fn repair(
        &self,
        position: &mut SyntheticPosition,
        queues: &mut PendingQueues,
        margin: Decimal,
        safe: Decimal,
        channel: Channel,
    ) -> EngineResult<bool> {
        let synthetic = self.gateway.synthetic();
        position.refresh_premium(&self.gateway).await?;

        let mut action = None;
        if position.mintable() {
            let comp = position.amount_to_compensate(safe)?;
            let burn = comp.asset_amount;
            if burn > Decimal::ZERO {
                let (rewards, pool, wallet_asset) = futures::try_join!(
                    self.gateway.call(
                        "get_reward_info",
                        synthetic.get_reward_info(self.gateway.address(), position.asset_token())
                    ),
                    self.gateway
                        .call("get_pool_info", synthetic.get_pool_info(position.asset_token())),
                    self.gateway.token_balance(position.asset_token()),
                )?;

                let staked = staked_long_lp(&rewards);
                if let Some(lp) = lp_for_asset(&pool, burn).filter(|lp| *lp <= staked) {
                    queues.push(channel, Operation::new(OperationKind::Unstake, position.unstake_msg(synthetic, lp)?));
                    queues.push(
                        channel,
                        Operation::new(OperationKind::WithdrawLiquidity, position.unbond_msg(synthetic, lp)?),
                    );
                    queues.push(channel, Operation::new(OperationKind::Burn, position.burn_msg(synthetic, burn)?));
                    action = Some(("burn from liquidity", burn));
                } else if wallet_asset >= burn {
                    queues.push(channel, Operation::new(OperationKind::Burn, position.burn_msg(synthetic, burn)?));
                    action = Some(("burn from wallet", burn));
                }
            }
        } else {
            info!(idx = %position.idx(), "Not mintable, collateral-only repair");
        }

        if action.is_none() {
            let value = position.collateral_to_compensate(safe)?;
            if value > Decimal::ZERO {
                let units = position.collateral_units(value);
                let balance = self.gateway.asset_balance(position.collateral()).await?;
                if balance >= units {
                    queues.push(
                        channel,
                        Operation::new(OperationKind::DepositCollateral, position.deposit_msg(synthetic, value)?),
                    );
                    action = Some(("deposit collateral", units));
                } else {
                    warn!(
                        idx = %position.idx(),
                        needed = %units,
                        balance = %balance,
                        "Cannot repair position this cycle"
                    );
                }
            }
        }

        let Some((label, amount)) = action else {
            return Ok(false);
        };
        let submitted = self.broadcast(queues, channel).await.submitted();
        if submitted {
            self.notifier.notify(Event::PositionAdjusted {
                asset: position.symbol().to_string(),
                action: label.to_string(),
                amount,
                margin,
            });
        }
        Ok(submitted)
    }

    /// Lower the margin to `safe` by minting and providing liquidity.
    #[allow(clippy::too_many_arguments)]
    async fn expand(
        &self,
        position: &mut SyntheticPosition,
        queues: &mut PendingQueues,
        snapshot: &CycleSnapshot,
        config: &BotConfig,
        margin: Decimal,
        safe: Decimal,
        channel: Channel,
    ) -> EngineResult<bool> {
        if !position.mintable() {
            debug!(idx = %position.idx(), "Not mintable, skipping expansion");
            return Ok(false);
        }
        position.refresh_premium(&self.gateway).await?;

        let comp = position.amount_to_compensate(safe)?;
        let short = -comp.asset_amount;
        if short <= Decimal::ZERO {
            return Ok(false);
        }

        let synthetic = self.gateway.synthetic();
        let simulation = self
            .gateway
            .call(
                "reverse_simulate",
                synthetic.reverse_simulate(position.asset_token(), short),
            )
            .await?;
        let swap_stable = simulation.total_cost() / MICRO_MULTIPLIER;
        let lp_stable = short * position.pool_price();
        let needed = swap_stable + lp_stable;

        let enough = snapshot.cash > needed + config.sourcing.cash_buffer
            || snapshot.deposit > needed * dec!(2);
        if !enough {
            info!(
                idx = %position.idx(),
                needed = %needed,
                cash = %snapshot.cash,
                deposit = %snapshot.deposit,
                "Not enough liquidity to expand"
            );
            return Ok(false);
        }

        if snapshot.cash <= needed {
            queues.push(
                channel,
                Operation::new(
                    OperationKind::WithdrawDeposit,
                    self.gateway
                        .market()
                        .withdraw_stable(snapshot.deposit_tokens_for(needed)),
                ),
            );
        }
        queues.push(channel, Operation::new(OperationKind::Mint, position.mint_msg(synthetic, short)?));
        queues.push(
            channel,
            Operation::batch(
                OperationKind::BuyAndProvide,
                position.buy_and_lp_msgs(synthetic, short, swap_stable, lp_stable)?,
            ),
        );
        info!(idx = %position.idx(), short = %short, needed = %needed, "Expanding position");

        let submitted = self.broadcast(queues, channel).await.submitted();
        if submitted {
            self.notifier.notify(Event::PositionAdjusted {
                asset: position.symbol().to_string(),
                action: "mint and provide".to_string(),
                amount: short,
                margin,
            });
        }
        Ok(submitted)
    }

    /// Move deposit above the configured deposit/lent ratio into farming.
    async fn redeploy(
        &self,
        state: &mut CycleState,
        config: &BotConfig,
        snapshot: &mut CycleSnapshot,
        channel: Channel,
        now: Instant,
    ) -> EngineResult<()> {
        let lent = state.facility.lent_value();
        if state.positions.is_empty() || lent <= Decimal::ZERO {
            return Ok(());
        }

        let farming = config.farming;
        let ratio = snapshot.deposit / lent;
        let max_ratio = farming.max_deposit_to_lent_ratio / dec!(100);
        if ratio <= max_ratio {
            return Ok(());
        }

        let mut usable = (farming.fraction_to_farm / dec!(100) + ratio - max_ratio) * lent;
        info!(ratio = %ratio, usable = %usable, "Redeploying spare deposit");

        let market = self.gateway.market();
        let synthetic = self.gateway.synthetic();
        let CycleState {
            positions, queues, ..
        } = state;

        for position in positions.iter_mut() {
            if usable <= Decimal::ZERO {
                break;
            }
            let wallet_asset = self.gateway.token_balance(position.asset_token()).await?;
            if wallet_asset <= Decimal::ZERO {
                continue;
            }
            position
                .refresh_price_and_mintability(&self.gateway, now)
                .await?;
            position.refresh_premium(&self.gateway).await?;

            let pool_price = position.pool_price();
            let value = wallet_asset * pool_price;
            let (asset, stable) = if value >= usable {
                (usable / pool_price, usable)
            } else if value >= farming.min_farm_value {
                (wallet_asset, value)
            } else {
                continue;
            };

            queues.push(
                channel,
                Operation::new(
                    OperationKind::WithdrawDeposit,
                    market.withdraw_stable(snapshot.deposit_tokens_for(stable)),
                ),
            );
            queues.push(
                channel,
                Operation::batch(OperationKind::Stake, position.stake_msgs(synthetic, asset, stable)?),
            );
            usable -= stable;

            if self.broadcast(queues, channel).await.submitted() {
                self.notifier.notify(Event::PositionAdjusted {
                    asset: position.symbol().to_string(),
                    action: "stake wallet asset".to_string(),
                    amount: asset,
                    margin: Decimal::ZERO,
                });
                *snapshot = CycleSnapshot::capture(&self.gateway).await?;
            }
        }

        if usable <= farming.min_farm_value {
            return Ok(());
        }

        let Some(position) = positions.iter_mut().find(|p| p.mintable() && p.is_short()) else {
            info!("No mintable short position to grow");
            return Ok(());
        };

        position
            .refresh_price_and_mintability(&self.gateway, now)
            .await?;
        position.refresh_premium(&self.gateway).await?;

        let debt = position.debt_value();
        let collateral = position.collateral_value();
        if debt.is_zero() || collateral.is_zero() {
            return Ok(());
        }
        let ltv = debt / collateral;
        let premium = position.premium();

        let short_value =
            (ltv * (usable + collateral) - debt) / (dec!(2) * premium * ltv + Decimal::ONE);
        if short_value <= Decimal::ZERO {
            return Ok(());
        }
        let needed_collateral = (debt + short_value) / ltv - collateral;
        let needed_stable = short_value * dec!(2) * premium * farming.fee_buffer;
        info!(
            idx = %position.idx(),
            short_value = %short_value,
            collateral = %needed_collateral,
            stable = %needed_stable,
            "Growing short position"
        );

        if needed_collateral > Decimal::ZERO {
            queues.push(
                channel,
                Operation::new(
                    OperationKind::DepositCollateral,
                    position.deposit_msg(synthetic, needed_collateral)?,
                ),
            );
        }
        queues.push(
            channel,
            Operation::new(
                OperationKind::WithdrawDeposit,
                market.withdraw_stable(snapshot.deposit_tokens_for(needed_stable)),
            ),
        );

        if !self.broadcast(queues, channel).await.submitted() {
            return Ok(());
        }
        position.refresh_amounts(&self.gateway).await?;
        *snapshot = CycleSnapshot::capture(&self.gateway).await?;

        let margin = position.relative_ocr_margin()?;
        let (_, safe, _) = config.ocr.as_fractions();
        if self
            .expand(position, queues, snapshot, config, margin, safe, channel)
            .await?
        {
            *snapshot = CycleSnapshot::capture(&self.gateway).await?;
        }
        Ok(())
    }

    /// Submit everything queued on `channel` as one transaction.
    ///
    /// The queue is emptied either way; a rejected transaction is reported
    /// and never resubmitted.
    async fn broadcast(&self, queues: &mut PendingQueues, channel: Channel) -> BroadcastOutcome {
        let operations = queues.take(channel);
        if operations.is_empty() {
            return BroadcastOutcome::Empty;
        }

        let messages = messages_of(&operations);
        match self.gateway.broadcast(&messages).await {
            Ok(receipt) => {
                info!(
                    channel = %channel,
                    txhash = %receipt.txhash,
                    operations = operations.len(),
                    messages = messages.len(),
                    "Transaction broadcast"
                );
                BroadcastOutcome::Submitted(receipt)
            }
            Err(error) => {
                warn!(channel = %channel, error = %error, "Broadcast failed, queue discarded");
                self.notifier.notify(Event::BroadcastFailed {
                    channel: channel.to_string(),
                    operations: operations.len(),
                    error: error.to_string(),
                });
                BroadcastOutcome::Failed
            }
        }
    }
}

fn status_event(from: EngineStatus, to: EngineStatus, reason: &str) -> Event {
    Event::StatusChanged {
        from: from.to_string(),
        to: to.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        self, actions, amount_of, Harness, RecordingNotifier, ASSET, DEPOSIT_TOKEN, STABLE,
    };
    use rebalancer_chain::RewardInfo;
    use tokio::sync::Notify;

    struct Fixture {
        harness: Harness,
        engine: Arc<RebalancingEngine>,
        events: RecordingNotifier,
    }

    fn fixture(config: BotConfig) -> Fixture {
        let harness = Harness::new();
        let events = RecordingNotifier::default();
        let engine = Arc::new(RebalancingEngine::new(
            harness.gateway.clone(),
            config,
            vec![testing::SYMBOL.to_string()],
            Arc::new(events.clone()),
        ));
        Fixture {
            harness,
            engine,
            events,
        }
    }

    impl Fixture {
        fn events(&self) -> Vec<Event> {
            self.events.0.lock().clone()
        }

        fn batches(&self) -> Vec<Vec<String>> {
            self.harness
                .chain
                .batches()
                .iter()
                .map(|b| actions(b))
                .collect()
        }
    }

    async fn wait_for_status(engine: &RebalancingEngine, status: EngineStatus) {
        for _ in 0..1000 {
            if engine.status() == status {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("engine never reached {status}");
    }

    #[tokio::test]
    async fn test_quiet_cycle_issues_nothing() {
        let f = fixture(BotConfig::default());
        assert!(matches!(
            f.engine.execute(None, Channel::Scheduled).await,
            ExecuteOutcome::Completed
        ));
        assert!(f.batches().is_empty());
        assert_eq!(f.engine.status(), EngineStatus::Idle);
        assert_eq!(f.engine.status_snapshot().cycles, 1);
        assert_eq!(f.engine.status_snapshot().ltv, Some(dec!(40)));
    }

    #[tokio::test]
    async fn test_repays_from_cash_above_limit() {
        let f = fixture(BotConfig::default());
        f.harness.market.state.lock().borrowed = dec!(5500);
        f.harness.chain.set_balance(STABLE, dec!(2000));

        f.engine.execute(None, Channel::Scheduled).await;

        assert_eq!(f.batches(), vec![vec!["repay_stable"]]);
        // 55% down to the 40% safe level
        assert_eq!(amount_of(&f.harness.chain.batches()[0][0]), dec!(1500));
        assert!(f.events().iter().any(|e| matches!(
            e,
            Event::FacilityRebalanced {
                action: FacilityAction::Repay,
                ..
            }
        )));
        assert_eq!(f.engine.status_snapshot().ltv, Some(dec!(40)));
    }

    #[tokio::test]
    async fn test_partial_repay_when_short_of_liquidity() {
        let f = fixture(BotConfig::default());
        {
            let mut market = f.harness.market.state.lock();
            market.borrowed = dec!(5500);
            market.deposit = dec!(200);
        }
        f.harness.chain.set_balance(STABLE, dec!(300));

        f.engine.execute(None, Channel::Scheduled).await;

        let batches = f.harness.chain.batches();
        assert_eq!(actions(&batches[0]), vec!["redeem_stable", "repay_stable"]);
        assert_eq!(amount_of(&batches[0][1]), dec!(500));
        assert!(f.events().iter().any(|e| matches!(
            e,
            Event::Funding(funding) if funding.shortfall == dec!(1000)
        )));
    }

    #[tokio::test]
    async fn test_borrows_below_band() {
        let f = fixture(BotConfig::default());
        f.harness.market.state.lock().borrowed = dec!(1000);

        f.engine.execute(None, Channel::Scheduled).await;

        let batches = f.harness.chain.batches();
        assert_eq!(actions(&batches[0]), vec!["borrow_stable", "deposit_stable"]);
        assert_eq!(amount_of(&batches[0][0]), dec!(3000));
    }

    #[tokio::test]
    async fn test_borrow_disabled() {
        let f = fixture(BotConfig::default());
        f.harness.market.state.lock().borrowed = dec!(1000);
        f.engine
            .set_config_value("facility.should_borrow_more", "false")
            .unwrap();

        f.engine.execute(None, Channel::Scheduled).await;
        assert!(f.batches().is_empty());
    }

    #[tokio::test]
    async fn test_target_override() {
        let f = fixture(BotConfig::default());
        f.harness.chain.set_balance(STABLE, dec!(2000));

        f.engine.execute(Some(dec!(30)), Channel::Manual).await;
        assert_eq!(amount_of(&f.harness.chain.batches()[0][0]), dec!(1000));

        assert!(matches!(
            f.engine.execute(Some(dec!(51)), Channel::Manual).await,
            ExecuteOutcome::Rejected
        ));
    }

    /// Collateral 1.38x debt at ratio 1.5 puts the margin at -0.08.
    #[tokio::test]
    async fn test_low_margin_takes_repair_path() {
        let mut config = BotConfig::default();
        config.ocr.limit = dec!(6);
        config.ocr.safe = dec!(8);
        config.ocr.borrow = dec!(10);
        let f = fixture(config);
        f.harness
            .synthetic
            .set_positions(vec![testing::position("1", dec!(883.2), dec!(8), true)]);
        f.harness.synthetic.state.lock().rewards = vec![RewardInfo {
            bond_amount: dec!(1000) * MICRO_MULTIPLIER,
            is_short: false,
        }];
        f.harness.chain.set_balance(STABLE, dec!(100000));

        f.engine.execute(None, Channel::Scheduled).await;

        let batches = f.batches();
        assert_eq!(batches, vec![vec!["unbond", "withdraw_liquidity", "burn"]]);
        assert!(!batches.concat().iter().any(|a| a == "mint"));
        assert!(f.events().iter().any(|e| matches!(
            e,
            Event::PositionAdjusted { margin, .. } if (*margin - dec!(-0.08)).abs() < dec!(0.0000001)
        )));
    }

    #[tokio::test]
    async fn test_repair_falls_back_to_collateral() {
        let f = fixture(BotConfig::default());
        f.harness
            .synthetic
            .set_positions(vec![testing::position("1", dec!(883.2), dec!(8), true)]);
        f.harness.chain.set_balance(DEPOSIT_TOKEN, dec!(10000));

        f.engine.execute(None, Channel::Scheduled).await;
        assert_eq!(f.batches(), vec![vec!["deposit"]]);
    }

    #[tokio::test]
    async fn test_high_margin_expands() {
        let f = fixture(BotConfig::default());
        f.harness
            .synthetic
            .set_positions(vec![testing::position("1", dec!(2000), dec!(8), true)]);
        f.harness.chain.set_balance(STABLE, dec!(100000));

        f.engine.execute(None, Channel::Scheduled).await;

        assert_eq!(
            f.batches(),
            vec![vec!["mint", "swap", "increase_allowance", "auto_stake"]]
        );
    }

    #[tokio::test]
    async fn test_expansion_skipped_without_liquidity() {
        let f = fixture(BotConfig::default());
        f.harness
            .synthetic
            .set_positions(vec![testing::position("1", dec!(2000), dec!(8), true)]);
        f.harness.market.state.lock().deposit = dec!(100);

        f.engine.execute(None, Channel::Scheduled).await;
        assert!(f.batches().is_empty());
    }

    #[tokio::test]
    async fn test_redeploys_spare_deposit() {
        let f = fixture(BotConfig::default());
        f.harness
            .synthetic
            .set_positions(vec![testing::position("1", dec!(1065), dec!(8), true)]);
        f.harness.market.state.lock().deposit = dec!(3000);

        f.engine.execute(None, Channel::Scheduled).await;

        let batches = f.batches();
        assert_eq!(batches[0], vec!["deposit", "redeem_stable"]);
    }

    #[tokio::test]
    async fn test_ignores_unwatched_positions() {
        let f = fixture(BotConfig::default());
        let mut other = testing::position("9", dec!(2000), dec!(8), true);
        other.asset = rebalancer_chain::AssetInfo::token("terra1other");
        f.harness.synthetic.set_positions(vec![other]);

        f.engine.execute(None, Channel::Scheduled).await;
        assert!(f.engine.status_snapshot().positions.is_empty());
        assert!(f.batches().is_empty());
    }

    #[tokio::test]
    async fn test_busy_counts_failures_and_pauses() {
        let f = fixture(BotConfig::default());
        let gate = Arc::new(Notify::new());
        *f.harness.chain.hold.lock() = Some(gate.clone());

        let engine = f.engine.clone();
        let first = tokio::spawn(async move { engine.execute(None, Channel::Scheduled).await });
        wait_for_status(&f.engine, EngineStatus::Running).await;

        for expected in 1..=4 {
            match f.engine.execute(None, Channel::Manual).await {
                ExecuteOutcome::Busy { failures } => assert_eq!(failures, expected),
                other => panic!("expected busy, got {other:?}"),
            }
            assert_eq!(f.engine.status(), EngineStatus::Running);
        }
        assert!(matches!(
            f.engine.execute(None, Channel::Manual).await,
            ExecuteOutcome::Busy { failures: 5 }
        ));
        assert_eq!(f.engine.status(), EngineStatus::Paused);

        *f.harness.chain.hold.lock() = None;
        gate.notify_one();
        first.await.unwrap();

        assert_eq!(*f.harness.chain.balance_calls.lock(), 1);
        assert_eq!(f.engine.status(), EngineStatus::Paused);
        assert!(matches!(
            f.engine.execute(None, Channel::Scheduled).await,
            ExecuteOutcome::Rejected
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_streak_pauses_then_auto_resumes() {
        let mut config = BotConfig::default();
        config.engine.max_failure = 2;
        config.engine.auto_resume_secs = 60;
        let f = fixture(config);
        f.harness.market.state.lock().fail = true;

        assert!(matches!(
            f.engine.execute(None, Channel::Scheduled).await,
            ExecuteOutcome::Failed(_)
        ));
        assert_eq!(f.engine.failures(), 1);
        assert_eq!(f.engine.status(), EngineStatus::Idle);

        f.engine.execute(None, Channel::Scheduled).await;
        assert_eq!(f.engine.status(), EngineStatus::Paused);
        assert!(matches!(
            f.engine.execute(None, Channel::Scheduled).await,
            ExecuteOutcome::Rejected
        ));

        tokio::time::advance(Duration::from_secs(61)).await;
        f.harness.market.state.lock().fail = false;
        assert!(matches!(
            f.engine.execute(None, Channel::Scheduled).await,
            ExecuteOutcome::Completed
        ));
        assert_eq!(f.engine.failures(), 0);
        assert_eq!(f.engine.status(), EngineStatus::Idle);

        let reasons: Vec<_> = f
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::StatusChanged { to, reason, .. } => Some(format!("{to}: {reason}")),
                _ => None,
            })
            .collect();
        assert_eq!(reasons.len(), 2);
        assert!(reasons[0].starts_with("PAUSED: 2 consecutive failures"));
        assert_eq!(reasons[1], "IDLE: auto-resume");
    }

    #[tokio::test]
    async fn test_broadcast_failure_discards_queue() {
        let f = fixture(BotConfig::default());
        f.harness.market.state.lock().borrowed = dec!(5500);
        f.harness.chain.set_balance(STABLE, dec!(2000));
        *f.harness.chain.broadcast_error.lock() = Some("out of gas".to_string());

        assert!(matches!(
            f.engine.execute(None, Channel::Scheduled).await,
            ExecuteOutcome::Completed
        ));
        assert!(f.events().iter().any(|e| matches!(
            e,
            Event::BroadcastFailed { operations: 1, .. }
        )));
        assert_eq!(f.engine.status_snapshot().ltv, Some(dec!(55)));

        *f.harness.chain.broadcast_error.lock() = None;
        f.engine.execute(None, Channel::Scheduled).await;
        assert_eq!(f.batches(), vec![vec!["repay_stable"]]);
    }

    #[tokio::test]
    async fn test_pause_and_run() {
        let f = fixture(BotConfig::default());
        f.harness
            .synthetic
            .set_positions(vec![testing::position("1", dec!(1065), dec!(8), true)]);
        f.engine.execute(None, Channel::Scheduled).await;
        assert_eq!(f.engine.status_snapshot().positions.len(), 1);

        assert!(matches!(f.engine.run(), Err(EngineError::NotPaused)));

        f.engine.pause();
        let snapshot = f.engine.status_snapshot();
        assert_eq!(snapshot.status, EngineStatus::Paused);
        assert_eq!(snapshot.cycles, 0);
        assert!(snapshot.positions.is_empty());
        assert!(matches!(
            f.engine.execute(None, Channel::Manual).await,
            ExecuteOutcome::Rejected
        ));

        f.engine.run().unwrap();
        assert!(matches!(
            f.engine.execute(None, Channel::Manual).await,
            ExecuteOutcome::Completed
        ));
        assert_eq!(f.engine.status_snapshot().positions.len(), 1);
    }

    #[tokio::test]
    async fn test_pause_during_cycle_resets_at_end() {
        let f = fixture(BotConfig::default());
        let gate = Arc::new(Notify::new());
        *f.harness.chain.hold.lock() = Some(gate.clone());

        let engine = f.engine.clone();
        let first = tokio::spawn(async move { engine.execute(None, Channel::Scheduled).await });
        wait_for_status(&f.engine, EngineStatus::Running).await;

        f.engine.pause();
        assert_eq!(f.engine.status(), EngineStatus::Paused);

        *f.harness.chain.hold.lock() = None;
        gate.notify_one();
        first.await.unwrap();

        let snapshot = f.engine.status_snapshot();
        assert_eq!(snapshot.status, EngineStatus::Paused);
        assert_eq!(snapshot.cycles, 0);
    }

    #[tokio::test]
    async fn test_cycle_count_visible_during_cycle() {
        let f = fixture(BotConfig::default());
        f.engine.execute(None, Channel::Scheduled).await;
        assert_eq!(f.engine.status_snapshot().cycles, 1);

        let gate = Arc::new(Notify::new());
        *f.harness.chain.hold.lock() = Some(gate.clone());
        let engine = f.engine.clone();
        let second = tokio::spawn(async move { engine.execute(None, Channel::Scheduled).await });
        wait_for_status(&f.engine, EngineStatus::Running).await;

        let snapshot = f.engine.status_snapshot();
        assert_eq!(snapshot.cycles, 1);
        assert_eq!(snapshot.ltv, None);

        *f.harness.chain.hold.lock() = None;
        gate.notify_one();
        second.await.unwrap();
        assert_eq!(f.engine.status_snapshot().cycles, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_balance_fails_cycle() {
        let f = fixture(BotConfig::default());
        *f.harness.chain.hold.lock() = Some(Arc::new(Notify::new()));

        match f.engine.execute(None, Channel::Scheduled).await {
            ExecuteOutcome::Failed(EngineError::Timeout { operation, .. }) => {
                assert_eq!(operation, "get_balance")
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(f.engine.failures(), 1);
        assert_eq!(f.engine.status(), EngineStatus::Idle);
        assert!(f
            .events()
            .iter()
            .any(|e| matches!(e, Event::CycleFailed { failures: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_pause_resumes_on_read() {
        let mut config = BotConfig::default();
        config.engine.max_failure = 1;
        config.engine.auto_resume_secs = 60;
        let f = fixture(config);
        f.harness.market.state.lock().fail = true;

        f.engine.execute(None, Channel::Scheduled).await;
        let paused = f.engine.status_snapshot();
        assert_eq!(paused.status, EngineStatus::Paused);
        assert_eq!(paused.auto_resume_in, Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(f.engine.status(), EngineStatus::Idle);
        let snapshot = f.engine.status_snapshot();
        assert_eq!(snapshot.status, EngineStatus::Idle);
        assert_eq!(snapshot.failures, 0);
        assert_eq!(snapshot.auto_resume_in, None);

        f.harness.market.state.lock().fail = false;
        assert!(matches!(
            f.engine.execute(None, Channel::Scheduled).await,
            ExecuteOutcome::Completed
        ));

        let resumes = f
            .events()
            .iter()
            .filter(|e| matches!(e, Event::StatusChanged { reason, .. } if reason == "auto-resume"))
            .count();
        assert_eq!(resumes, 1);
    }

    #[tokio::test]
    async fn test_set_config_value() {
        let f = fixture(BotConfig::default());
        assert!(f.engine.set_config_value("ltv.limit", "60").is_err());
        assert_eq!(f.engine.set_config_value("ltv.safe", "42").unwrap(), "42");
        assert!(f.engine.set_config_value("wallet.mnemonic", "x").is_err());
        assert_eq!(f.engine.config().ltv.safe, dec!(42));

        let events = f.events();
        assert!(matches!(&events[0], Event::ConfigRejected { field, .. } if field == "ltv.limit"));
        assert!(matches!(&events[1], Event::ConfigChanged { value, .. } if value == "42"));
        assert!(matches!(&events[2], Event::ConfigRejected { .. }));
    }

    #[tokio::test]
    async fn test_compute_current_ltv() {
        let f = fixture(BotConfig::default());
        f.harness.market.state.lock().borrowed = dec!(4500);
        assert_eq!(f.engine.compute_current_ltv().await.unwrap(), dec!(45));
        assert_eq!(f.engine.status_snapshot().cycles, 0);
    }

    #[tokio::test]
    async fn test_wallet_asset_is_staked_before_shorting() {
        let f = fixture(BotConfig::default());
        f.harness
            .synthetic
            .set_positions(vec![testing::position("1", dec!(1065), dec!(8), true)]);
        f.harness.market.state.lock().deposit = dec!(3000);
        f.harness.chain.set_balance(ASSET, dec!(1));

        f.engine.execute(None, Channel::Scheduled).await;

        let batches = f.batches();
        assert_eq!(
            batches[0],
            vec!["redeem_stable", "increase_allowance", "auto_stake"]
        );
    }
}
