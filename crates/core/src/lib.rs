//! Rebalancer core logic.
//!
//! This crate provides the leveraged-position maintenance engine:
//! - Credit facility LTV tracking and repay/borrow sizing
//! - Synthetic-asset CDP margin tracking with market-hours debounce
//! - Liquidity sourcing across wallet cash, the savings deposit, borrower
//!   rewards and position unwinds
//! - The rebalancing engine state machine and its per-cycle pipeline
//!
//! All chain access goes through the capability traits of
//! `rebalancer-chain`, bounded by a per-call timeout.

pub mod config;
mod engine;
mod error;
mod facility;
mod gateway;
mod position;
mod queue;
mod snapshot;
mod sourcer;

#[cfg(test)]
mod testing;

pub use config::{BotConfig, ConfigField, NetworkConfig};
pub use engine::{
    BroadcastOutcome, EngineStatus, ExecuteOutcome, PositionView, RebalancingEngine,
    StatusSnapshot,
};
pub use error::{EngineError, EngineResult, FacilityError, PositionError, ValidationError};
pub use facility::CreditFacility;
pub use gateway::Gateway;
pub use position::{
    asset_for_lp, lp_for_asset, staked_long_lp, Compensation, SyntheticPosition,
    MINTABLE_STALENESS,
};
pub use queue::{messages_of, Channel, Operation, OperationKind, PendingQueues};
pub use snapshot::CycleSnapshot;
pub use sourcer::{FundingPlan, LiquiditySourcer};
