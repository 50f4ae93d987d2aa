//! Rebalancer chain interaction layer.
//!
//! This crate provides:
//! - The [`ChainClient`] capability (balances, smart queries, atomic broadcast)
//! - An LCD REST implementation of it with sequence tracking
//! - Transaction signing through an external signing relay
//! - Money-market and synthetic-protocol capability traits with Anchor and
//!   Mirror adapters that build CosmWasm execute messages
//!
//! Amounts crossing these APIs are whole units as [`rust_decimal::Decimal`];
//! conversion to on-chain micro units happens here and nowhere else.

mod client;
mod error;
mod lcd;
pub mod protocol;
mod signer;
mod types;

#[cfg(test)]
mod testing;

pub use client::ChainClient;
pub use error::{ChainError, ChainResult};
pub use lcd::LcdClient;
pub use protocol::{
    AnchorContracts, AnchorMarket, AssetConfig, MirrorAsset, MirrorContracts, MirrorProtocol,
    MoneyMarketClient, SyntheticProtocolClient,
};
pub use signer::{
    AccountInfo, SequenceManager, SigningRelay, SigningRelayBuilder, DEFAULT_GAS_ADJUSTMENT,
    DEFAULT_GAS_PRICES,
};
pub use types::{
    from_micro, parse_decimal, to_micro_string, AssetInfo, Coin, Message, OraclePrice, PoolInfo,
    PositionInfo, RewardInfo, SwapSimulation, TxReceipt, MICRO_MULTIPLIER,
};
