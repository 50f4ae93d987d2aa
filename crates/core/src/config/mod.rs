//! Configuration system for the rebalancer.
//!
//! This module provides:
//! - Bot runtime configuration (profiles, LTV and OCR bands, timing)
//! - Network configuration (endpoints, contract addresses, watched assets)

mod bot;
mod network;

pub use bot::{
    BotConfig, ConfigField, EngineConfig, FacilityConfig, FarmingConfig, LtvBand, OcrBand,
    SourcingConfig,
};

pub use network::{
    AssetEntry, MoneyMarketContracts, NetworkConfig, NetworkDetails, SyntheticContracts,
};
