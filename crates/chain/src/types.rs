//! Wire-level types shared by the chain client and the protocol adapters.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// On-chain amounts are integers scaled by 10^6.
pub const MICRO_MULTIPLIER: Decimal = dec!(1000000);

/// Convert a whole-unit amount into its integer micro-unit string.
///
/// Rounds toward zero so a built message never spends more than requested.
pub fn to_micro_string(amount: Decimal) -> String {
    (amount * MICRO_MULTIPLIER).trunc().normalize().to_string()
}

/// Convert a micro-unit amount into whole units.
pub fn from_micro(amount: Decimal) -> Decimal {
    amount / MICRO_MULTIPLIER
}

/// Parse a decimal that the chain encodes as a JSON string or number.
pub fn parse_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

/// Native coin attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    /// Micro-unit integer amount
    pub amount: String,
}

impl Coin {
    /// Build a coin from a whole-unit amount.
    pub fn from_whole(denom: impl Into<String>, amount: Decimal) -> Self {
        Self {
            denom: denom.into(),
            amount: to_micro_string(amount),
        }
    }
}

/// A contract execution message, the only message kind the bot emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: String,
    pub contract: String,
    pub execute_msg: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coins: Vec<Coin>,
}

impl Message {
    pub fn execute(sender: &str, contract: &str, execute_msg: Value) -> Self {
        Self {
            sender: sender.to_string(),
            contract: contract.to_string(),
            execute_msg,
            coins: Vec::new(),
        }
    }

    pub fn with_coins(mut self, coins: Vec<Coin>) -> Self {
        self.coins = coins;
        self
    }

    /// Name of the top-level execute action (`"borrow_stable"`, `"send"`, ...).
    pub fn action(&self) -> Option<&str> {
        self.execute_msg
            .as_object()
            .and_then(|obj| obj.keys().next())
            .map(String::as_str)
    }
}

/// Result of a successful broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub txhash: String,
    pub height: u64,
}

/// Asset identifier in synthetic-protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetInfo {
    Token { contract_addr: String },
    NativeToken { denom: String },
}

impl AssetInfo {
    pub fn token(contract_addr: impl Into<String>) -> Self {
        Self::Token {
            contract_addr: contract_addr.into(),
        }
    }

    pub fn native(denom: impl Into<String>) -> Self {
        Self::NativeToken {
            denom: denom.into(),
        }
    }

    /// The identifier the collateral oracle expects (contract address or denom).
    pub fn key(&self) -> &str {
        match self {
            Self::Token { contract_addr } => contract_addr,
            Self::NativeToken { denom } => denom,
        }
    }

    /// Build the `{ info, amount }` JSON asset with a whole-unit amount.
    pub fn to_asset_json(&self, amount: Decimal) -> Value {
        serde_json::json!({
            "info": self,
            "amount": to_micro_string(amount),
        })
    }
}

/// A synthetic-protocol CDP as returned by the mint contract.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionInfo {
    pub idx: String,
    pub collateral: AssetInfo,
    /// Micro units
    pub collateral_amount: Decimal,
    pub asset: AssetInfo,
    /// Micro units
    pub asset_amount: Decimal,
    pub is_short: bool,
}

/// Oracle quote for a synthetic asset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OraclePrice {
    /// Asset per stable unit; the asset price is `1 / rate`
    pub rate: Decimal,
    /// Sequence marker of the last quote update (unix seconds on Mirror)
    pub last_updated_quote: u64,
}

/// AMM pair reserves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolInfo {
    /// Stable-side reserve, micro units
    pub stable_reserve: Decimal,
    /// Asset-side reserve, micro units
    pub asset_reserve: Decimal,
    /// Total LP share supply, micro units
    pub total_share: Decimal,
}

impl PoolInfo {
    /// Pool price of one asset unit in stable.
    pub fn price(&self) -> Option<Decimal> {
        if self.asset_reserve.is_zero() {
            None
        } else {
            Some(self.stable_reserve / self.asset_reserve)
        }
    }
}

/// Staking entry of the wallet for one asset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RewardInfo {
    /// Bonded LP amount, micro units
    pub bond_amount: Decimal,
    pub is_short: bool,
}

/// Reverse swap simulation: cost in stable to receive a given asset amount.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapSimulation {
    pub offer_amount: Decimal,
    pub spread_amount: Decimal,
    pub commission_amount: Decimal,
}

impl SwapSimulation {
    /// Total stable spent, micro units.
    pub fn total_cost(&self) -> Decimal {
        self.offer_amount + self.spread_amount + self.commission_amount
    }
}
