//! Network deployment configuration: endpoints, contract addresses and
//! the synthetic assets the bot manages.

use rebalancer_chain::{
    AnchorContracts, MirrorAsset, MirrorContracts, DEFAULT_GAS_ADJUSTMENT, DEFAULT_GAS_PRICES,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ValidationError;

/// Full network deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network: NetworkDetails,
    pub money_market: MoneyMarketContracts,
    pub synthetic: SyntheticContracts,
    /// Listed synthetic assets the bot can recognise
    #[serde(default)]
    pub assets: Vec<AssetEntry>,
    /// Symbols whose positions the engine manages; empty means all listed
    #[serde(default)]
    pub watch: Vec<String>,
}

/// Endpoints and wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDetails {
    /// Human-readable name (e.g., "columbus-5")
    pub name: String,
    pub chain_id: String,
    /// LCD REST endpoint
    pub lcd_url: String,
    /// Signing relay endpoint
    pub signer_url: String,
    pub wallet_address: String,
    #[serde(default = "default_gas_prices")]
    pub gas_prices: String,
    #[serde(default = "default_gas_adjustment")]
    pub gas_adjustment: f64,
    #[serde(default = "default_stable_denom")]
    pub stable_denom: String,
    /// Memo attached to every transaction
    #[serde(default)]
    pub memo: Option<String>,
}

fn default_gas_prices() -> String {
    DEFAULT_GAS_PRICES.to_string()
}

fn default_gas_adjustment() -> f64 {
    DEFAULT_GAS_ADJUSTMENT
}

fn default_stable_denom() -> String {
    "uusd".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoneyMarketContracts {
    pub market: String,
    pub overseer: String,
    pub deposit_token: String,
    pub reward_token: String,
    pub reward_pair: String,
    pub gov: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticContracts {
    pub mint: String,
    pub oracle: String,
    pub staking: String,
    pub collateral_oracle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    pub symbol: String,
    pub token: String,
    pub pair: String,
    pub lp_token: String,
}

impl NetworkConfig {
    /// Load from a TOML file, expanding `${VAR}` references.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let mut config: NetworkConfig = toml::from_str(content)?;
        config.expand_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by `NETWORK_CONFIG`, default `config/columbus-5.toml`.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = std::env::var("NETWORK_CONFIG")
            .unwrap_or_else(|_| "config/columbus-5.toml".to_string());
        Self::from_file(path)
    }

    /// Expand environment variables in endpoint and wallet values.
    pub fn expand_env_vars(&mut self) {
        let n = &mut self.network;
        n.lcd_url = expand_env(&n.lcd_url);
        n.signer_url = expand_env(&n.signer_url);
        n.wallet_address = expand_env(&n.wallet_address);
        n.chain_id = expand_env(&n.chain_id);
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let n = &self.network;
        for (field, value) in [
            ("network.lcd_url", &n.lcd_url),
            ("network.signer_url", &n.signer_url),
            ("network.wallet_address", &n.wallet_address),
            ("network.chain_id", &n.chain_id),
        ] {
            if value.is_empty() || value.contains("${") {
                return Err(ValidationError::bound(field, "set"));
            }
        }
        if n.gas_adjustment < 1.0 {
            return Err(ValidationError::bound("network.gas_adjustment", "at least 1"));
        }
        if let Some(symbol) = self
            .watch
            .iter()
            .find(|s| !self.assets.iter().any(|a| &a.symbol == *s))
        {
            return Err(ValidationError::UnknownField(format!("watch.{symbol}")));
        }
        Ok(())
    }

    pub fn anchor_contracts(&self) -> AnchorContracts {
        AnchorContracts {
            market: self.money_market.market.clone(),
            overseer: self.money_market.overseer.clone(),
            deposit_token: self.money_market.deposit_token.clone(),
            stable_denom: self.network.stable_denom.clone(),
            reward_token: self.money_market.reward_token.clone(),
            reward_pair: self.money_market.reward_pair.clone(),
            gov: self.money_market.gov.clone(),
        }
    }

    pub fn mirror_contracts(&self) -> MirrorContracts {
        MirrorContracts {
            mint: self.synthetic.mint.clone(),
            oracle: self.synthetic.oracle.clone(),
            staking: self.synthetic.staking.clone(),
            collateral_oracle: self.synthetic.collateral_oracle.clone(),
            stable_denom: self.network.stable_denom.clone(),
        }
    }

    pub fn mirror_assets(&self) -> Vec<MirrorAsset> {
        self.assets
            .iter()
            .map(|a| MirrorAsset {
                symbol: a.symbol.clone(),
                token: a.token.clone(),
                pair: a.pair.clone(),
                lp_token: a.lp_token.clone(),
            })
            .collect()
    }

    /// Symbols the engine manages.
    pub fn watched_symbols(&self) -> Vec<String> {
        if self.watch.is_empty() {
            self.assets.iter().map(|a| a.symbol.clone()).collect()
        } else {
            self.watch.clone()
        }
    }
}

/// Expand ${VAR_NAME} patterns with environment variable values.
fn expand_env(s: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        if let (Some(full_match), Some(var_match)) = (cap.get(0), cap.get(1)) {
            if let Ok(value) = std::env::var(var_match.as_str()) {
                result = result.replace(full_match.as_str(), &value);
            }
        }
    }
    result
}
