//! Rebalancer configuration with profile support.
//!
//! Provides every tunable of the engine with support for different
//! profiles (default, conservative, aggressive). The engine owns one
//! validated instance; runtime changes go through [`BotConfig::update_field`]
//! and only touch the fields enumerated by [`ConfigField`].

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ValidationError;

/// Main configuration structure containing all bot parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    /// Credit facility LTV band (percent)
    #[serde(default)]
    pub ltv: LtvBand,

    /// Synthetic position OCR margin band (percent)
    #[serde(default)]
    pub ocr: OcrBand,

    #[serde(default)]
    pub facility: FacilityConfig,

    /// Liquidity sourcing thresholds
    #[serde(default)]
    pub sourcing: SourcingConfig,

    /// Redeployment of spare deposits into synthetic exposure
    #[serde(default)]
    pub farming: FarmingConfig,

    /// Loop timing and failure handling
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Credit facility LTV thresholds, in percent.
///
/// Above `limit` the engine repays down to `safe`; below `borrow` it
/// borrows up to `safe`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LtvBand {
    #[serde(default = "default_ltv_limit")]
    pub limit: Decimal,
    #[serde(default = "default_ltv_safe")]
    pub safe: Decimal,
    #[serde(default = "default_ltv_borrow")]
    pub borrow: Decimal,
}

fn default_ltv_limit() -> Decimal {
    dec!(45)
}
fn default_ltv_safe() -> Decimal {
    dec!(40)
}
fn default_ltv_borrow() -> Decimal {
    dec!(35)
}

impl Default for LtvBand {
    fn default() -> Self {
        Self {
            limit: default_ltv_limit(),
            safe: default_ltv_safe(),
            borrow: default_ltv_borrow(),
        }
    }
}

/// Relative OCR margin thresholds, in percent.
///
/// Below `limit` a position is repaired up to `safe`; above `borrow` it
/// is expanded down to `safe`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OcrBand {
    #[serde(default = "default_ocr_limit")]
    pub limit: Decimal,
    #[serde(default = "default_ocr_safe")]
    pub safe: Decimal,
    #[serde(default = "default_ocr_borrow")]
    pub borrow: Decimal,
}

fn default_ocr_limit() -> Decimal {
    dec!(10.5)
}
fn default_ocr_safe() -> Decimal {
    dec!(11)
}
fn default_ocr_borrow() -> Decimal {
    dec!(11.5)
}

impl Default for OcrBand {
    fn default() -> Self {
        Self {
            limit: default_ocr_limit(),
            safe: default_ocr_safe(),
            borrow: default_ocr_borrow(),
        }
    }
}

impl OcrBand {
    /// Band as fractional margins (10.5 -> 0.105).
    pub fn as_fractions(&self) -> (Decimal, Decimal, Decimal) {
        (
            self.limit / dec!(100),
            self.safe / dec!(100),
            self.borrow / dec!(100),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FacilityConfig {
    /// Multiplier between borrow limit and the LTV denominator
    #[serde(default = "default_collateral_factor")]
    pub collateral_factor: Decimal,

    /// Whether to borrow more when LTV drops below the band
    #[serde(default = "default_should_borrow_more")]
    pub should_borrow_more: bool,
}

fn default_collateral_factor() -> Decimal {
    dec!(2)
}
fn default_should_borrow_more() -> bool {
    true
}

impl Default for FacilityConfig {
    fn default() -> Self {
        Self {
            collateral_factor: default_collateral_factor(),
            should_borrow_more: default_should_borrow_more(),
        }
    }
}

impl FacilityConfig {
    /// Highest LTV (percent) the facility can reach.
    pub fn hard_ceiling(&self) -> Decimal {
        dec!(100) / self.collateral_factor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourcingConfig {
    /// Cash kept aside for fees when paying from the wallet alone
    #[serde(default = "default_cash_buffer")]
    pub cash_buffer: Decimal,

    /// Deposits at or below this value are not worth withdrawing
    #[serde(default = "default_deposit_dust")]
    pub deposit_dust: Decimal,

    /// Claim and sell reward tokens when cash and deposit fall short
    #[serde(default)]
    pub use_rewards: bool,
}

fn default_cash_buffer() -> Decimal {
    dec!(10)
}
fn default_deposit_dust() -> Decimal {
    dec!(10)
}

impl Default for SourcingConfig {
    fn default() -> Self {
        Self {
            cash_buffer: default_cash_buffer(),
            deposit_dust: default_deposit_dust(),
            use_rewards: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FarmingConfig {
    /// Deposit/lent ratio (percent) above which deposits are redeployed
    #[serde(default = "default_max_deposit_to_lent_ratio")]
    pub max_deposit_to_lent_ratio: Decimal,

    /// Extra share of the lent value (percent) redeployed on top of the excess
    #[serde(default = "default_fraction_to_farm")]
    pub fraction_to_farm: Decimal,

    /// Smallest stable value worth staking or shorting
    #[serde(default = "default_min_farm_value")]
    pub min_farm_value: Decimal,

    /// Multiplier covering swap and LP fees
    #[serde(default = "default_fee_buffer")]
    pub fee_buffer: Decimal,
}

fn default_max_deposit_to_lent_ratio() -> Decimal {
    dec!(40)
}
fn default_fraction_to_farm() -> Decimal {
    dec!(10)
}
fn default_min_farm_value() -> Decimal {
    dec!(50)
}
fn default_fee_buffer() -> Decimal {
    dec!(1.005)
}

impl Default for FarmingConfig {
    fn default() -> Self {
        Self {
            max_deposit_to_lent_ratio: default_max_deposit_to_lent_ratio(),
            fraction_to_farm: default_fraction_to_farm(),
            min_farm_value: default_min_farm_value(),
            fee_buffer: default_fee_buffer(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Delay between the end of one cycle and the start of the next (seconds)
    #[serde(default = "default_wait_for")]
    pub wait_for_secs: u64,

    /// Consecutive failures before the engine pauses itself
    #[serde(default = "default_max_failure")]
    pub max_failure: u32,

    /// Cooldown before an automatic pause is lifted (seconds)
    #[serde(default = "default_auto_resume")]
    pub auto_resume_secs: u64,

    /// Bound on every collaborator call (seconds)
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,

    /// Re-read the wallet's positions every N cycles
    #[serde(default = "default_rediscovery_interval")]
    pub rediscovery_interval: u64,
}

fn default_wait_for() -> u64 {
    10
}
fn default_max_failure() -> u32 {
    5
}
fn default_auto_resume() -> u64 {
    300
}
fn default_rpc_timeout() -> u64 {
    30
}
fn default_rediscovery_interval() -> u64 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wait_for_secs: default_wait_for(),
            max_failure: default_max_failure(),
            auto_resume_secs: default_auto_resume(),
            rpc_timeout_secs: default_rpc_timeout(),
            rediscovery_interval: default_rediscovery_interval(),
        }
    }
}

impl EngineConfig {
    pub fn wait_for(&self) -> Duration {
        Duration::from_secs(self.wait_for_secs)
    }
    pub fn auto_resume(&self) -> Duration {
        Duration::from_secs(self.auto_resume_secs)
    }
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            ltv: LtvBand::default(),
            ocr: OcrBand::default(),
            facility: FacilityConfig::default(),
            sourcing: SourcingConfig::default(),
            farming: FarmingConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

/// Fields that may change while the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
    LtvLimit,
    LtvSafe,
    LtvBorrow,
    OcrLimit,
    OcrSafe,
    OcrBorrow,
    ShouldBorrowMore,
    UseRewards,
    MaxDepositToLentRatio,
    FractionToFarm,
    WaitFor,
    MaxFailure,
}

impl ConfigField {
    pub const ALL: [ConfigField; 12] = [
        Self::LtvLimit,
        Self::LtvSafe,
        Self::LtvBorrow,
        Self::OcrLimit,
        Self::OcrSafe,
        Self::OcrBorrow,
        Self::ShouldBorrowMore,
        Self::UseRewards,
        Self::MaxDepositToLentRatio,
        Self::FractionToFarm,
        Self::WaitFor,
        Self::MaxFailure,
    ];

    /// Dotted path of the field in the TOML file.
    pub fn path(&self) -> &'static str {
        match self {
            Self::LtvLimit => "ltv.limit",
            Self::LtvSafe => "ltv.safe",
            Self::LtvBorrow => "ltv.borrow",
            Self::OcrLimit => "ocr.limit",
            Self::OcrSafe => "ocr.safe",
            Self::OcrBorrow => "ocr.borrow",
            Self::ShouldBorrowMore => "facility.should_borrow_more",
            Self::UseRewards => "sourcing.use_rewards",
            Self::MaxDepositToLentRatio => "farming.max_deposit_to_lent_ratio",
            Self::FractionToFarm => "farming.fraction_to_farm",
            Self::WaitFor => "engine.wait_for_secs",
            Self::MaxFailure => "engine.max_failure",
        }
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for ConfigField {
    type Err = ValidationError;

    /// Accepts the TOML path plus the short names operators type in chat.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        let field = match normalized.as_str() {
            "ltv.limit" => Self::LtvLimit,
            "ltv.safe" => Self::LtvSafe,
            "ltv.borrow" => Self::LtvBorrow,
            "ocr.limit" | "mocr.limit" => Self::OcrLimit,
            "ocr.safe" | "mocr.safe" => Self::OcrSafe,
            "ocr.borrow" | "mocr.borrow" => Self::OcrBorrow,
            "facility.should_borrow_more" | "options.shouldborrowmore" | "should_borrow_more" => {
                Self::ShouldBorrowMore
            }
            "sourcing.use_rewards" | "options.shouldcompoundsrewards" | "use_rewards" => {
                Self::UseRewards
            }
            "farming.max_deposit_to_lent_ratio" | "maxdeposittolentratio" => {
                Self::MaxDepositToLentRatio
            }
            "farming.fraction_to_farm" | "fractiontomirfarm" => Self::FractionToFarm,
            "engine.wait_for_secs" | "options.waitfor" => Self::WaitFor,
            "engine.max_failure" => Self::MaxFailure,
            _ => return Err(ValidationError::UnknownField(s.to_string())),
        };
        Ok(field)
    }
}

fn parse_decimal_field(field: ConfigField, raw: &str) -> Result<Decimal, ValidationError> {
    raw.trim().parse().map_err(|_| ValidationError::Parse {
        field: field.path().to_string(),
        expected: "a number",
        value: raw.to_string(),
    })
}

fn parse_integer_field<T: FromStr>(field: ConfigField, raw: &str) -> Result<T, ValidationError> {
    raw.trim().parse().map_err(|_| ValidationError::Parse {
        field: field.path().to_string(),
        expected: "a whole number",
        value: raw.to_string(),
    })
}

fn parse_bool_field(field: ConfigField, raw: &str) -> Result<bool, ValidationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ValidationError::Parse {
            field: field.path().to_string(),
            expected: "a boolean (true/false)",
            value: raw.to_string(),
        }),
    }
}

impl BotConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Lower band, wider failure tolerance.
    pub fn conservative() -> Self {
        Self {
            profile: "conservative".to_string(),
            ltv: LtvBand {
                limit: dec!(40),
                safe: dec!(35),
                borrow: dec!(25),
            },
            ocr: OcrBand {
                limit: dec!(20),
                safe: dec!(25),
                borrow: dec!(30),
            },
            facility: FacilityConfig::default(),
            sourcing: SourcingConfig {
                cash_buffer: dec!(25),
                deposit_dust: dec!(10),
                use_rewards: false,
            },
            farming: FarmingConfig {
                max_deposit_to_lent_ratio: dec!(60),
                fraction_to_farm: dec!(5),
                min_farm_value: dec!(100),
                fee_buffer: dec!(1.01),
            },
            engine: EngineConfig {
                wait_for_secs: 30,
                max_failure: 3,
                auto_resume_secs: 600,
                ..Default::default()
            },
        }
    }

    /// Band close to the facility ceiling, tight loop.
    pub fn aggressive() -> Self {
        Self {
            profile: "aggressive".to_string(),
            ltv: LtvBand {
                limit: dec!(49),
                safe: dec!(47),
                borrow: dec!(45),
            },
            ocr: OcrBand::default(),
            facility: FacilityConfig::default(),
            sourcing: SourcingConfig::default(),
            farming: FarmingConfig {
                max_deposit_to_lent_ratio: dec!(30),
                fraction_to_farm: dec!(15),
                ..Default::default()
            },
            engine: EngineConfig {
                wait_for_secs: 5,
                rpc_timeout_secs: 15,
                ..Default::default()
            },
        }
    }

    /// Get profile from environment variable BOT_PROFILE, or default.
    /// Supported values: default, conservative, aggressive
    pub fn from_env() -> Self {
        let profile = std::env::var("BOT_PROFILE").unwrap_or_else(|_| "default".to_string());
        match profile.to_lowercase().as_str() {
            "conservative" | "safe" => Self::conservative(),
            "aggressive" | "aggro" => Self::aggressive(),
            _ => Self::default(),
        }
    }

    /// `BOT_CONFIG` file if set, otherwise the `BOT_PROFILE` profile.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var("BOT_CONFIG") {
            Ok(path) => Self::from_file(&path),
            Err(_) => {
                let config = Self::from_env();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Check every cross-field bound.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let cf = self.facility.collateral_factor;
        if cf <= Decimal::ZERO {
            return Err(ValidationError::bound("facility.collateral_factor", "positive"));
        }

        let max_limit = self.facility.hard_ceiling() - Decimal::ONE;
        if self.ltv.limit > max_limit {
            return Err(ValidationError::bound("ltv.limit", format!("at most {max_limit}")));
        }
        if self.ltv.safe >= self.ltv.limit {
            return Err(ValidationError::bound("ltv.safe", format!("below {}", self.ltv.limit)));
        }
        if self.ltv.borrow >= self.ltv.safe {
            return Err(ValidationError::bound("ltv.borrow", format!("below {}", self.ltv.safe)));
        }
        if self.ltv.borrow < Decimal::ZERO {
            return Err(ValidationError::bound("ltv.borrow", "at least 0"));
        }

        if self.ocr.limit < Decimal::ZERO {
            return Err(ValidationError::bound("ocr.limit", "at least 0"));
        }
        if self.ocr.safe <= self.ocr.limit {
            return Err(ValidationError::bound("ocr.safe", format!("above {}", self.ocr.limit)));
        }
        if self.ocr.borrow <= self.ocr.safe {
            return Err(ValidationError::bound("ocr.borrow", format!("above {}", self.ocr.safe)));
        }

        if self.sourcing.cash_buffer < Decimal::ZERO {
            return Err(ValidationError::bound("sourcing.cash_buffer", "at least 0"));
        }
        if self.sourcing.deposit_dust < Decimal::ZERO {
            return Err(ValidationError::bound("sourcing.deposit_dust", "at least 0"));
        }

        if self.farming.max_deposit_to_lent_ratio < Decimal::ZERO {
            return Err(ValidationError::bound(
                "farming.max_deposit_to_lent_ratio",
                "at least 0",
            ));
        }
        if self.farming.fraction_to_farm < Decimal::ZERO || self.farming.fraction_to_farm > dec!(100)
        {
            return Err(ValidationError::bound("farming.fraction_to_farm", "between 0 and 100"));
        }
        if self.farming.fee_buffer < Decimal::ONE {
            return Err(ValidationError::bound("farming.fee_buffer", "at least 1"));
        }

        if self.engine.wait_for_secs == 0 {
            return Err(ValidationError::bound("engine.wait_for_secs", "at least 1"));
        }
        if self.engine.max_failure == 0 {
            return Err(ValidationError::bound("engine.max_failure", "at least 1"));
        }
        if self.engine.rpc_timeout_secs == 0 {
            return Err(ValidationError::bound("engine.rpc_timeout_secs", "at least 1"));
        }

        Ok(())
    }

    /// Change one field, keeping the config valid.
    ///
    /// Returns the applied value rendered for display. On error nothing changes.
    pub fn update_field(&mut self, field: ConfigField, raw: &str) -> Result<String, ValidationError> {
        let mut next = self.clone();
        let applied = match field {
            ConfigField::LtvLimit => {
                next.ltv.limit = parse_decimal_field(field, raw)?;
                next.ltv.limit.to_string()
            }
            ConfigField::LtvSafe => {
                next.ltv.safe = parse_decimal_field(field, raw)?;
                next.ltv.safe.to_string()
            }
            ConfigField::LtvBorrow => {
                next.ltv.borrow = parse_decimal_field(field, raw)?;
                next.ltv.borrow.to_string()
            }
            ConfigField::OcrLimit => {
                next.ocr.limit = parse_decimal_field(field, raw)?;
                next.ocr.limit.to_string()
            }
            ConfigField::OcrSafe => {
                next.ocr.safe = parse_decimal_field(field, raw)?;
                next.ocr.safe.to_string()
            }
            ConfigField::OcrBorrow => {
                next.ocr.borrow = parse_decimal_field(field, raw)?;
                next.ocr.borrow.to_string()
            }
            ConfigField::ShouldBorrowMore => {
                next.facility.should_borrow_more = parse_bool_field(field, raw)?;
                next.facility.should_borrow_more.to_string()
            }
            ConfigField::UseRewards => {
                next.sourcing.use_rewards = parse_bool_field(field, raw)?;
                next.sourcing.use_rewards.to_string()
            }
            ConfigField::MaxDepositToLentRatio => {
                next.farming.max_deposit_to_lent_ratio = parse_decimal_field(field, raw)?;
                next.farming.max_deposit_to_lent_ratio.to_string()
            }
            ConfigField::FractionToFarm => {
                next.farming.fraction_to_farm = parse_decimal_field(field, raw)?;
                next.farming.fraction_to_farm.to_string()
            }
            ConfigField::WaitFor => {
                next.engine.wait_for_secs = parse_integer_field(field, raw)?;
                next.engine.wait_for_secs.to_string()
            }
            ConfigField::MaxFailure => {
                next.engine.max_failure = parse_integer_field(field, raw)?;
                next.engine.max_failure.to_string()
            }
        };

        next.validate()?;
        *self = next;
        Ok(applied)
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Bot configuration loaded");
        tracing::info!(
            limit = %self.ltv.limit,
            safe = %self.ltv.safe,
            borrow = %self.ltv.borrow,
            collateral_factor = %self.facility.collateral_factor,
            should_borrow_more = self.facility.should_borrow_more,
            "LTV band"
        );
        tracing::info!(
            cash_buffer = %self.sourcing.cash_buffer,
            deposit_dust = %self.sourcing.deposit_dust,
            use_rewards = self.sourcing.use_rewards,
            "Liquidity sourcing"
        );
        tracing::info!(
            limit = %self.ocr.limit,
            safe = %self.ocr.safe,
            borrow = %self.ocr.borrow,
            "OCR margin band"
        );
        tracing::info!(
            max_deposit_to_lent = %self.farming.max_deposit_to_lent_ratio,
            fraction_to_farm = %self.farming.fraction_to_farm,
            min_farm_value = %self.farming.min_farm_value,
            "Farming parameters"
        );
        tracing::info!(
            wait_for_secs = self.engine.wait_for_secs,
            max_failure = self.engine.max_failure,
            auto_resume_secs = self.engine.auto_resume_secs,
            rpc_timeout_secs = self.engine.rpc_timeout_secs,
            "Engine timing"
        );
    }
}
