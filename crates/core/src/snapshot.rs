//! Wallet balances captured once per cycle and passed down explicitly.

use rust_decimal::Decimal;
use tokio::time::Instant;

use crate::error::EngineResult;
use crate::gateway::Gateway;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleSnapshot {
    /// Wallet stable balance
    pub cash: Decimal,
    /// Stable value of the money-market deposit
    pub deposit: Decimal,
    /// Stable value of one deposit token
    pub exchange_rate: Decimal,
    pub taken_at: Instant,
}

impl CycleSnapshot {
    pub async fn capture(gateway: &Gateway) -> EngineResult<Self> {
        let market = gateway.market();
        let (cash, deposit, exchange_rate) = futures::try_join!(
            gateway.stable_balance(),
            gateway.call("get_deposit", market.get_deposit(gateway.address())),
            gateway.call("get_exchange_rate", market.get_exchange_rate()),
        )?;
        Ok(Self {
            cash,
            deposit,
            exchange_rate,
            taken_at: Instant::now(),
        })
    }

    /// Deposit tokens worth `stable` at the captured rate.
    pub fn deposit_tokens_for(&self, stable: Decimal) -> Decimal {
        if self.exchange_rate.is_zero() {
            return Decimal::ZERO;
        }
        stable / self.exchange_rate
    }
}
