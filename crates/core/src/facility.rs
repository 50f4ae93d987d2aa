//! Money-market credit facility tracking.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::error::{EngineResult, FacilityError};
use crate::gateway::Gateway;

/// One stable loan against the money market.
///
/// LTV is `borrowed / (borrow_limit * collateral_factor) * 100`. The state
/// only changes through [`refresh`](Self::refresh) and the `record_*`
/// methods called after a successful broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditFacility {
    collateral_factor: Decimal,
    borrowed_value: Decimal,
    borrow_limit: Decimal,
    ltv: Decimal,
}

impl CreditFacility {
    pub fn new(collateral_factor: Decimal) -> Self {
        Self {
            collateral_factor,
            borrowed_value: Decimal::ZERO,
            borrow_limit: Decimal::ZERO,
            ltv: Decimal::ZERO,
        }
    }

    /// LTV in percent.
    pub fn ltv(&self) -> Decimal {
        self.ltv
    }

    pub fn borrowed_value(&self) -> Decimal {
        self.borrowed_value
    }

    pub fn borrow_limit(&self) -> Decimal {
        self.borrow_limit
    }

    /// Stable currently lent to the wallet.
    pub fn lent_value(&self) -> Decimal {
        self.borrowed_value
    }

    /// Highest LTV (percent) a target may ask for.
    pub fn hard_ceiling(&self) -> Decimal {
        dec!(100) / self.collateral_factor
    }

    pub fn set_collateral_factor(&mut self, collateral_factor: Decimal) {
        self.collateral_factor = collateral_factor;
    }

    /// Re-query borrowed value and limit, returning the new LTV.
    pub async fn refresh(&mut self, gateway: &Gateway) -> EngineResult<Decimal> {
        let account = gateway.address();
        let market = gateway.market();
        let (borrowed, limit) = futures::try_join!(
            gateway.call("get_borrowed_value", market.get_borrowed_value(account)),
            gateway.call("get_borrow_limit", market.get_borrow_limit(account)),
        )?;

        let ltv = self.apply(borrowed, limit)?;
        debug!(borrowed = %borrowed, limit = %limit, ltv = %ltv, "Facility refreshed");
        Ok(ltv)
    }

    /// Install freshly queried values.
    pub fn apply(&mut self, borrowed: Decimal, limit: Decimal) -> Result<Decimal, FacilityError> {
        let capacity = limit * self.collateral_factor;
        let ltv = if capacity.is_zero() {
            if borrowed > Decimal::ZERO {
                return Err(FacilityError::ZeroBorrowLimit { borrowed });
            }
            Decimal::ZERO
        } else {
            borrowed / capacity * dec!(100)
        };

        self.borrowed_value = borrowed;
        self.borrow_limit = limit;
        self.ltv = ltv.max(Decimal::ZERO);
        Ok(self.ltv)
    }

    fn check_target(&self, target: Decimal) -> Result<(), FacilityError> {
        let ceiling = self.hard_ceiling();
        if target < Decimal::ZERO || target > ceiling {
            return Err(FacilityError::InvalidTarget { target, ceiling });
        }
        Ok(())
    }

    fn loan_at(&self, target: Decimal) -> Decimal {
        target * self.borrow_limit * self.collateral_factor / dec!(100)
    }

    /// Stable to repay to bring LTV down to `target` percent.
    ///
    /// Negative when LTV is already below `target`; callers must guard.
    pub fn amount_to_repay(&self, target: Decimal) -> Result<Decimal, FacilityError> {
        self.check_target(target)?;
        Ok(self.borrowed_value - self.loan_at(target))
    }

    /// Stable to borrow to bring LTV up to `target` percent.
    pub fn amount_to_borrow(&self, target: Decimal) -> Result<Decimal, FacilityError> {
        self.check_target(target)?;
        Ok(self.loan_at(target) - self.borrowed_value)
    }

    pub fn record_borrow(&mut self, amount: Decimal) {
        self.borrowed_value += amount.max(Decimal::ZERO);
        self.recompute();
    }

    pub fn record_repay(&mut self, amount: Decimal) {
        self.borrowed_value = (self.borrowed_value - amount.max(Decimal::ZERO)).max(Decimal::ZERO);
        self.recompute();
    }

    fn recompute(&mut self) {
        let capacity = self.borrow_limit * self.collateral_factor;
        if !capacity.is_zero() {
            self.ltv = self.borrowed_value / capacity * dec!(100);
        }
    }
}
