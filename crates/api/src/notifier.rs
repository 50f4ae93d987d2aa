//! Operator notifications.
//!
//! The engine emits [`Event`]s for every state transition and funding
//! decision; each registered [`Notifier`] decides how to deliver them.

use rust_decimal::Decimal;
use std::fmt;
use tracing::{info, warn};

/// Which facility action a rebalance took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacilityAction {
    Borrow,
    Repay,
}

impl fmt::Display for FacilityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Borrow => write!(f, "borrow"),
            Self::Repay => write!(f, "repay"),
        }
    }
}

/// Where the stable for one requirement came from.
#[derive(Debug, Clone, PartialEq)]
pub struct FundingEvent {
    pub required: Decimal,
    pub from_cash: Decimal,
    pub from_deposit: Decimal,
    /// Stable expected from selling claimed rewards
    pub from_rewards: Decimal,
    /// Stable expected from unwinding a synthetic position
    pub from_unwind: Decimal,
    /// Unfunded remainder
    pub shortfall: Decimal,
}

/// Events worth telling the operator about.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Bot started with the given LTV band.
    Started {
        network: String,
        address: String,
        ltv_limit: Decimal,
        ltv_safe: Decimal,
        ltv_borrow: Decimal,
    },
    /// Engine status transition.
    StatusChanged {
        from: String,
        to: String,
        reason: String,
    },
    /// Credit facility moved back toward its safe LTV.
    FacilityRebalanced {
        action: FacilityAction,
        amount: Decimal,
        ltv: Decimal,
    },
    /// Funding decision for a stable requirement.
    Funding(FundingEvent),
    /// A synthetic position was repaired or expanded.
    PositionAdjusted {
        asset: String,
        action: String,
        amount: Decimal,
        margin: Decimal,
    },
    /// A queued transaction was rejected and its queue discarded.
    BroadcastFailed {
        channel: String,
        operations: usize,
        error: String,
    },
    /// A cycle aborted.
    CycleFailed { failures: u32, error: String },
    /// Runtime configuration change.
    ConfigChanged { field: String, value: String },
    /// Rejected runtime configuration change.
    ConfigRejected { field: String, reason: String },
}

impl Event {
    /// HTML rendering for chat delivery.
    pub fn to_html(&self) -> String {
        match self {
            Self::Started {
                network,
                address,
                ltv_limit,
                ltv_safe,
                ltv_borrow,
            } => format!(
                "<b>Leverage Rebalancer</b>\n\n\
                 <b>Network:</b> <code>{network}</code>\n\
                 <b>Address:</b> <code>{address}</code>\n\n\
                 <u>Configuration:</u>\n\
                 - <b>SAFE:</b> <code>{ltv_safe}%</code>\n\
                 - <b>LIMIT:</b> <code>{ltv_limit}%</code>\n\
                 - <b>BORROW:</b> <code>{ltv_borrow}%</code>"
            ),
            Self::StatusChanged { from, to, reason } => {
                format!("Status <code>{from}</code> → <code>{to}</code>: {reason}")
            }
            Self::FacilityRebalanced { action, amount, ltv } => format!(
                "Facility {action} of <code>{}</code> at LTV <code>{}%</code>",
                amount.round_dp(2),
                ltv.round_dp(2)
            ),
            Self::Funding(e) => format!(
                "Need <code>{}</code>: cash <code>{}</code>, deposit <code>{}</code>, rewards <code>{}</code>, unwind <code>{}</code>, short <code>{}</code>",
                e.required.round_dp(2),
                e.from_cash.round_dp(2),
                e.from_deposit.round_dp(2),
                e.from_rewards.round_dp(2),
                e.from_unwind.round_dp(2),
                e.shortfall.round_dp(2)
            ),
            Self::PositionAdjusted {
                asset,
                action,
                amount,
                margin,
            } => format!(
                "{asset}: {action} <code>{}</code> (margin <code>{}</code>)",
                amount.round_dp(6),
                margin.round_dp(4)
            ),
            Self::BroadcastFailed {
                channel,
                operations,
                error,
            } => format!(
                "An error occured on <code>{channel}</code> ({operations} operations discarded)\n{}",
                escape_html(error)
            ),
            Self::CycleFailed { failures, error } => {
                format!("Cycle failed ({failures} in a row): {}", escape_html(error))
            }
            Self::ConfigChanged { field, value } => {
                format!("Configuration changed. <code>{field}</code> is now at <code>{value}</code>")
            }
            Self::ConfigRejected { field, reason } => {
                format!("Rejected <code>{field}</code>: {}", escape_html(reason))
            }
        }
    }
}

/// Escape the three characters Telegram's HTML mode reserves.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Receiver of engine events.
///
/// `notify` must return quickly; slow delivery spawns its own task.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: Event);
}

/// Broadcasts events to all registered notifiers.
#[derive(Default)]
pub struct NotifierRegistry {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl NotifierRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { notifiers: vec![] }
    }

    pub fn register(&mut self, notifier: Box<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

impl Notifier for NotifierRegistry {
    fn notify(&self, event: Event) {
        for notifier in &self.notifiers {
            notifier.notify(event.clone());
        }
    }
}

impl fmt::Debug for NotifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierRegistry")
            .field("notifiers", &self.notifiers.len())
            .finish()
    }
}

/// Drops every event.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: Event) {}
}

/// Writes events to the tracing log.
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, event: Event) {
        match event {
            Event::Started {
                network,
                address,
                ltv_limit,
                ltv_safe,
                ltv_borrow,
            } => info!(
                network = %network,
                address = %address,
                ltv_limit = %ltv_limit,
                ltv_safe = %ltv_safe,
                ltv_borrow = %ltv_borrow,
                "Rebalancer started"
            ),
            Event::StatusChanged { from, to, reason } => {
                info!(from = %from, to = %to, reason = %reason, "Status changed")
            }
            Event::FacilityRebalanced { action, amount, ltv } => {
                info!(action = %action, amount = %amount, ltv = %ltv, "Facility rebalanced")
            }
            Event::Funding(e) => info!(
                required = %e.required,
                from_cash = %e.from_cash,
                from_deposit = %e.from_deposit,
                from_rewards = %e.from_rewards,
                from_unwind = %e.from_unwind,
                shortfall = %e.shortfall,
                "Funding decision"
            ),
            Event::PositionAdjusted {
                asset,
                action,
                amount,
                margin,
            } => info!(
                asset = %asset,
                action = %action,
                amount = %amount,
                margin = %margin,
                "Position adjusted"
            ),
            Event::BroadcastFailed {
                channel,
                operations,
                error,
            } => warn!(
                channel = %channel,
                operations = operations,
                error = %error,
                "Broadcast failed, queue discarded"
            ),
            Event::CycleFailed { failures, error } => {
                warn!(failures = failures, error = %error, "Cycle failed")
            }
            Event::ConfigChanged { field, value } => {
                info!(field = %field, value = %value, "Configuration changed")
            }
            Event::ConfigRejected { field, reason } => {
                warn!(field = %field, reason = %reason, "Configuration change rejected")
            }
        }
    }
}
