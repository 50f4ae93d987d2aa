//! Rebalancer operator-facing clients.
//!
//! This crate provides:
//! - The [`Notifier`] trait and the [`Event`]s the engine reports
//! - A tracing-backed console notifier
//! - A Telegram Bot API notifier (HTML messages)

mod notifier;
mod telegram;

pub use notifier::{
    escape_html, ConsoleNotifier, Event, FacilityAction, FundingEvent, Notifier,
    NotifierRegistry, NullNotifier,
};
pub use telegram::{mask_token, TelegramNotifier};
