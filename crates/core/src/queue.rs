//! Per-channel pending operation queues.
//!
//! A channel's queue is broadcast as one transaction or discarded whole.

use rebalancer_chain::Message;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Logical queue a trigger writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// The periodic loop
    Scheduled,
    /// Operator commands
    Manual,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for Channel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scheduled" | "main" => Ok(Self::Scheduled),
            "manual" | "tgbot" => Ok(Self::Manual),
            _ => Err(ValidationError::Parse {
                field: "channel".to_string(),
                expected: "scheduled or manual",
                value: s.to_string(),
            }),
        }
    }
}

/// What a queued group of messages is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Borrow,
    Repay,
    DepositStable,
    WithdrawDeposit,
    ClaimRewards,
    SellRewards,
    StakeRewards,
    Unstake,
    WithdrawLiquidity,
    Burn,
    Mint,
    DepositCollateral,
    WithdrawCollateral,
    BuyAndProvide,
    Stake,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Borrow => "borrow",
            Self::Repay => "repay",
            Self::DepositStable => "deposit_stable",
            Self::WithdrawDeposit => "withdraw_deposit",
            Self::ClaimRewards => "claim_rewards",
            Self::SellRewards => "sell_rewards",
            Self::StakeRewards => "stake_rewards",
            Self::Unstake => "unstake",
            Self::WithdrawLiquidity => "withdraw_liquidity",
            Self::Burn => "burn",
            Self::Mint => "mint",
            Self::DepositCollateral => "deposit_collateral",
            Self::WithdrawCollateral => "withdraw_collateral",
            Self::BuyAndProvide => "buy_and_provide",
            Self::Stake => "stake",
        };
        f.write_str(name)
    }
}

/// One step of a multi-step action.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OperationKind,
    pub messages: Vec<Message>,
}

impl Operation {
    pub fn new(kind: OperationKind, message: Message) -> Self {
        Self {
            kind,
            messages: vec![message],
        }
    }

    pub fn batch(kind: OperationKind, messages: Vec<Message>) -> Self {
        Self { kind, messages }
    }
}

#[derive(Debug, Default)]
pub struct PendingQueues {
    queues: HashMap<Channel, Vec<Operation>>,
}

impl PendingQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, channel: Channel, operation: Operation) {
        self.queues.entry(channel).or_default().push(operation);
    }

    pub fn extend(&mut self, channel: Channel, operations: impl IntoIterator<Item = Operation>) {
        self.queues.entry(channel).or_default().extend(operations);
    }

    /// Remove and return everything queued on `channel`.
    pub fn take(&mut self, channel: Channel) -> Vec<Operation> {
        self.queues.remove(&channel).unwrap_or_default()
    }

    pub fn clear(&mut self, channel: Channel) {
        self.queues.remove(&channel);
    }

    pub fn clear_all(&mut self) {
        self.queues.clear();
    }

    pub fn len(&self, channel: Channel) -> usize {
        self.queues.get(&channel).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(Vec::is_empty)
    }
}

/// Flatten operations into the transaction's message list, in order.
pub fn messages_of(operations: &[Operation]) -> Vec<Message> {
    operations
        .iter()
        .flat_map(|op| op.messages.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(kind: OperationKind, action: &str) -> Operation {
        Operation::new(kind, Message::execute("me", "c", json!({ action: {} })))
    }

    #[test]
    fn test_channels_are_independent() {
        let mut queues = PendingQueues::new();
        queues.push(Channel::Scheduled, op(OperationKind::Unstake, "unbond"));
        queues.push(Channel::Scheduled, op(OperationKind::Burn, "burn"));
        queues.push(Channel::Manual, op(OperationKind::Repay, "repay_stable"));
        assert_eq!(queues.len(Channel::Scheduled), 2);

        queues.clear(Channel::Manual);
        assert_eq!(queues.len(Channel::Manual), 0);
        assert_eq!(queues.len(Channel::Scheduled), 2);

        let taken = queues.take(Channel::Scheduled);
        let actions: Vec<_> = messages_of(&taken)
            .iter()
            .map(|m| m.action().unwrap().to_string())
            .collect();
        assert_eq!(actions, vec!["unbond", "burn"]);
        assert!(queues.is_empty());
    }

    #[test]
    fn test_channel_names() {
        assert_eq!("manual".parse::<Channel>().unwrap(), Channel::Manual);
        assert_eq!("main".parse::<Channel>().unwrap(), Channel::Scheduled);
        assert!("other".parse::<Channel>().is_err());
        assert_eq!(Channel::Scheduled.to_string(), "scheduled");
    }
}
