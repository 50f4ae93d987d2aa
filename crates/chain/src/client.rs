//! Chain capability consumed by the rebalancing core.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::fmt::Debug;

use crate::error::ChainResult;
use crate::types::{Message, TxReceipt};

/// Balance queries, contract queries and atomic broadcast for one wallet.
///
/// Implementations own all wire formats; callers only see whole-unit
/// decimals and JSON query results.
#[async_trait]
pub trait ChainClient: Send + Sync + Debug {
    /// Wallet address the client queries and signs for.
    fn address(&self) -> &str;

    /// Native balance of `denom`, whole units.
    async fn get_balance(&self, denom: &str) -> ChainResult<Decimal>;

    /// CW20 balance of `token`, whole units.
    async fn get_token_balance(&self, token: &str) -> ChainResult<Decimal>;

    /// Smart query against a contract.
    async fn query_contract(&self, contract: &str, query: &Value) -> ChainResult<Value>;

    /// Sign all messages into one transaction and broadcast it.
    ///
    /// Either every message executes or none does.
    async fn sign_and_broadcast(&self, messages: &[Message]) -> ChainResult<TxReceipt>;
}
