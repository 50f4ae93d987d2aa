//! Bounded access to the chain collaborators.
//!
//! Every query and broadcast the engine performs goes through
//! [`Gateway::call`], which applies the configured timeout and tags
//! failures with the operation name.

use rebalancer_chain::{
    AssetInfo, ChainClient, ChainResult, Message, MoneyMarketClient, SyntheticProtocolClient,
    TxReceipt,
};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// The three collaborators plus the timeout applied to each call.
#[derive(Debug, Clone)]
pub struct Gateway {
    chain: Arc<dyn ChainClient>,
    market: Arc<dyn MoneyMarketClient>,
    synthetic: Arc<dyn SyntheticProtocolClient>,
    stable_denom: String,
    timeout: Duration,
}

impl Gateway {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        market: Arc<dyn MoneyMarketClient>,
        synthetic: Arc<dyn SyntheticProtocolClient>,
        stable_denom: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            chain,
            market,
            synthetic,
            stable_denom: stable_denom.into(),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        self.chain.address()
    }

    pub fn market(&self) -> &dyn MoneyMarketClient {
        self.market.as_ref()
    }

    pub fn synthetic(&self) -> &dyn SyntheticProtocolClient {
        self.synthetic.as_ref()
    }

    pub fn stable_denom(&self) -> &str {
        &self.stable_denom
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Await `fut` for at most the configured timeout.
    pub async fn call<T, F>(&self, operation: &'static str, fut: F) -> EngineResult<T>
    where
        F: Future<Output = ChainResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(EngineError::Chain { operation, source }),
            Err(_) => {
                debug!(operation, timeout = ?self.timeout, "Collaborator call timed out");
                Err(EngineError::Timeout {
                    operation,
                    after: self.timeout,
                })
            }
        }
    }

    /// Wallet stable balance, whole units.
    pub async fn stable_balance(&self) -> EngineResult<Decimal> {
        self.call("get_balance", self.chain.get_balance(&self.stable_denom))
            .await
    }

    /// Wallet CW20 balance, whole units.
    pub async fn token_balance(&self, token: &str) -> EngineResult<Decimal> {
        self.call("get_token_balance", self.chain.get_token_balance(token))
            .await
    }

    /// Wallet balance of any collateral asset.
    pub async fn asset_balance(&self, asset: &AssetInfo) -> EngineResult<Decimal> {
        match asset {
            AssetInfo::Token { contract_addr } => self.token_balance(contract_addr).await,
            AssetInfo::NativeToken { denom } => {
                self.call("get_balance", self.chain.get_balance(denom)).await
            }
        }
    }

    /// Sign and broadcast `messages` as one transaction.
    pub async fn broadcast(&self, messages: &[Message]) -> EngineResult<TxReceipt> {
        self.call("sign_and_broadcast", self.chain.sign_and_broadcast(messages))
            .await
    }
}
