//! Canned chain client for adapter tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;

use crate::client::ChainClient;
use crate::error::{ChainError, ChainResult};
use crate::types::{Message, TxReceipt};

/// Answers smart queries from a table keyed by contract and query name.
#[derive(Debug, Default)]
pub struct CannedChain {
    address: String,
    responses: HashMap<(String, String), Value>,
    pub broadcasts: Mutex<Vec<Vec<Message>>>,
}

impl CannedChain {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Default::default()
        }
    }

    pub fn with(mut self, contract: &str, query: &str, response: Value) -> Self {
        self.responses
            .insert((contract.to_string(), query.to_string()), response);
        self
    }
}

#[async_trait]
impl ChainClient for CannedChain {
    fn address(&self) -> &str {
        &self.address
    }

    async fn get_balance(&self, _denom: &str) -> ChainResult<Decimal> {
        Ok(Decimal::ZERO)
    }

    async fn get_token_balance(&self, _token: &str) -> ChainResult<Decimal> {
        Ok(Decimal::ZERO)
    }

    async fn query_contract(&self, contract: &str, query: &Value) -> ChainResult<Value> {
        let name = query
            .as_object()
            .and_then(|obj| obj.keys().next())
            .cloned()
            .unwrap_or_default();

        self.responses
            .get(&(contract.to_string(), name.clone()))
            .cloned()
            .ok_or_else(|| ChainError::Status {
                path: format!("/wasm/contracts/{contract}/store"),
                status: 500,
                body: format!("no canned response for {name}"),
            })
    }

    async fn sign_and_broadcast(&self, messages: &[Message]) -> ChainResult<TxReceipt> {
        let mut broadcasts = self.broadcasts.lock();
        broadcasts.push(messages.to_vec());
        Ok(TxReceipt {
            txhash: format!("TX{}", broadcasts.len()),
            height: 1,
        })
    }
}
