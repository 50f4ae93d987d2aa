//! LCD (REST) client for a CosmWasm chain.
//! Implements [`ChainClient`] over plain HTTP; signing is delegated to a
//! [`SigningRelay`] so the process never holds key material.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use crate::client::ChainClient;
use crate::error::{ChainError, ChainResult};
use crate::signer::{AccountInfo, SigningRelay};
use crate::types::{from_micro, parse_decimal, Message, TxReceipt};

/// Legacy LCD responses wrap their payload in `{ height, result }`.
#[derive(Debug, Deserialize)]
struct LcdEnvelope {
    result: Value,
}

#[derive(Debug, Deserialize)]
struct BroadcastResponse {
    #[serde(default)]
    height: Option<String>,
    txhash: String,
    #[serde(default)]
    code: Option<u32>,
    #[serde(default)]
    raw_log: Option<String>,
}

/// HTTP client bound to one wallet.
pub struct LcdClient {
    client: reqwest::Client,
    base_url: String,
    address: String,
    signer: SigningRelay,
}

impl std::fmt::Debug for LcdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LcdClient")
            .field("base_url", &self.base_url)
            .field("address", &self.address)
            .finish()
    }
}

impl LcdClient {
    /// Create a client and sync the account sequence from chain.
    pub async fn connect(
        base_url: &str,
        address: &str,
        signer: SigningRelay,
        request_timeout: Duration,
    ) -> ChainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|source| ChainError::Http {
                path: base_url.to_string(),
                source,
            })?;

        let lcd = Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            address: address.to_string(),
            signer,
        };

        let height = lcd.latest_height().await?;
        let account = lcd.account_info().await?;
        lcd.signer.sync_account(account);

        info!(
            lcd = %lcd.base_url,
            address = %lcd.address,
            height = height,
            account_number = account.account_number,
            sequence = account.sequence,
            "LCD connection verified"
        );

        Ok(lcd)
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> ChainResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|source| ChainError::Http {
                path: path.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ChainError::Status {
                path: path.to_string(),
                status,
                body,
            });
        }

        response.json::<Value>().await.map_err(|source| ChainError::Http {
            path: path.to_string(),
            source,
        })
    }

    async fn get_result(&self, path: &str, query: &[(&str, String)]) -> ChainResult<Value> {
        let value = self.get(path, query).await?;
        let envelope: LcdEnvelope = serde_json::from_value(value)
            .map_err(|e| ChainError::decode(path, e.to_string()))?;
        Ok(envelope.result)
    }

    /// Latest block height.
    pub async fn latest_height(&self) -> ChainResult<u64> {
        let block = self.get("/blocks/latest", &[]).await?;
        block["block"]["header"]["height"]
            .as_str()
            .and_then(|h| h.parse().ok())
            .ok_or_else(|| ChainError::decode("/blocks/latest", "missing block height"))
    }

    /// Account number and sequence of the wallet.
    pub async fn account_info(&self) -> ChainResult<AccountInfo> {
        let path = format!("/auth/accounts/{}", self.address);
        let result = self.get_result(&path, &[]).await?;
        let value = &result["value"];
        let field = |name: &str| -> ChainResult<u64> {
            match &value[name] {
                Value::String(s) => s.parse().ok(),
                Value::Number(n) => n.as_u64(),
                _ => None,
            }
            .ok_or_else(|| ChainError::decode(&path, format!("missing {name}")))
        };

        Ok(AccountInfo {
            account_number: field("account_number")?,
            sequence: field("sequence")?,
        })
    }

    async fn broadcast_signed(&self, signed_tx: Value) -> ChainResult<TxReceipt> {
        let url = format!("{}/txs", self.base_url);
        let body = serde_json::json!({ "tx": signed_tx, "mode": "block" });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|source| ChainError::Http {
                path: "/txs".to_string(),
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ChainError::Status {
                path: "/txs".to_string(),
                status,
                body,
            });
        }

        let result: BroadcastResponse = response.json().await.map_err(|source| ChainError::Http {
            path: "/txs".to_string(),
            source,
        })?;

        if let Some(code) = result.code.filter(|c| *c != 0) {
            return Err(ChainError::TxFailed {
                txhash: result.txhash,
                code,
                raw_log: result.raw_log.unwrap_or_default(),
            });
        }

        Ok(TxReceipt {
            txhash: result.txhash,
            height: result.height.and_then(|h| h.parse().ok()).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ChainClient for LcdClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn get_balance(&self, denom: &str) -> ChainResult<Decimal> {
        let path = format!("/bank/balances/{}", self.address);
        let result = self.get_result(&path, &[]).await?;
        let coins = result
            .as_array()
            .ok_or_else(|| ChainError::decode(&path, "balances is not an array"))?;

        let amount = coins
            .iter()
            .find(|coin| coin["denom"].as_str() == Some(denom))
            .and_then(|coin| parse_decimal(&coin["amount"]))
            .unwrap_or(Decimal::ZERO);

        Ok(from_micro(amount))
    }

    async fn get_token_balance(&self, token: &str) -> ChainResult<Decimal> {
        let query = serde_json::json!({ "balance": { "address": self.address } });
        let result = self.query_contract(token, &query).await?;
        let amount = parse_decimal(&result["balance"])
            .ok_or_else(|| ChainError::decode(token, "missing cw20 balance"))?;
        Ok(from_micro(amount))
    }

    async fn query_contract(&self, contract: &str, query: &Value) -> ChainResult<Value> {
        let path = format!("/wasm/contracts/{}/store", contract);
        self.get_result(&path, &[("query_msg", query.to_string())]).await
    }

    async fn sign_and_broadcast(&self, messages: &[Message]) -> ChainResult<TxReceipt> {
        let sequence = self.signer.sequence().next();
        let signed = match self.signer.sign(messages, sequence).await {
            Ok(tx) => tx,
            Err(e) => {
                self.signer.sequence().rollback(sequence);
                return Err(e);
            }
        };

        match self.broadcast_signed(signed).await {
            Ok(receipt) => {
                info!(
                    txhash = %receipt.txhash,
                    height = receipt.height,
                    messages = messages.len(),
                    "Transaction included"
                );
                Ok(receipt)
            }
            Err(e) => {
                // Re-read the sequence: a rejected tx may or may not have consumed it
                match self.account_info().await {
                    Ok(account) => self.signer.sync_account(account),
                    Err(sync_err) => {
                        warn!(error = %sync_err, "Failed to resync account sequence")
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::SigningRelayBuilder;

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_lcd_connect() {
        let signer = SigningRelayBuilder::new("http://localhost:9090", "columbus-5")
            .build()
            .unwrap();
        let lcd = LcdClient::connect(
            "https://lcd.terra.dev",
            "terra1dzhzukyezv0etz22ud940z7adyv7xgcjkahuun",
            signer,
            Duration::from_secs(10),
        )
        .await;

        assert!(lcd.is_ok());
    }
}
