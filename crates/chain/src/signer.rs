//! Transaction signing through an external signing relay.
//!
//! The relay owns the wallet key. We hand it the unsigned messages plus
//! account number, sequence and fee settings and get a signed StdTx back,
//! ready for broadcast.
//!
//! Sequence numbers are tracked locally with atomics so consecutive
//! transactions do not need an account query each time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{ChainError, ChainResult};
use crate::types::Message;

/// Default gas price paid in the stable denom.
pub const DEFAULT_GAS_PRICES: &str = "0.15uusd";
/// Default multiplier on simulated gas.
pub const DEFAULT_GAS_ADJUSTMENT: f64 = 1.4;

/// Account fields required to sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountInfo {
    pub account_number: u64,
    pub sequence: u64,
}

/// Cached account sequence.
#[derive(Debug)]
pub struct SequenceManager {
    current: AtomicU64,
}

impl SequenceManager {
    pub fn new(initial: u64) -> Self {
        Self {
            current: AtomicU64::new(initial),
        }
    }

    /// Take the next sequence and advance the counter.
    #[inline]
    pub fn next(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst)
    }

    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Give back a sequence that was never broadcast.
    ///
    /// Only rolls back when `sequence` is the most recently issued one.
    pub fn rollback(&self, sequence: u64) {
        let _ = self.current.compare_exchange(
            sequence + 1,
            sequence,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Reset to the chain value (after a failed broadcast).
    pub fn reset(&self, chain_sequence: u64) {
        self.current.store(chain_sequence, Ordering::SeqCst);
    }
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    chain_id: &'a str,
    account_number: u64,
    sequence: u64,
    msgs: &'a [Message],
    gas_prices: &'a str,
    gas_adjustment: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    memo: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    tx: Value,
}

/// Client for the signing relay.
pub struct SigningRelay {
    client: reqwest::Client,
    url: String,
    chain_id: String,
    gas_prices: String,
    gas_adjustment: f64,
    memo: Option<String>,
    account_number: AtomicU64,
    sequence: SequenceManager,
}

impl std::fmt::Debug for SigningRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningRelay")
            .field("url", &self.url)
            .field("chain_id", &self.chain_id)
            .field("gas_prices", &self.gas_prices)
            .field("gas_adjustment", &self.gas_adjustment)
            .finish()
    }
}

/// Builder for [`SigningRelay`].
pub struct SigningRelayBuilder {
    url: String,
    chain_id: String,
    gas_prices: Option<String>,
    gas_adjustment: Option<f64>,
    memo: Option<String>,
    timeout: Duration,
}

impl SigningRelayBuilder {
    pub fn new(url: impl Into<String>, chain_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            chain_id: chain_id.into(),
            gas_prices: None,
            gas_adjustment: None,
            memo: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn gas_prices(mut self, prices: impl Into<String>) -> Self {
        self.gas_prices = Some(prices.into());
        self
    }

    pub fn gas_adjustment(mut self, adjustment: f64) -> Self {
        self.gas_adjustment = Some(adjustment);
        self
    }

    pub fn memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> ChainResult<SigningRelay> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|source| ChainError::Http {
                path: self.url.clone(),
                source,
            })?;

        let relay = SigningRelay {
            client,
            url: self.url.trim_end_matches('/').to_string(),
            chain_id: self.chain_id,
            gas_prices: self.gas_prices.unwrap_or_else(|| DEFAULT_GAS_PRICES.to_string()),
            gas_adjustment: self.gas_adjustment.unwrap_or(DEFAULT_GAS_ADJUSTMENT),
            memo: self.memo,
            account_number: AtomicU64::new(0),
            sequence: SequenceManager::new(0),
        };

        info!(
            relay = %relay.url,
            chain_id = %relay.chain_id,
            gas_prices = %relay.gas_prices,
            gas_adjustment = relay.gas_adjustment,
            "Signing relay configured"
        );

        Ok(relay)
    }
}

impl SigningRelay {
    pub fn sequence(&self) -> &SequenceManager {
        &self.sequence
    }

    /// Adopt account number and sequence read from chain.
    pub fn sync_account(&self, account: AccountInfo) {
        self.account_number
            .store(account.account_number, Ordering::SeqCst);
        self.sequence.reset(account.sequence);
    }

    pub fn account_number(&self) -> u64 {
        self.account_number.load(Ordering::SeqCst)
    }

    /// Ask the relay to sign `messages` at `sequence`.
    pub async fn sign(&self, messages: &[Message], sequence: u64) -> ChainResult<Value> {
        let start = Instant::now();
        let request = SignRequest {
            chain_id: &self.chain_id,
            account_number: self.account_number(),
            sequence,
            msgs: messages,
            gas_prices: &self.gas_prices,
            gas_adjustment: self.gas_adjustment,
            memo: self.memo.as_deref(),
        };

        let url = format!("{}/sign", self.url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|source| ChainError::Http {
                path: "/sign".to_string(),
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChainError::Signing(format!("{status}: {body}")));
        }

        let signed: SignResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Signing(e.to_string()))?;

        debug!(
            sequence = sequence,
            messages = messages.len(),
            sign_ms = start.elapsed().as_millis(),
            "Transaction signed"
        );

        Ok(signed.tx)
    }
}
