//! Solana JSON-RPC ledger client

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{LedgerClient, Pubkey};
use crate::error::{DvpnError, Result};

/// Ledger client speaking `getAccountInfo` / `getProgramAccounts`
pub struct RpcLedger {
    url: String,
    program_id: Pubkey,
    client: Client,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct AccountInfoResult {
    value: Option<EncodedAccount>,
}

#[derive(Debug, Deserialize)]
struct EncodedAccount {
    /// `[payload, encoding]`
    data: (String, String),
}

#[derive(Debug, Deserialize)]
struct KeyedAccount {
    pubkey: String,
    account: EncodedAccount,
}

impl EncodedAccount {
    fn into_bytes(self) -> Result<Bytes> {
        let (payload, encoding) = self.data;
        if encoding != "base64" {
            return Err(DvpnError::LedgerUnavailable(format!(
                "unexpected account encoding {}",
                encoding
            )));
        }
        let raw = BASE64
            .decode(payload.as_bytes())
            .map_err(|e| DvpnError::LedgerUnavailable(format!("bad account payload: {}", e)))?;
        Ok(Bytes::from(raw))
    }
}

impl RpcLedger {
    /// Create a client for `url`, reading accounts owned by `program_id`
    pub fn new(url: impl Into<String>, program_id: Pubkey, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DvpnError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            program_id,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(method, id, "ledger rpc call");
        let resp = self.client.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(DvpnError::LedgerUnavailable(format!("{} {}: {}", method, status, text)));
        }

        let parsed: RpcResponse<T> = resp.json().await?;
        if let Some(err) = parsed.error {
            return Err(DvpnError::LedgerUnavailable(format!(
                "{} failed ({}): {}",
                method, err.code, err.message
            )));
        }
        parsed
            .result
            .ok_or_else(|| DvpnError::LedgerUnavailable(format!("{} returned no result", method)))
    }
}

#[async_trait]
impl LedgerClient for RpcLedger {
    async fn read_account(&self, address: &Pubkey) -> Result<Option<Bytes>> {
        let result: AccountInfoResult = self
            .call(
                "getAccountInfo",
                json!([address.to_string(), { "encoding": "base64", "commitment": "confirmed" }]),
            )
            .await?;
        result.value.map(EncodedAccount::into_bytes).transpose()
    }

    async fn list_accounts(&self, discriminator: &[u8; 8]) -> Result<Vec<(Pubkey, Bytes)>> {
        let filter = json!({
            "memcmp": {
                "offset": 0,
                "bytes": BASE64.encode(discriminator),
                "encoding": "base64",
            }
        });
        let accounts: Vec<KeyedAccount> = self
            .call(
                "getProgramAccounts",
                json!([
                    self.program_id.to_string(),
                    { "encoding": "base64", "commitment": "confirmed", "filters": [filter] }
                ]),
            )
            .await?;

        Ok(usable_accounts(accounts))
    }
}

/// Keyed accounts that parse; a malformed entry is skipped, not fatal
fn usable_accounts(accounts: Vec<KeyedAccount>) -> Vec<(Pubkey, Bytes)> {
    accounts
        .into_iter()
        .filter_map(|keyed| {
            let parsed = keyed
                .pubkey
                .parse::<Pubkey>()
                .and_then(|address| Ok((address, keyed.account.into_bytes()?)));
            match parsed {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(account = %keyed.pubkey, "Skipping malformed program account: {}", e);
                    None
                }
            }
        })
        .collect()
}
