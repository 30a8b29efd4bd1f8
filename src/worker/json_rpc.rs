use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Backend, BackendError};
use crate::coin::Coin;
use crate::link::types::{AccountInfo, FeeEstimate, ServerInfo, TransactionSummary};

/// Ethereum JSON-RPC node over HTTP
pub struct JsonRpcBackend {
    client: reqwest::Client,
    url: String,
    coin: Coin,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    number: String,
    hash: String,
}

impl JsonRpcBackend {
    pub fn new(url: &str, coin: Coin) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            coin,
            next_id: AtomicU64::new(1),
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, BackendError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Unreachable(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let reply: RpcResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        if let Some(error) = reply.error {
            return Err(BackendError::Rejected(format!(
                "{} ({})",
                error.message, error.code
            )));
        }

        let result = reply
            .result
            .ok_or_else(|| BackendError::InvalidResponse(format!("{} returned no result", method)))?;
        serde_json::from_value(result).map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }

    async fn quantity(&self, method: &str, params: Value) -> Result<u128, BackendError> {
        let raw: String = self.request(method, params).await?;
        parse_quantity(&raw)
    }
}

#[async_trait]
impl Backend for JsonRpcBackend {
    async fn info(&self) -> Result<ServerInfo, BackendError> {
        let network: String = self.request("net_version", json!([])).await?;
        let header: BlockHeader = self
            .request("eth_getBlockByNumber", json!(["latest", false]))
            .await?;

        Ok(ServerInfo {
            name: format!("{} (network {})", self.coin.shortcut(), network),
            shortcut: self.coin.shortcut().to_string(),
            block_height: parse_quantity(&header.number)? as u64,
            block_hash: header.hash,
        })
    }

    async fn account_info(&self, address: &str) -> Result<AccountInfo, BackendError> {
        let balance = self
            .quantity("eth_getBalance", json!([address, "latest"]))
            .await?;
        let transaction_count = self
            .quantity("eth_getTransactionCount", json!([address, "latest"]))
            .await?;
        let block_height = self.quantity("eth_blockNumber", json!([])).await?;

        Ok(AccountInfo {
            address: address.to_string(),
            balance: balance.to_string(),
            transaction_count: transaction_count as u64,
            block_height: block_height as u64,
        })
    }

    async fn transactions(&self, _address: &str) -> Result<Vec<TransactionSummary>, BackendError> {
        Err(BackendError::Unsupported("address history over plain JSON-RPC"))
    }

    async fn fee(&self) -> Result<FeeEstimate, BackendError> {
        let gas_price = self.quantity("eth_gasPrice", json!([])).await?;
        Ok(FeeEstimate {
            gas_price: gas_price.to_string(),
        })
    }

    async fn push_transaction(&self, hex: &str) -> Result<String, BackendError> {
        let raw = if hex.starts_with("0x") {
            hex.to_string()
        } else {
            format!("0x{}", hex)
        };
        self.request("eth_sendRawTransaction", json!([raw])).await
    }
}

/// Decode a hex `QUANTITY` ("0x1a")
pub fn parse_quantity(raw: &str) -> Result<u128, BackendError> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| BackendError::InvalidResponse(format!("'{}' is not a hex quantity", raw)))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| BackendError::InvalidResponse(format!("'{}': {}", raw, e)))
}
