// Link payload types

use serde::{Deserialize, Serialize};

use crate::error::LinkError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub shortcut: String,
    pub block_height: u64,
    pub block_hash: String,
}

/// Authoritative state of one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub address: String,
    /// Balance in the smallest unit, decimal string
    pub balance: String,
    /// Number of sent transactions (the account nonce)
    pub transaction_count: u64,
    #[serde(default)]
    pub block_height: u64,
}

impl AccountInfo {
    pub fn balance_units(&self) -> Result<u128, LinkError> {
        self.balance.trim().parse::<u128>().map_err(|e| {
            LinkError::InvalidPayload(format!("balance '{}' of {}: {}", self.balance, self.address, e))
        })
    }

    /// No balance and no history: the end of the used address range
    pub fn is_empty(&self) -> Result<bool, LinkError> {
        Ok(self.transaction_count == 0 && self.balance_units()? == 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    pub txid: String,
    pub from: String,
    pub to: String,
    pub value: String,
    pub block_height: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeEstimate {
    pub gas_price: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SubscribeRequest {
    Block,
    Addresses { addresses: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockNotification {
    pub height: u64,
    pub hash: String,
}

/// Payload of `r_notification` events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Notification {
    Block(BlockNotification),
    Address(AccountInfo),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRequest {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTransactionRequest {
    pub hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Unsolicited messages re-dispatched to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected(ServerInfo),
    Disconnected,
    Error(String),
    Notification(Notification),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_account_emptiness() {
        let info = AccountInfo {
            address: "0x1".into(),
            balance: "0".into(),
            transaction_count: 0,
            block_height: 1,
        };
        assert!(info.is_empty().unwrap());

        let funded = AccountInfo {
            balance: "10".into(),
            ..info.clone()
        };
        assert!(!funded.is_empty().unwrap());

        let used = AccountInfo {
            transaction_count: 1,
            ..info.clone()
        };
        assert!(!used.is_empty().unwrap());

        let garbage = AccountInfo {
            balance: "ten".into(),
            ..info
        };
        assert!(garbage.is_empty().is_err());
    }

    #[test]
    fn test_notification_shape() {
        let value = serde_json::to_value(Notification::Block(BlockNotification {
            height: 12,
            hash: "0xff".into(),
        }))
        .unwrap();
        assert_eq!(
            value,
            json!({ "type": "block", "payload": { "height": 12, "hash": "0xff" } })
        );
    }
}
