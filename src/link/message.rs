//! Wire messages exchanged with the link worker
//!
//! Every message is `{ id, type, payload }`. Call responses echo the id of
//! the call; events and the handshake use the reserved [`EVENT_ID`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LinkError;

/// Reserved id of unsolicited messages
pub const EVENT_ID: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "m_handshake")]
    Handshake,
    #[serde(rename = "m_get_info")]
    GetInfo,
    #[serde(rename = "m_get_account_info")]
    GetAccountInfo,
    #[serde(rename = "m_get_transactions")]
    GetTransactions,
    #[serde(rename = "m_get_fee")]
    GetFee,
    #[serde(rename = "m_subscribe")]
    Subscribe,
    #[serde(rename = "m_unsubscribe")]
    Unsubscribe,
    #[serde(rename = "m_push_tx")]
    PushTransaction,
    #[serde(rename = "m_disconnect")]
    Disconnect,

    #[serde(rename = "r_connected")]
    Connected,
    #[serde(rename = "r_disconnected")]
    Disconnected,
    #[serde(rename = "r_error")]
    Error,
    #[serde(rename = "r_info")]
    Info,
    #[serde(rename = "r_account_info")]
    AccountInfo,
    #[serde(rename = "r_transactions")]
    Transactions,
    #[serde(rename = "r_get_fee")]
    Fee,
    #[serde(rename = "r_subscribe")]
    Subscribed,
    #[serde(rename = "r_unsubscribe")]
    Unsubscribed,
    #[serde(rename = "r_push_tx")]
    PushedTransaction,
    #[serde(rename = "r_notification")]
    Notification,
}

impl MessageType {
    /// Response type a worker answers a request with
    pub fn response(self) -> Option<MessageType> {
        let response = match self {
            Self::GetInfo => Self::Info,
            Self::GetAccountInfo => Self::AccountInfo,
            Self::GetTransactions => Self::Transactions,
            Self::GetFee => Self::Fee,
            Self::Subscribe => Self::Subscribed,
            Self::Unsubscribe => Self::Unsubscribed,
            Self::PushTransaction => Self::PushedTransaction,
            Self::Disconnect => Self::Disconnected,
            _ => return None,
        };
        Some(response)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkMessage {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl LinkMessage {
    pub fn new(id: i64, kind: MessageType, payload: Value) -> Self {
        Self { id, kind, payload }
    }

    pub fn event(kind: MessageType, payload: Value) -> Self {
        Self::new(EVENT_ID, kind, payload)
    }

    /// Error response to the call `id`
    pub fn error(id: i64, message: impl Into<String>) -> Self {
        let payload = serde_json::json!({ "message": message.into() });
        Self::new(id, MessageType::Error, payload)
    }

    pub fn is_event(&self) -> bool {
        self.id == EVENT_ID
    }

    pub fn to_json(&self) -> Result<String, LinkError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, LinkError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let msg = LinkMessage::new(7, MessageType::GetAccountInfo, json!({ "address": "0xabc" }));
        let raw: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            raw,
            json!({ "id": 7, "type": "m_get_account_info", "payload": { "address": "0xabc" } })
        );
    }

    #[test]
    fn test_event_without_payload() {
        let msg = LinkMessage::from_json(r#"{"id":-1,"type":"r_disconnected"}"#).unwrap();
        assert!(msg.is_event());
        assert_eq!(msg.kind, MessageType::Disconnected);
        assert_eq!(msg.payload, Value::Null);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(LinkMessage::from_json(r#"{"id":1,"type":"r_bogus"}"#).is_err());
    }
}
