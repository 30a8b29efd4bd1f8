/// Request handlers of the link worker
///
/// Each handler decodes its payload, asks the backend and returns the
/// response payload. `dispatch` wraps the outcome into the reply message.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use super::{Backend, BackendError};
use crate::link::message::{LinkMessage, MessageType};
use crate::link::types::{AddressRequest, PushTransactionRequest};

/// Serve one request and build the reply carrying the same id
pub async fn dispatch(backend: &dyn Backend, message: LinkMessage) -> LinkMessage {
    let LinkMessage { id, kind, payload } = message;

    let result = match kind {
        MessageType::GetInfo => get_info(backend).await,
        MessageType::GetAccountInfo => get_account_info(backend, payload).await,
        MessageType::GetTransactions => get_transactions(backend, payload).await,
        MessageType::GetFee => get_fee(backend).await,
        MessageType::PushTransaction => push_transaction(backend, payload).await,
        MessageType::Disconnect => disconnect(backend).await,
        other => Err(BackendError::InvalidRequest(format!("{:?} is not a request", other))),
    };

    match (result, kind.response()) {
        (Ok(payload), Some(response)) => LinkMessage::new(id, response, payload),
        (Ok(_), None) => LinkMessage::error(id, format!("No response type for {:?}", kind)),
        (Err(e), _) => {
            log::debug!("Request #{} {:?} failed: {}", id, kind, e);
            LinkMessage::error(id, e.to_string())
        }
    }
}

/// m_get_info
async fn get_info(backend: &dyn Backend) -> Result<Value, BackendError> {
    encode(backend.info().await?)
}

/// m_get_account_info { address }
async fn get_account_info(backend: &dyn Backend, payload: Value) -> Result<Value, BackendError> {
    let request: AddressRequest = decode(payload)?;
    encode(backend.account_info(&request.address).await?)
}

/// m_get_transactions { address }
async fn get_transactions(backend: &dyn Backend, payload: Value) -> Result<Value, BackendError> {
    let request: AddressRequest = decode(payload)?;
    encode(backend.transactions(&request.address).await?)
}

/// m_get_fee
async fn get_fee(backend: &dyn Backend) -> Result<Value, BackendError> {
    encode(backend.fee().await?)
}

/// m_push_tx { hex }
/// Returns the txid
async fn push_transaction(backend: &dyn Backend, payload: Value) -> Result<Value, BackendError> {
    let request: PushTransactionRequest = decode(payload)?;
    let txid = backend.push_transaction(&request.hex).await?;
    log::info!("Broadcast transaction {}", txid);
    Ok(Value::String(txid))
}

/// m_disconnect
async fn disconnect(backend: &dyn Backend) -> Result<Value, BackendError> {
    backend.disconnect().await?;
    Ok(json!({ "disconnected": true }))
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, BackendError> {
    serde_json::from_value(payload).map_err(|e| BackendError::InvalidRequest(e.to_string()))
}

fn encode<T: Serialize>(value: T) -> Result<Value, BackendError> {
    serde_json::to_value(value).map_err(|e| BackendError::InvalidResponse(e.to_string()))
}
