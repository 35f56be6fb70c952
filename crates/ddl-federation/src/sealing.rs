//! Data responses sealed for the user they answer.
//!
//! A responder seals every item of a data response with the requesting
//! user's public key when it holds one for that user; otherwise items go
//! out in the clear. The querying side opens them with the user's private
//! key.

use ddl_crypto::{open_items, parse_public_key, seal_items, NetworkKeyPair, SealedItem};
use ddl_protocol::{DataMessage, DataMessageType};
use ddl_storage::Storage;
use serde_json::Value;

use crate::Result;

/// Seal `response` for `user_id` if the store has a public key for them.
pub fn seal_response(storage: &dyn Storage, user_id: &str, mut response: DataMessage) -> Result<DataMessage> {
    if response.data_type != DataMessageType::Response || is_sealed(&response) {
        return Ok(response);
    }
    let Value::Array(items) = &response.data else {
        return Ok(response);
    };
    let pem = match storage.load_user(user_id) {
        Ok(user) => user.public_key,
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };
    let Some(pem) = pem else {
        return Ok(response);
    };
    let sealed = seal_items(&parse_public_key(&pem)?, items)?;
    tracing::debug!(user_id, items = sealed.len(), "fed: sealed data response");
    response.data = Value::Array(sealed);
    Ok(response)
}

/// Open a sealed response with the user's key pair. Responses that were
/// never sealed come back unchanged.
pub fn open_response(mut response: DataMessage, user_key: &NetworkKeyPair) -> Result<DataMessage> {
    if response.data_type != DataMessageType::Response || !is_sealed(&response) {
        return Ok(response);
    }
    if let Value::Array(items) = &response.data {
        response.data = Value::Array(open_items(user_key.private_key(), items)?);
    }
    Ok(response)
}

/// A response counts as sealed when it has items and every one is sealed.
pub fn is_sealed(response: &DataMessage) -> bool {
    match &response.data {
        Value::Array(items) => !items.is_empty() && items.iter().all(SealedItem::is_sealed),
        _ => false,
    }
}
