//! DDL Protocol -- federation records, message types, JSON wire codec.
//!
//! HTTP between nodes. One POST per message to the federation path,
//! body is the JSON encoding from [`codec`], transport metadata travels
//! in the headers described by [`header`].

pub mod challenge;
pub mod codec;
pub mod header;
pub mod messages;
pub mod model;

pub use codec::{canonical_payload, decode, encode, from_slice, MAX_MESSAGE_SIZE};
pub use header::NetworkMessageHeader;
pub use messages::*;
pub use model::{network_data_index, DataIndex, MappingError, Network, Node, User, UserMapping};

/// Node identifier (opaque string).
pub type NodeId = String;

/// Network identifier (opaque string).
pub type NetworkId = String;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing field: {0}")]
    MissingField(String),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("unknown {field}: {value}")]
    UnknownDiscriminator { field: &'static str, value: String },
    #[error("relay envelope may not contain another relay envelope")]
    EnvelopeTooDeep,
    #[error("relay message is not alive (ttl {ttl})")]
    RelayNotAlive { ttl: i64 },
    #[error("approved auth response carries no node")]
    ApprovedWithoutNode,
    #[error("approved auth response carries no network")]
    ApprovedWithoutNetwork,
    #[error("node id mismatch: declared {declared}, found {found}")]
    NodeIdMismatch { declared: String, found: String },
    #[error("network id mismatch: declared {declared}, found {found}")]
    NetworkIdMismatch { declared: String, found: String },
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
