//! DDL Federation -- inbound validation, dispatch, relay and broadcast.
//!
//! A [`Federation`] holds everything shared by the networks an instance
//! belongs to: options, store, transport, OIDC registry and the per-family
//! message handlers. [`Federation::interface`] gives the per-network view
//! ([`NetworkInterface`]) that sends, relays, broadcasts and receives.
//!
//! Data responses are sealed for the requesting user when the store holds
//! their public key ([`sealing`]).
//!
//! Outbound sends race a cancellation token. A cancelled call never counts
//! against the target's score; a transport failure does.

use ddl_crypto::CryptoError;
use ddl_protocol::{MappingError, ProtocolError};
use ddl_storage::StorageError;

pub mod config;
pub mod handlers;
pub mod interface;
pub mod oidc;
pub mod relay;
pub mod sealing;
pub mod transport;
pub mod validator;
pub mod vote;

pub use config::DdlConfig;
pub use handlers::{AuthHandler, DataHandler, GraphSource, Handlers, NoReply, RelayHandler, RelayReceipt, SyncHandler};
pub use interface::{BroadcastOptions, Exchange, Federation, NetworkInterface, SendOptions};
pub use oidc::{Introspection, OidcDriver, OidcError, OidcRegistry};
pub use relay::{ForwardingRelay, PendingSync};
pub use sealing::{open_response, seal_response};
pub use transport::{Transport, TransportError, TransportResponse};
pub use validator::{AccessValidator, Checks, ANONYMOUS_USER, TIMESTAMP_TOLERANCE_SECS};
pub use vote::vote_from_responses;

/// Path the federation endpoint is served on unless configured otherwise.
pub const DEFAULT_FEDERATION_PATH: &str = "/federation/";

/// Path of the health endpoint used by connectivity checks.
pub const HEALTH_PATH: &str = "/api";

/// Why a caller's credentials were refused.
#[derive(Debug, thiserror::Error)]
pub enum AuthFailure {
    #[error("token client does not match node client {expected}")]
    ClientMismatch { expected: String, found: Option<String> },
    #[error("service account required")]
    ServiceAccountRequired,
    #[error("service account not allowed for data messages")]
    ServiceAccountForbidden,
    #[error("node has authentication enabled but the token was not validated")]
    AuthenticationRequired,
    #[error("unknown node {0}")]
    UnknownNode(String),
    #[error("response {0} answers no request of ours")]
    Unsolicited(String),
    #[error("user mapping failed: {0}")]
    Mapping(#[from] MappingError),
}

#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("timestamp {timestamp} outside tolerance of {now}")]
    Replay { timestamp: i64, now: i64 },
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("authentication failed: {0}")]
    AuthStatus(#[from] AuthFailure),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("message undeliverable to {node_id}")]
    MessageUndeliverable { node_id: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("oidc error: {0}")]
    Oidc(#[from] OidcError),
    #[error("cancelled")]
    Cancelled,
    #[error("no network key for {0}")]
    MissingNetworkKey(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("handler error: {0}")]
    Handler(String),
}

/// Coarse classification used to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Decode,
    Crypto,
    Replay,
    AuthStatus,
    Transport,
    RelayInvariant,
    Storage,
    Cancelled,
    Internal,
}

impl FederationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FederationError::Protocol(ProtocolError::EnvelopeTooDeep)
            | FederationError::Protocol(ProtocolError::RelayNotAlive { .. }) => ErrorKind::RelayInvariant,
            FederationError::Protocol(_) | FederationError::UnexpectedReply(_) => ErrorKind::Decode,
            FederationError::Crypto(_) | FederationError::MissingHeader(_) => ErrorKind::Crypto,
            FederationError::Replay { .. } => ErrorKind::Replay,
            FederationError::AuthStatus(_) | FederationError::Oidc(_) => ErrorKind::AuthStatus,
            FederationError::Transport(_) | FederationError::MessageUndeliverable { .. } => ErrorKind::Transport,
            FederationError::Storage(_) => ErrorKind::Storage,
            FederationError::Cancelled => ErrorKind::Cancelled,
            FederationError::MissingNetworkKey(_) | FederationError::Handler(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, FederationError>;

#[cfg(test)]
pub(crate) mod testkit;
