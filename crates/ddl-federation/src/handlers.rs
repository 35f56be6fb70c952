//! Per-family message handlers and the optional reachability source.
//!
//! A handler receives a validated message together with its header, whose
//! `user_id` has been filled in by the validator, and returns the reply to
//! send back, if any.

use async_trait::async_trait;
use ddl_governor::ReachabilityGraph;
use ddl_protocol::{
    AuthMessage, DataIndex, DataMessage, NetworkMessage, NetworkMessageHeader, RelayMessage, SyncMessage,
};
use std::sync::Arc;

use crate::interface::NetworkInterface;
use crate::relay::{ForwardingRelay, PendingSync};
use crate::Result;

#[async_trait]
pub trait AuthHandler: Send + Sync {
    async fn handle_auth(
        &self,
        iface: &NetworkInterface,
        message: AuthMessage,
        header: &NetworkMessageHeader,
    ) -> Result<Option<NetworkMessage>>;
}

#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn handle_sync(
        &self,
        iface: &NetworkInterface,
        message: SyncMessage,
        header: &NetworkMessageHeader,
    ) -> Result<Option<NetworkMessage>>;
}

/// Outcome of handling an envelope that reached at least one recipient.
#[derive(Debug, Clone)]
pub struct RelayReceipt {
    pub reply: RelayMessage,
    /// Copied into the reply header as `X-Delivered-To`.
    pub delivered_to: Vec<String>,
}

/// A receipt is only produced once the envelope was delivered; the
/// interface marks the reply header `delivered`.
#[async_trait]
pub trait RelayHandler: Send + Sync {
    async fn handle_relay(
        &self,
        iface: &NetworkInterface,
        message: RelayMessage,
        header: &NetworkMessageHeader,
    ) -> Result<Option<RelayReceipt>>;
}

#[async_trait]
pub trait DataHandler: Send + Sync {
    async fn handle_data(
        &self,
        iface: &NetworkInterface,
        message: DataMessage,
        header: &NetworkMessageHeader,
    ) -> Result<Option<NetworkMessage>>;

    /// Summary of the data this instance holds for `network_id`.
    fn local_index(&self, _network_id: &str) -> DataIndex {
        DataIndex::default()
    }
}

/// Snapshot of who can reach whom, used to pick relay hops.
pub trait GraphSource: Send + Sync {
    fn snapshot(&self, network_id: &str, instance_id: &str) -> Option<ReachabilityGraph>;
}

/// Accepts every message and never replies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReply;

#[async_trait]
impl AuthHandler for NoReply {
    async fn handle_auth(
        &self,
        _iface: &NetworkInterface,
        _message: AuthMessage,
        _header: &NetworkMessageHeader,
    ) -> Result<Option<NetworkMessage>> {
        Ok(None)
    }
}

#[async_trait]
impl SyncHandler for NoReply {
    async fn handle_sync(
        &self,
        _iface: &NetworkInterface,
        _message: SyncMessage,
        _header: &NetworkMessageHeader,
    ) -> Result<Option<NetworkMessage>> {
        Ok(None)
    }
}

#[async_trait]
impl RelayHandler for NoReply {
    async fn handle_relay(
        &self,
        _iface: &NetworkInterface,
        _message: RelayMessage,
        _header: &NetworkMessageHeader,
    ) -> Result<Option<RelayReceipt>> {
        Ok(None)
    }
}

#[async_trait]
impl DataHandler for NoReply {
    async fn handle_data(
        &self,
        _iface: &NetworkInterface,
        _message: DataMessage,
        _header: &NetworkMessageHeader,
    ) -> Result<Option<NetworkMessage>> {
        Ok(None)
    }
}

/// The four dispatch targets, fixed when the federation is built. The
/// default forwards relays, answers polls from the pending store and ignores
/// everything else.
#[derive(Clone)]
pub struct Handlers {
    pub auth: Arc<dyn AuthHandler>,
    pub sync: Arc<dyn SyncHandler>,
    pub relay: Arc<dyn RelayHandler>,
    pub data: Arc<dyn DataHandler>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            auth: Arc::new(NoReply),
            sync: Arc::new(PendingSync::new(Arc::new(NoReply))),
            relay: Arc::new(ForwardingRelay),
            data: Arc::new(NoReply),
        }
    }
}
