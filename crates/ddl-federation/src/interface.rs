//! Per-network send, relay, broadcast and receive.
//!
//! Outbound flow for one message:
//!
//! ```text
//!   check_connectivity(node)
//!     reachable   -> POST, time it, score it, verify the reply
//!     unreachable -> wrap in a relay envelope, try relay nodes one by one
//!                    (router picks first, then approved nodes by score)
//!     no relay    -> MessageUndeliverable
//! ```
//!
//! Broadcasts fan out concurrently. Recipients nobody could reach are kept
//! as a `p-` pending relay record for polling and retry.

use ddl_governor::{Path, ReachabilityGraph, Router, Scorer, UNREACHABLE_SCORE};
use ddl_protocol::codec;
use ddl_protocol::{
    canonical_payload, network_data_index, AuthMessage, DataIndex, DataMessageType, MessageMeta, MessageType, NetworkMessage,
    NetworkMessageHeader, Node, ProtocolError, RelayMessage, RelayTarget, SyncItem, SyncMessage, SyncTarget,
};
use ddl_storage::{Handshake, PendingRelay, Storage};
use futures::future::join_all;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DdlConfig;
use crate::handlers::{GraphSource, Handlers};
use crate::oidc::OidcRegistry;
use crate::sealing;
use crate::transport::Transport;
use crate::validator::{AccessValidator, Checks};
use crate::{FederationError, Result, DEFAULT_FEDERATION_PATH, HEALTH_PATH};

/// A message and the header it travelled with.
pub type Exchange = (NetworkMessage, NetworkMessageHeader);

const PENDING_PREFIX: &str = "p-";

#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Overrides the service-account token.
    pub access_token: Option<String>,
    pub should_raise: bool,
    /// Fall back to relaying when the target is unreachable.
    pub should_relay: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            access_token: None,
            should_raise: false,
            should_relay: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    pub access_token: Option<String>,
    pub should_raise: bool,
    /// Do not attempt a relay for unreachable nodes; only record them.
    pub skip_unreachable: bool,
    /// Give each recipient its own message ID.
    pub change_id: bool,
}

/// State shared by every network this instance belongs to.
pub struct Federation {
    config: DdlConfig,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    oidc: OidcRegistry,
    handlers: Handlers,
    graph: Option<Arc<dyn GraphSource>>,
    scorer: Scorer,
    router: Router,
    federation_path: String,
    cancel: CancellationToken,
}

impl Federation {
    pub fn new(config: DdlConfig, storage: Arc<dyn Storage>, transport: Arc<dyn Transport>) -> Self {
        let scorer = Scorer::new(config.score_params());
        let router = Router::new(config.default_ttl);
        Self {
            config,
            storage,
            transport,
            oidc: OidcRegistry::new(),
            handlers: Handlers::default(),
            graph: None,
            scorer,
            router,
            federation_path: DEFAULT_FEDERATION_PATH.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_oidc(mut self, oidc: OidcRegistry) -> Self {
        self.oidc = oidc;
        self
    }

    pub fn with_handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_graph_source(mut self, graph: Arc<dyn GraphSource>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_federation_path(mut self, path: impl Into<String>) -> Self {
        self.federation_path = path.into();
        self
    }

    pub fn config(&self) -> &DdlConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn oidc(&self) -> &OidcRegistry {
        &self.oidc
    }

    pub fn federation_path(&self) -> &str {
        &self.federation_path
    }

    /// View of one network. The instance's own node ID in that network is
    /// taken from the stored network record.
    pub fn interface(self: &Arc<Self>, network_id: &str) -> Result<NetworkInterface> {
        let network = self.storage.load_network(network_id)?;
        Ok(NetworkInterface {
            shared: Arc::clone(self),
            network_id: network.network_id,
            instance_id: network.instance_id,
            cancel: self.cancel.child_token(),
        })
    }

    /// One interface per stored network.
    pub fn interfaces(self: &Arc<Self>) -> Result<Vec<NetworkInterface>> {
        self.storage
            .list_networks()?
            .iter()
            .map(|n| self.interface(&n.network_id))
            .collect()
    }

    /// Abort every in-flight call on every interface.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub struct NetworkInterface {
    shared: Arc<Federation>,
    network_id: String,
    instance_id: String,
    cancel: CancellationToken,
}

impl std::fmt::Debug for NetworkInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkInterface")
            .field("network_id", &self.network_id)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl NetworkInterface {
    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// This instance's node ID in the network.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn federation(&self) -> &Arc<Federation> {
        &self.shared
    }

    pub fn config(&self) -> &DdlConfig {
        &self.shared.config
    }

    pub fn storage(&self) -> &dyn Storage {
        self.shared.storage.as_ref()
    }

    pub fn validator(&self) -> AccessValidator<'_> {
        AccessValidator::new(&self.shared.config, self.storage(), &self.shared.oidc)
    }

    /// Abort in-flight calls made through this interface.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fresh identity attributes for a message sent by this instance.
    pub fn new_meta(&self) -> MessageMeta {
        MessageMeta::new(self.network_id.clone(), self.instance_id.clone())
    }

    async fn race<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FederationError::Cancelled),
            out = fut => Ok(out),
        }
    }

    // ========================================================================
    // Connectivity and headers
    // ========================================================================

    /// Whether `base_url` answers the health endpoint from here. Our own URL
    /// and loopback addresses never count as reachable.
    pub async fn check_connectivity(&self, base_url: &str) -> bool {
        let base = base_url.trim_end_matches('/');
        if base == self.config().base_url() {
            tracing::info!(url = base, "fed: connectivity check on own url");
            return false;
        }
        if is_loopback(base) {
            tracing::info!(url = base, "fed: connectivity check on loopback url");
            return false;
        }

        let url = format!("{base}{HEALTH_PATH}");
        match self.race(self.shared.transport.get_json(&url)).await {
            Ok(Ok(body)) => body.get("status").and_then(Value::as_str) == Some("OK"),
            Ok(Err(e)) => {
                tracing::debug!(url, error = %e, "fed: connectivity check failed");
                false
            }
            Err(_) => false,
        }
    }

    /// Header signed with this network's key, without a token.
    pub fn sign_header(&self, message: &NetworkMessage) -> Result<NetworkMessageHeader> {
        let pem = self
            .storage()
            .load_network_key(&self.network_id)?
            .ok_or_else(|| FederationError::MissingNetworkKey(self.network_id.clone()))?;
        let signature = ddl_crypto::sign(&pem, &canonical_payload(message)?)?;
        let mut header = NetworkMessageHeader::new(message.node_id(), message.network_id());
        header.server_signature = Some(signature);
        Ok(header)
    }

    /// Signed header plus an access token: `access_token` if given, else the
    /// default IdP's service-account token.
    pub async fn generate_headers(
        &self,
        message: &NetworkMessage,
        access_token: Option<String>,
    ) -> Result<NetworkMessageHeader> {
        let mut header = self.sign_header(message)?;
        header.access_token = match access_token {
            Some(token) => Some(token),
            None => match self.shared.oidc.default_driver() {
                Some(driver) => {
                    header.idp_iss = Some(driver.issuer().to_string());
                    Some(self.race(driver.service_token()).await??)
                }
                None => None,
            },
        };
        Ok(header)
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Send to one node, relaying through others when it cannot be reached.
    /// `Ok(None)` means the node accepted the message without replying, or
    /// the reply was dropped.
    pub async fn send_message(
        &self,
        node: &Node,
        message: &NetworkMessage,
        opts: &SendOptions,
    ) -> Result<Option<Exchange>> {
        tracing::debug!(node_id = %node.node_id, url = %node.url, message_id = message.message_id(), "fed: sending message");

        // The answer may arrive later as its own message.
        if let NetworkMessage::Auth(AuthMessage::Request(_) | AuthMessage::Invite(_)) = message {
            let handshake = Handshake::new(message.message_id(), &self.network_id, node);
            self.storage().store_handshake(&handshake)?;
        }

        if self.check_connectivity(&node.url).await {
            return self.deliver(node, message, None, opts).await;
        }
        if self.is_cancelled() {
            return Err(FederationError::Cancelled);
        }
        let relayable =
            opts.should_relay && message.should_relay() && message.message_type() != MessageType::Relay;
        if !relayable {
            return Err(FederationError::MessageUndeliverable {
                node_id: node.node_id.clone(),
            });
        }

        tracing::info!(node_id = %node.node_id, message_id = message.message_id(), "fed: node unreachable, relaying");
        let header = self.generate_headers(message, opts.access_token.clone()).await?;
        let envelope = RelayMessage::wrap(
            self.new_meta(),
            vec![node.node_id.clone()],
            header,
            message.clone(),
            self.config().default_ttl,
        )?;

        match self.relay_message(&envelope, opts, &[node.node_id.clone()]).await? {
            Some((NetworkMessage::Relay(reply), _)) => {
                let Some(target) = reply.into_targets().into_iter().next() else {
                    return Ok(None);
                };
                let (_, header, inner) = target.into_parts();
                if let Err(e) = self.validator().verify_origin(&inner, &header, Checks::relayed()) {
                    tracing::warn!(node_id = %node.node_id, error = %e, "fed: relayed reply failed validation");
                    return if opts.should_raise { Err(e) } else { Ok(None) };
                }
                Ok(Some((inner, header)))
            }
            Some((other, _)) => Err(FederationError::UnexpectedReply(format!(
                "{} in answer to relay",
                other.message_type()
            ))),
            None => Err(FederationError::MessageUndeliverable {
                node_id: node.node_id.clone(),
            }),
        }
    }

    /// Pass a message on with the header it arrived with.
    pub async fn forward_message(
        &self,
        node: &Node,
        message: &NetworkMessage,
        header: NetworkMessageHeader,
    ) -> Result<Option<Exchange>> {
        self.deliver(node, message, Some(header), &SendOptions::default()).await
    }

    /// One direct POST. Every completed exchange feeds the node's score;
    /// a cancelled one does not.
    async fn deliver(
        &self,
        node: &Node,
        message: &NetworkMessage,
        header: Option<NetworkMessageHeader>,
        opts: &SendOptions,
    ) -> Result<Option<Exchange>> {
        let header = match header {
            Some(h) => h,
            None => self.generate_headers(message, opts.access_token.clone()).await?,
        };
        let body = codec::to_vec(message)?;
        let url = format!("{}{}", node.url.trim_end_matches('/'), self.shared.federation_path);

        let started = Instant::now();
        let result = self.race(self.shared.transport.post(&url, &header, body)).await?;
        let elapsed = started.elapsed().as_secs_f64();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(node_id = %node.node_id, url, error = %e, "fed: post failed");
                self.record_sample(&node.node_id, UNREACHABLE_SCORE);
                return Err(e.into());
            }
        };
        tracing::debug!(node_id = %node.node_id, status = response.status, elapsed_ms = (elapsed * 1000.0) as u64, "fed: got response");

        let reply = match (&response.body, response.is_success()) {
            (Some(body), true) => match codec::decode(body) {
                Ok(reply) => Some(reply),
                Err(e) => {
                    tracing::warn!(node_id = %node.node_id, error = %e, "fed: undecodable reply");
                    if opts.should_raise {
                        self.record_sample(&node.node_id, self.shared.scorer.latency_score(elapsed));
                        return Err(e.into());
                    }
                    None
                }
            },
            _ => None,
        };

        let sample = self.sample(node, elapsed, message, reply.as_ref());
        self.record_sample(&node.node_id, sample);

        if !response.is_success() {
            tracing::debug!(node_id = %node.node_id, status = response.status, "fed: request refused");
            if opts.should_raise {
                return Err(crate::TransportError::Status(response.status).into());
            }
            return Ok(None);
        }
        let Some(reply) = reply else {
            return Ok(None);
        };

        if let Err(e) = self.validator().verify_origin(&reply, &response.header, Checks {
            access_token: false,
            ..Checks::all()
        }) {
            tracing::warn!(node_id = %node.node_id, error = %e, "fed: reply failed validation");
            return if opts.should_raise { Err(e) } else { Ok(None) };
        }
        Ok(Some((reply, response.header)))
    }

    /// Score sample for one exchange. Record counts only apply to data
    /// queries answered by a data response.
    fn sample(&self, node: &Node, elapsed: f64, sent: &NetworkMessage, reply: Option<&NetworkMessage>) -> f64 {
        let record_count = match (sent, reply) {
            (NetworkMessage::Data(q), Some(NetworkMessage::Data(r))) if q.data_type == DataMessageType::Query => {
                r.record_count()
            }
            _ => None,
        };
        let scorer = &self.shared.scorer;
        match scorer.score(elapsed, record_count, Some(node.data_index.record_count)) {
            Ok(score) => score,
            Err(e) => {
                tracing::warn!(node_id = %node.node_id, error = %e, "score: falling back to latency only");
                scorer.latency_score(elapsed)
            }
        }
    }

    fn record_sample(&self, node_id: &str, sample: f64) {
        match self.update_score(node_id, sample) {
            Ok(_) => {}
            Err(FederationError::Storage(e)) if e.is_not_found() => {}
            Err(e) => tracing::warn!(node_id, error = %e, "score: update failed"),
        }
    }

    /// Fold a sample into the node's stored score. Concurrent exchanges
    /// with one node each land their sample.
    pub fn update_score(&self, node_id: &str, sample: f64) -> Result<f64> {
        let scorer = &self.shared.scorer;
        let node = self
            .storage()
            .modify_node(&self.network_id, node_id, &mut |n| n.score = scorer.ema(n.score, sample))?;
        tracing::debug!(node_id, sample, score = node.score, "score: updated");
        Ok(node.score)
    }

    /// Try relay nodes one at a time until one reports delivery.
    pub async fn relay_message(
        &self,
        envelope: &RelayMessage,
        opts: &SendOptions,
        skipping: &[String],
    ) -> Result<Option<Exchange>> {
        tracing::debug!(network_id = %self.network_id, message_id = %envelope.meta.message_id, ttl = envelope.ttl(), "relay: relaying message");

        let candidates = self.relay_candidates(&envelope.recipient_ids(), skipping)?;
        let message = NetworkMessage::Relay(envelope.clone());
        let opts = SendOptions {
            should_relay: false,
            ..opts.clone()
        };

        for node in candidates {
            if !self.check_connectivity(&node.url).await {
                if self.is_cancelled() {
                    return Err(FederationError::Cancelled);
                }
                continue;
            }
            match self.deliver(&node, &message, None, &opts).await {
                Ok(Some(exchange)) if exchange.1.delivered => {
                    tracing::debug!(message_id = %envelope.meta.message_id, via = %node.node_id, "relay: route succeeded");
                    return Ok(Some(exchange));
                }
                Ok(_) => {}
                Err(FederationError::Cancelled) => return Err(FederationError::Cancelled),
                Err(e) if opts.should_raise => return Err(e),
                Err(e) => tracing::debug!(via = %node.node_id, error = %e, "relay: hop failed"),
            }
        }
        Ok(None)
    }

    /// Approved nodes that may carry a relay: router picks first, then the
    /// rest by score.
    fn relay_candidates(&self, recipients: &[String], skipping: &[String]) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self
            .storage()
            .approved_nodes(&self.network_id)?
            .into_iter()
            .filter(|n| n.node_id != self.instance_id && !skipping.contains(&n.node_id) && !recipients.contains(&n.node_id))
            .collect();
        nodes.sort_by(|a, b| b.score.total_cmp(&a.score));

        let Some(graph) = self.graph_snapshot() else {
            return Ok(nodes);
        };
        let mut ordered = Vec::with_capacity(nodes.len());
        for id in self.shared.router.find_relay_nodes(&graph, recipients) {
            if let Some(pos) = nodes.iter().position(|n| n.node_id == id) {
                ordered.push(nodes.remove(pos));
            }
        }
        ordered.extend(nodes);
        Ok(ordered)
    }

    fn graph_snapshot(&self) -> Option<ReachabilityGraph> {
        self.shared
            .graph
            .as_ref()
            .and_then(|g| g.snapshot(&self.network_id, &self.instance_id))
    }

    /// Best relay paths from this instance to `target` in the current
    /// reachability snapshot.
    pub fn find_path_to_node(&self, target: &str) -> Vec<Path> {
        match self.graph_snapshot() {
            Some(graph) => self.shared.router.find_path_to_node(&graph, target),
            None => Vec::new(),
        }
    }

    /// Send to every approved node. Failures are isolated per recipient.
    pub async fn broadcast_message(
        &self,
        message: &NetworkMessage,
        opts: &BroadcastOptions,
        skipping: &[String],
    ) -> Result<Vec<Exchange>> {
        tracing::debug!(network_id = %self.network_id, message_id = message.message_id(), "fed: broadcasting message");

        let nodes: Vec<Node> = self
            .storage()
            .approved_nodes(&self.network_id)?
            .into_iter()
            .filter(|n| n.node_id != self.instance_id && !skipping.contains(&n.node_id))
            .collect();
        let answers = join_all(nodes.iter().map(|n| self.check_connectivity(&n.url))).await;
        let (reachable, unreachable): (Vec<_>, Vec<_>) = nodes.into_iter().zip(answers).partition(|(_, up)| *up);
        let reachable: Vec<Node> = reachable.into_iter().map(|(n, _)| n).collect();
        let unreachable: Vec<String> = unreachable.into_iter().map(|(n, _)| n.node_id).collect();
        tracing::debug!(reachable = reachable.len(), unreachable = unreachable.len(), "fed: broadcast targets");

        let send_opts = &SendOptions {
            access_token: opts.access_token.clone(),
            should_raise: opts.should_raise,
            should_relay: true,
        };
        let direct = reachable.iter().map(|node| {
            let mut outgoing = message.clone();
            if opts.change_id {
                outgoing.set_message_id(uuid::Uuid::new_v4().to_string());
            }
            async move { (node.node_id.clone(), self.send_message(node, &outgoing, send_opts).await) }
        });

        // A relay being broadcast is already an envelope: the direct sends
        // are the relay attempts, and parking what they miss is left to the
        // envelope's origin.
        let envelope = match message {
            _ if unreachable.is_empty() => None,
            NetworkMessage::Relay(_) => None,
            other => {
                let header = self.generate_headers(other, opts.access_token.clone()).await?;
                Some(RelayMessage::wrap(
                    self.new_meta(),
                    unreachable.clone(),
                    header,
                    other.clone(),
                    self.config().default_ttl,
                )?)
            }
        };
        let relay_skipping: Vec<String> = unreachable.iter().chain(skipping).cloned().collect();
        let relay_attempt = async {
            match &envelope {
                Some(env) if !opts.skip_unreachable => {
                    let relay_opts = SendOptions {
                        should_relay: false,
                        ..send_opts.clone()
                    };
                    Some(self.relay_message(env, &relay_opts, &relay_skipping).await)
                }
                _ => None,
            }
        };

        let (direct_results, relay_result) = tokio::join!(join_all(direct), relay_attempt);

        let mut responses = Vec::new();
        let mut first_error = None;
        for (node_id, result) in direct_results {
            match result {
                Ok(Some(exchange)) => responses.push(exchange),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(node_id, error = %e, "fed: broadcast target failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match relay_result {
            Some(Ok(Some(exchange))) => responses.push(exchange),
            Some(Ok(None)) | None => {}
            Some(Err(e)) => {
                tracing::warn!(error = %e, "fed: broadcast relay failed");
                first_error.get_or_insert(e);
            }
        }

        if self.is_cancelled() {
            return Err(FederationError::Cancelled);
        }
        if let Some(env) = envelope {
            let confirmed: Vec<&String> = responses.iter().flat_map(|(_, h)| h.delivered_to.iter()).collect();
            let missed: Vec<String> = unreachable.into_iter().filter(|id| !confirmed.contains(&id)).collect();
            if !missed.is_empty() {
                self.store_pending(env.only_for(&missed)?)?;
            }
        }
        match first_error {
            Some(e) if opts.should_raise => Err(e),
            _ => Ok(responses),
        }
    }

    fn store_pending(&self, mut envelope: RelayMessage) -> Result<()> {
        if !envelope.meta.message_id.starts_with(PENDING_PREFIX) {
            envelope.meta.message_id = format!("{PENDING_PREFIX}{}", envelope.meta.message_id);
        }
        let record = PendingRelay::new(
            envelope.meta.message_id.clone(),
            self.network_id.clone(),
            envelope.recipient_ids(),
            codec::encode(&NetworkMessage::Relay(envelope)),
        );
        self.storage().store_pending(&record)?;
        tracing::info!(message_id = %record.message_id, recipients = ?record.recipient_ids, "fed: pending relay stored");
        Ok(())
    }

    /// Re-attempt stored relays to recipients that have become reachable.
    /// Records are deleted once every recipient got its message.
    pub async fn retry_pending(&self) -> Result<usize> {
        let mut delivered = 0;
        for mut record in self.storage().list_pending(&self.network_id)? {
            let envelope = match codec::decode(&record.body) {
                Ok(NetworkMessage::Relay(envelope)) => envelope,
                Ok(_) | Err(_) => {
                    tracing::warn!(message_id = %record.message_id, "relay: unreadable pending record dropped");
                    self.storage().delete_pending(&record.message_id)?;
                    continue;
                }
            };

            let mut remaining = Vec::new();
            for recipient in &record.recipient_ids {
                if self.deliver_pending(&envelope, recipient).await? {
                    delivered += 1;
                } else {
                    remaining.push(recipient.clone());
                }
            }

            if remaining.is_empty() {
                self.storage().delete_pending(&record.message_id)?;
                tracing::info!(message_id = %record.message_id, "relay: pending relay delivered");
            } else if remaining.len() < record.recipient_ids.len() {
                record.recipient_ids = remaining;
                self.storage().store_pending(&record)?;
            }
        }
        Ok(delivered)
    }

    /// Hand `recipient` its share of a stored envelope in a fresh relay
    /// addressed only to it.
    async fn deliver_pending(&self, envelope: &RelayMessage, recipient: &str) -> Result<bool> {
        let node = match self.storage().load_node(&self.network_id, recipient) {
            Ok(node) => node,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !self.check_connectivity(&node.url).await {
            return if self.is_cancelled() { Err(FederationError::Cancelled) } else { Ok(false) };
        }

        let targets = envelope
            .relay_targets()
            .iter()
            .filter(|t| t.is_for(recipient))
            .map(|t| RelayTarget::new(vec![recipient.to_string()], t.header().clone(), t.message().clone()))
            .collect::<std::result::Result<Vec<_>, ProtocolError>>()?;
        let fresh = RelayMessage::new(self.new_meta().with_id(envelope.meta.message_id.clone()), targets, 1)?;
        let opts = SendOptions {
            should_relay: false,
            ..SendOptions::default()
        };
        match self.deliver(&node, &NetworkMessage::Relay(fresh), None, &opts).await {
            Ok(Some((_, header))) => Ok(header.delivered),
            Ok(None) => Ok(false),
            Err(FederationError::Cancelled) => Err(FederationError::Cancelled),
            Err(e) => {
                tracing::debug!(node_id = recipient, error = %e, "relay: pending delivery failed");
                Ok(false)
            }
        }
    }

    /// Ask `node` for relays it holds for us and process the ones addressed
    /// to this instance.
    pub async fn poll_pending(&self, node: &Node) -> Result<usize> {
        let poll: NetworkMessage = SyncMessage::new(self.new_meta(), SyncTarget::Poll, None).into();
        let opts = SendOptions {
            should_relay: false,
            ..SendOptions::default()
        };
        let Some((reply, _)) = self.send_message(node, &poll, &opts).await? else {
            return Ok(0);
        };
        let NetworkMessage::Sync(sync) = reply else {
            return Err(FederationError::UnexpectedReply(format!(
                "{} in answer to poll",
                reply.message_type()
            )));
        };

        let mut processed = 0;
        for item in sync.data.into_iter().flatten() {
            let SyncItem::Raw(map) = item else { continue };
            let envelope = match codec::decode(&Value::Object(map)) {
                Ok(NetworkMessage::Relay(envelope)) => envelope,
                Ok(other) => {
                    tracing::warn!(message_type = %other.message_type(), "relay: poll returned a non-relay item");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "relay: poll returned an undecodable item");
                    continue;
                }
            };
            for target in envelope.into_targets() {
                if !target.is_for(&self.instance_id) {
                    continue;
                }
                let (_, header, inner) = target.into_parts();
                match self.receive_relayed(inner, header, true).await {
                    Ok(_) => processed += 1,
                    Err(e) => tracing::warn!(error = %e, "relay: polled message rejected"),
                }
            }
        }
        tracing::debug!(node_id = %node.node_id, processed, "relay: poll complete");
        Ok(processed)
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Validate and dispatch a message that arrived directly. Validation
    /// errors are always returned; handler errors only when `should_raise`.
    pub async fn receive_message(
        &self,
        message: NetworkMessage,
        header: NetworkMessageHeader,
        should_raise: bool,
    ) -> Result<Option<Exchange>> {
        self.receive_with(message, header, Checks::all(), should_raise).await
    }

    /// As [`NetworkInterface::receive_message`] for messages unpacked from a
    /// relay envelope or pending store, which may be older than the replay
    /// window.
    pub async fn receive_relayed(
        &self,
        message: NetworkMessage,
        header: NetworkMessageHeader,
        should_raise: bool,
    ) -> Result<Option<Exchange>> {
        self.receive_with(message, header, Checks::relayed(), should_raise).await
    }

    async fn receive_with(
        &self,
        message: NetworkMessage,
        mut header: NetworkMessageHeader,
        checks: Checks,
        should_raise: bool,
    ) -> Result<Option<Exchange>> {
        tracing::info!(message_id = message.message_id(), message_type = %message.message_type(), "fed: received message");

        if message.network_id() != self.network_id {
            return Err(ProtocolError::NetworkIdMismatch {
                declared: self.network_id.clone(),
                found: message.network_id().to_string(),
            }
            .into());
        }
        let user_id = self.validator().validate_message(&message, &header, checks).await?;
        header.user_id = Some(user_id);

        let message_id = message.message_id().to_string();
        let reply = match self.race(self.dispatch(message, &header)).await.and_then(|r| r) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(message_id, error = %e, "fed: dispatch failed");
                return if should_raise { Err(e) } else { Ok(None) };
            }
        };
        let Some((reply, delivered_to)) = reply else {
            return Ok(None);
        };

        let mut reply_header = self.sign_header(&reply)?;
        reply_header.delivered = reply.message_type() == MessageType::Relay;
        reply_header.delivered_to = delivered_to;
        tracing::info!(message_id, reply_type = %reply.message_type(), "fed: responding");
        Ok(Some((reply, reply_header)))
    }

    /// The handler's reply and, for relays, who the envelope reached.
    async fn dispatch(
        &self,
        message: NetworkMessage,
        header: &NetworkMessageHeader,
    ) -> Result<Option<(NetworkMessage, Vec<String>)>> {
        let handlers = &self.shared.handlers;
        let reply = match message {
            NetworkMessage::Auth(m) => handlers.auth.handle_auth(self, m, header).await?,
            NetworkMessage::Sync(m) => handlers.sync.handle_sync(self, m, header).await?,
            NetworkMessage::Data(m) => match handlers.data.handle_data(self, m, header).await? {
                Some(NetworkMessage::Data(reply)) => {
                    let requester = header.user_id.as_deref().unwrap_or(reply.user_id.as_str()).to_string();
                    Some(sealing::seal_response(self.storage(), &requester, reply)?.into())
                }
                other => other,
            },
            NetworkMessage::Relay(m) => {
                let receipt = handlers.relay.handle_relay(self, m, header).await?;
                return Ok(receipt.map(|r| (r.reply.into(), r.delivered_to)));
            }
        };
        Ok(reply.map(|reply| (reply, Vec::new())))
    }

    /// The instance's own index plus every approved member's.
    pub fn network_data_index(&self) -> Result<DataIndex> {
        let own = self.shared.handlers.data.local_index(&self.network_id);
        let nodes = self.storage().list_nodes(&self.network_id)?;
        Ok(network_data_index(&own, &nodes))
    }
}

fn is_loopback(url: &str) -> bool {
    url.contains("localhost") || url.contains("127.0.0.1") || url.contains("[::1]")
}
