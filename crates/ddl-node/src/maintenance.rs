//! Maintenance background task -- retry pending relays and refresh members.
//!
//! Two timers:
//!   1. Retry timer -> redeliver parked relays, then poll members for
//!      relays parked for us
//!   2. Member timer -> ask members for their member lists

use ddl_federation::{Federation, NetworkInterface};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::membership::sync_members;

/// Run the maintenance loop until shutdown. A zero member interval turns
/// member sync off.
pub async fn run_maintenance_loop(
    federation: Arc<Federation>,
    retry_interval: Duration,
    member_interval: Duration,
    poll_members: bool,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut retry_timer = tokio::time::interval(retry_interval);
    retry_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    retry_timer.tick().await;

    let member_sync = !member_interval.is_zero();
    let mut member_timer = tokio::time::interval(if member_sync { member_interval } else { Duration::from_secs(3600) });
    member_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    member_timer.tick().await;

    loop {
        tokio::select! {
            _ = retry_timer.tick() => {
                let delivered = retry_once(&federation, poll_members).await;
                if delivered > 0 {
                    tracing::info!(delivered, "node: pending relays delivered");
                }
            }

            _ = member_timer.tick(), if member_sync => {
                for iface in interfaces(&federation) {
                    match sync_members(&iface).await {
                        Ok(0) => {}
                        Ok(adopted) => tracing::info!(network_id = iface.network_id(), adopted, "node: member sync"),
                        Err(e) => tracing::warn!(network_id = iface.network_id(), error = %e, "node: member sync failed"),
                    }
                }
            }

            _ = shutdown.recv() => {
                tracing::info!("node: maintenance shutting down");
                return;
            }
        }
    }
}

fn interfaces(federation: &Arc<Federation>) -> Vec<NetworkInterface> {
    federation.interfaces().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "node: cannot list networks");
        Vec::new()
    })
}

/// One retry pass over every network. Returns how many recipients got a
/// message, whether pushed by us or pulled from a member.
pub async fn retry_once(federation: &Arc<Federation>, poll_members: bool) -> usize {
    let mut delivered = 0;
    for iface in interfaces(federation) {
        match iface.retry_pending().await {
            Ok(n) => delivered += n,
            Err(e) => tracing::warn!(network_id = iface.network_id(), error = %e, "node: pending retry failed"),
        }
        if !poll_members {
            continue;
        }
        let members = match iface.storage().approved_nodes(iface.network_id()) {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(network_id = iface.network_id(), error = %e, "node: cannot list members");
                continue;
            }
        };
        for member in members.iter().filter(|m| m.node_id != iface.instance_id()) {
            match iface.poll_pending(member).await {
                Ok(n) => delivered += n,
                Err(e) => tracing::debug!(node_id = %member.node_id, error = %e, "node: poll failed"),
            }
        }
    }
    delivered
}
