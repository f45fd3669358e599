//! Replication coordinator: bridges stores and the pub/sub bus.
//!
//! One subscription per database address. Local writes raise the store's
//! heads watch; an outbound task observes it and announces the newest
//! frontier, so a burst of writes collapses into one announcement. Inbound
//! announcements are merged through the store, which fetches missing
//! ancestors from the object store.

use cid::Cid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::services::PubSub;
use crate::store::Store;

/// How long a freshly subscribed store waits before announcing its heads,
/// so peers that subscribed moments earlier converge without waiting for
/// the next write.
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Wire form of a heads announcement.
#[derive(Debug, Serialize, Deserialize)]
struct HeadsAnnouncement {
    address: String,
    heads: Vec<String>,
}

/// Where a per-address subscription is in its lifecycle. Only `Subscribed`
/// sends or receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

struct Subscription {
    state: SubscriptionState,
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
}

/// The per-manager replication coordinator.
pub struct Replicator {
    bus: Arc<dyn PubSub>,
    peer_id: String,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl Replicator {
    pub fn new(bus: Arc<dyn PubSub>, peer_id: &str) -> Replicator {
        Replicator {
            bus,
            peer_id: peer_id.to_owned(),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self, channel: &str) -> SubscriptionState {
        self.subscriptions
            .lock()
            .unwrap()
            .get(channel)
            .map(|s| s.state)
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    /// Subscribes the store's address on the bus and spawns its inbound and
    /// outbound tasks. Subscribing an already subscribed address is a no-op.
    pub fn subscribe(&self, store: &Arc<Store>) -> Result<()> {
        let channel = store.address().to_string();
        {
            let subs = self.subscriptions.lock().unwrap();
            if subs.contains_key(&channel) {
                return Ok(());
            }
        }

        let receiver = self.bus.subscribe(&channel, &self.peer_id)?;

        let inbound = {
            let store = store.clone();
            let peer = self.peer_id.clone();
            let channel = channel.clone();
            let mut receiver = receiver;
            tokio::spawn(async move {
                while let Some(message) = receiver.recv().await {
                    if message.from == peer {
                        continue;
                    }
                    let announcement: HeadsAnnouncement =
                        match serde_json::from_slice(&message.data) {
                            Ok(announcement) => announcement,
                            Err(err) => {
                                warn!(%channel, %err, "undecodable announcement dropped");
                                continue;
                            }
                        };
                    if announcement.address != channel {
                        continue;
                    }
                    let heads = match parse_heads(&announcement.heads) {
                        Some(heads) => heads,
                        None => {
                            warn!(%channel, "announcement with malformed heads dropped");
                            continue;
                        }
                    };
                    match store.apply_remote_heads(&heads).await {
                        Ok(added) => {
                            if !added.is_empty() {
                                debug!(%channel, count = added.len(), from = %message.from, "replicated");
                            }
                        }
                        Err(err) => {
                            warn!(%channel, %err, "merge of announced heads failed");
                        }
                    }
                }
            })
        };

        let outbound = {
            let store = store.clone();
            let bus = self.bus.clone();
            let peer = self.peer_id.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                let mut frontier = store.heads_watch();
                // ready republication: one announcement after the settle
                // delay covers peers that subscribed before this store
                tokio::time::sleep(SETTLE_DELAY).await;
                announce(bus.as_ref(), &peer, &channel, &store.heads().await);
                loop {
                    if frontier.changed().await.is_err() {
                        break;
                    }
                    let heads = frontier.borrow_and_update().clone();
                    announce(bus.as_ref(), &peer, &channel, &heads);
                }
            })
        };

        let mut subs = self.subscriptions.lock().unwrap();
        subs.insert(
            channel,
            Subscription {
                state: SubscriptionState::Subscribed,
                inbound,
                outbound,
            },
        );
        Ok(())
    }

    /// Tears down the subscription for `channel`, if any.
    pub fn unsubscribe(&self, channel: &str) {
        let subscription = {
            let mut subs = self.subscriptions.lock().unwrap();
            if let Some(sub) = subs.get_mut(channel) {
                sub.state = SubscriptionState::Unsubscribing;
            }
            subs.remove(channel)
        };
        if let Some(subscription) = subscription {
            subscription.inbound.abort();
            subscription.outbound.abort();
            self.bus.unsubscribe(channel, &self.peer_id);
        }
    }

    /// Tears down every subscription.
    pub fn disconnect(&self) {
        let channels: Vec<String> = {
            let subs = self.subscriptions.lock().unwrap();
            subs.keys().cloned().collect()
        };
        for channel in channels {
            self.unsubscribe(&channel);
        }
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subs = self.subscriptions.lock().unwrap();
        write!(f, "Replicator(peer {}, {} channels)", self.peer_id, subs.len())
    }
}

fn parse_heads(strings: &[String]) -> Option<Vec<Cid>> {
    let mut heads = Vec::with_capacity(strings.len());
    for s in strings {
        match Cid::try_from(s.as_str()) {
            Ok(cid) => heads.push(cid),
            Err(_) => return None,
        }
    }
    Some(heads)
}

fn announce(bus: &dyn PubSub, peer: &str, channel: &str, heads: &[Cid]) {
    if heads.is_empty() {
        return;
    }
    let announcement = HeadsAnnouncement {
        address: channel.to_owned(),
        heads: heads.iter().map(|cid| cid.to_string()).collect(),
    };
    let data = match serde_json::to_vec(&announcement) {
        Ok(data) => data,
        Err(err) => {
            warn!(%channel, %err, "failed to encode announcement");
            return;
        }
    };
    if let Err(err) = bus.publish(channel, peer, data) {
        // nothing lost: the next write republishes the frontier
        warn!(%channel, %err, "publish failed");
    }
}
