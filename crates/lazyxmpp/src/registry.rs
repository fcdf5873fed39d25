//! Connection registry.
//!
//! Tracks every live connection from accept until teardown and routes
//! serialized stanzas by Jabber ID. Entries carry a copy of the
//! connection's identity, refreshed by the owning connection after
//! authentication and after resource binding; routing matches the exact
//! bare or full JID string.

use std::fmt;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{ConnectionId, Identity};

/// Serialized bytes queued for delivery on a connection's socket.
pub type OutboundBytes = Vec<u8>;

/// Result of attempting to enqueue bytes on a connection.
#[derive(Debug)]
pub enum SendResult {
    /// Bytes were queued for delivery
    Sent,
    /// The channel to the recipient is full (backpressure)
    ChannelFull,
    /// The channel to the recipient is closed
    ChannelClosed,
}

struct RegisteredConnection {
    sender: mpsc::Sender<OutboundBytes>,
    identity: Identity,
}

/// A point-in-time view of one registered connection, taken outside the
/// registry's shard locks so fan-out writes never hold them.
#[derive(Clone)]
pub struct PeerSnapshot {
    /// The peer's connection id
    pub id: ConnectionId,
    /// The peer's bare JID at snapshot time
    pub bare_jid: String,
    /// The peer's full JID at snapshot time
    pub full_jid: String,
    /// The peer's nickname at snapshot time
    pub nickname: String,
    sender: mpsc::Sender<OutboundBytes>,
}

impl PeerSnapshot {
    /// Enqueue bytes on this peer's outbound channel.
    pub fn enqueue(&self, bytes: OutboundBytes) -> SendResult {
        match self.sender.try_send(bytes) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %self.id, "Outbound channel full, dropping stanza");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendResult::ChannelClosed,
        }
    }
}

/// Registry of live connections, indexed for routing by JID.
pub struct ConnectionRegistry {
    domain: String,
    connections: DashMap<ConnectionId, RegisteredConnection>,
}

impl ConnectionRegistry {
    /// Create a new registry for the given server domain.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            connections: DashMap::new(),
        }
    }

    /// The domain used to render registered identities as JIDs.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Register a connection. Called immediately after accept, before the
    /// connection has any identity.
    pub fn register(
        &self,
        id: ConnectionId,
        identity: Identity,
        sender: mpsc::Sender<OutboundBytes>,
    ) {
        debug!(connection = %id, "Registered connection");
        self.connections
            .insert(id, RegisteredConnection { sender, identity });
    }

    /// Remove a connection. Returns false when it was not registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        debug!(connection = %id, removed, "Unregistered connection");
        removed
    }

    /// Replace the stored identity for a connection. The owning connection
    /// calls this after authentication and after resource binding.
    pub fn update_identity(&self, id: ConnectionId, identity: Identity) {
        if let Some(mut entry) = self.connections.get_mut(&id) {
            entry.identity = identity;
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Enqueue `bytes` on every connection whose bare or full JID equals
    /// `jid` exactly. Returns the number of matching connections that
    /// accepted the write; zero matches is not an error, the stanza is
    /// silently dropped.
    pub fn write_to_jid(&self, jid: &str, bytes: &[u8]) -> usize {
        let mut delivered = 0;
        let mut stale = Vec::new();

        for entry in self.connections.iter() {
            let identity = &entry.identity;
            let bare = identity.bare_jid(&self.domain);
            let full = identity.full_jid(&self.domain);
            if bare != jid && full != jid {
                continue;
            }

            match entry.sender.try_send(bytes.to_vec()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(peer = %entry.key(), to = jid, "Outbound channel full, dropping stanza");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    stale.push(*entry.key());
                }
            }
        }

        // Entries with closed channels are connections mid-teardown.
        for id in stale {
            if self.connections.remove(&id).is_some() {
                debug!(connection = %id, "Removed stale connection");
            }
        }

        if delivered == 0 {
            debug!(to = jid, "No matching connection, stanza dropped");
        }
        delivered
    }

    /// Snapshot every registered connection for fan-out iteration.
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.connections
            .iter()
            .map(|entry| PeerSnapshot {
                id: *entry.key(),
                bare_jid: entry.identity.bare_jid(&self.domain),
                full_jid: entry.identity.full_jid(&self.domain),
                nickname: entry.identity.nickname.clone(),
                sender: entry.sender.clone(),
            })
            .collect()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("domain", &self.domain)
            .field("connection_count", &self.connections.len())
            .finish()
    }
}
