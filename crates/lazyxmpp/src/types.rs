//! Common types for the XMPP server.

use std::sync::atomic::{AtomicU64, Ordering};

/// Authentication state of a connection.
///
/// A connection starts out unauthenticated and advances exactly once, on a
/// successful SASL exchange. The ordering matters: anything above
/// `NotAuthenticated` counts as authorized for stanza routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthState {
    /// No successful SASL exchange yet
    NotAuthenticated,
    /// Authenticated via SASL ANONYMOUS (generated node id)
    Anonymous,
    /// Authenticated via SASL PLAIN (client-chosen node id)
    Authenticated,
}

impl AuthState {
    /// Whether this connection may send routed stanzas.
    pub fn is_authenticated(self) -> bool {
        self > AuthState::NotAuthenticated
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthState::NotAuthenticated => write!(f, "not-authenticated"),
            AuthState::Anonymous => write!(f, "anonymous"),
            AuthState::Authenticated => write!(f, "authenticated"),
        }
    }
}

/// Unique identifier for a live connection, assigned at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The identity a connection has accumulated so far.
///
/// All three parts start out empty. `node` is set by authentication,
/// `resource` by resource binding, `nickname` defaults to the node the
/// first time one is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Local part of the JID (before the `@`)
    pub node: String,
    /// Resource part of the JID (after the `/`)
    pub resource: String,
    /// Display name used in roster items
    pub nickname: String,
}

impl Identity {
    /// The bare JID (`node@domain`) of this identity.
    pub fn bare_jid(&self, domain: &str) -> String {
        format!("{}@{}", self.node, domain)
    }

    /// The full JID (`node@domain/resource`) of this identity.
    pub fn full_jid(&self, domain: &str) -> String {
        format!("{}/{}", self.bare_jid(domain), self.resource)
    }
}
