//! XMPP server implementation.
//!
//! The server owns the TCP acceptors (IPv4 and/or IPv6, dual-stack aware),
//! the connection registry, and the credential store. Each accepted socket
//! is handed to a [`Connection`] task; routing between sessions goes
//! through the shared [`ServerContext`].

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::registry::ConnectionRegistry;
use crate::store::UserStore;
use crate::XmppError;

/// Listen backlog for the acceptors.
const LISTEN_BACKLOG: i32 = 128;

/// XMPP server configuration.
#[derive(Debug, Clone)]
pub struct XmppServerConfig {
    /// TCP port for client connections (default: 5222)
    pub port: u16,
    /// Server domain, the host part of every local JID (default: "localhost")
    pub hostname: String,
    /// Accept connections over IPv4
    pub enable_ipv4: bool,
    /// Accept connections over IPv6 (dual-stack where the OS supports it)
    pub enable_ipv6: bool,
    /// TLS support. Must stay false in this version; the server refuses
    /// `<starttls>` and never advertises it.
    pub enable_tls: bool,
    /// Advertise and answer in-band registration form requests
    pub enable_registration: bool,
    /// Offer the SASL PLAIN mechanism
    pub enable_plain_auth: bool,
    /// Allow PLAIN on unencrypted streams
    pub enable_unsecure_auth: bool,
    /// Offer the SASL ANONYMOUS mechanism
    pub enable_anonymous_auth: bool,
}

impl Default for XmppServerConfig {
    fn default() -> Self {
        Self {
            port: 5222,
            hostname: "localhost".to_string(),
            enable_ipv4: true,
            enable_ipv6: true,
            enable_tls: false,
            enable_registration: true,
            enable_plain_auth: true,
            enable_unsecure_auth: true,
            enable_anonymous_auth: true,
        }
    }
}

impl XmppServerConfig {
    fn validate(&self) -> Result<(), XmppError> {
        if !self.enable_ipv4 && !self.enable_ipv6 {
            return Err(XmppError::config("at least one socket family must be enabled"));
        }
        if self.enable_tls {
            return Err(XmppError::config("TLS is not supported in this version"));
        }
        Ok(())
    }
}

/// Long-lived state shared by every connection.
///
/// The server strictly outlives its connections, so each connection holds a
/// plain `Arc` to this context instead of any weak-reference machinery.
#[derive(Debug)]
pub struct ServerContext {
    /// Server configuration
    pub config: XmppServerConfig,
    /// Registry of live connections for routing by JID
    pub registry: ConnectionRegistry,
    /// Credential store consulted during PLAIN authentication
    pub store: UserStore,
}

/// XMPP server instance.
#[derive(Debug)]
pub struct XmppServer {
    ctx: Arc<ServerContext>,
    listeners: Vec<TcpListener>,
    shutdown: CancellationToken,
}

impl XmppServer {
    /// Bind acceptors per the configuration and assemble the server.
    ///
    /// With both families enabled, the IPv6 acceptor is created first and
    /// inspected for dual-stack support; a separate IPv4 acceptor is only
    /// bound when the OS keeps the sockets apart. Bind failures abort
    /// startup.
    pub async fn bind(
        config: XmppServerConfig,
        store: UserStore,
        shutdown: CancellationToken,
    ) -> Result<Self, XmppError> {
        config.validate()?;

        let mut listeners = Vec::new();
        let mut dual_stack = false;

        if config.enable_ipv6 {
            let (listener, v6_dual_stack) = bind_v6(config.port)?;
            info!(
                addr = %listener.local_addr()?,
                dual_stack = v6_dual_stack,
                "IPv6 acceptor bound"
            );
            listeners.push(listener);
            dual_stack = v6_dual_stack;
        }

        if config.enable_ipv4 {
            if dual_stack {
                info!("Dual stack supported, skipping separate IPv4 acceptor");
            } else {
                let listener = bind_v4(config.port)?;
                info!(addr = %listener.local_addr()?, "IPv4 acceptor bound");
                listeners.push(listener);
            }
        } else if config.enable_ipv6 && dual_stack {
            warn!("IPv4 disabled, but the dual-stack IPv6 socket still accepts IPv4 peers");
        }

        Ok(Self::assemble(config, store, listeners, shutdown))
    }

    /// Assemble a server around pre-bound listeners.
    ///
    /// Used by tests and embedders that bind their own (often ephemeral)
    /// ports.
    pub fn with_listeners(
        config: XmppServerConfig,
        store: UserStore,
        listeners: Vec<TcpListener>,
        shutdown: CancellationToken,
    ) -> Result<Self, XmppError> {
        config.validate()?;
        if listeners.is_empty() {
            return Err(XmppError::config("no listeners supplied"));
        }
        Ok(Self::assemble(config, store, listeners, shutdown))
    }

    fn assemble(
        config: XmppServerConfig,
        store: UserStore,
        listeners: Vec<TcpListener>,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = ConnectionRegistry::new(config.hostname.clone());
        let ctx = Arc::new(ServerContext {
            config,
            registry,
            store,
        });
        Self {
            ctx,
            listeners,
            shutdown,
        }
    }

    /// The shared context. Exposed for embedders that want to inspect the
    /// registry or seed the credential store.
    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Local addresses of the bound acceptors.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Accept connections until the shutdown token fires.
    ///
    /// Accept errors are logged and the loop continues; every accepted
    /// socket gets its own task.
    pub async fn run(self) -> Result<(), XmppError> {
        info!(
            hostname = %self.ctx.config.hostname,
            acceptors = self.listeners.len(),
            "XMPP server listening"
        );

        let mut handles = Vec::new();
        for listener in self.listeners {
            let ctx = Arc::clone(&self.ctx);
            let shutdown = self.shutdown.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let (stream, peer_addr) = tokio::select! {
                        result = listener.accept() => {
                            match result {
                                Ok(conn) => conn,
                                Err(e) => {
                                    warn!(error = %e, "Failed to accept connection");
                                    continue;
                                }
                            }
                        }
                        _ = shutdown.cancelled() => {
                            info!("Accept loop stopped");
                            break;
                        }
                    };

                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(e) = Connection::handle_connection(stream, peer_addr, ctx).await
                        {
                            warn!(error = %e, "Connection error");
                        }
                    });
                }
            }));
        }

        for handle in handles {
            handle
                .await
                .map_err(|e| XmppError::internal(format!("accept loop task failed: {}", e)))?;
        }
        Ok(())
    }
}

/// Bind the IPv6 acceptor and report whether the OS gave us a dual-stack
/// socket (so a separate IPv4 acceptor would be redundant).
fn bind_v6(port: u16) -> Result<(TcpListener, bool), XmppError> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    let dual_stack = !socket.only_v6()?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let addr: SocketAddr = (Ipv6Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener = TcpListener::from_std(socket.into())?;
    Ok((listener, dual_stack))
}

fn bind_v4(port: u16) -> Result<TcpListener, XmppError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(TcpListener::from_std(socket.into())?)
}
