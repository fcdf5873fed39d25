//! Per-socket connection handling.
//!
//! Each accepted socket gets one `Connection`, which owns the stream state
//! machine (pre-stream, stream-open, authenticated, resource-bound) and the
//! stanza dispatcher. Handlers mutate only their own connection's state;
//! peers are reached exclusively through the registry's outbound channels.

use std::net::SocketAddr;
use std::sync::Arc;

use jid::BareJid;
use minidom::Element;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::auth::{self, Mechanism};
use crate::parser::{self, ns, ParsedStanza, StreamHeader};
use crate::registry::OutboundBytes;
use crate::server::ServerContext;
use crate::stanza::{self, FeatureContext};
use crate::stream::{spawn_writer, XmppStream};
use crate::types::{AuthState, ConnectionId, Identity};
use crate::XmppError;

/// Size of the outbound message channel buffer.
const OUTBOUND_CHANNEL_SIZE: usize = 256;

/// State for a single client connection.
pub struct Connection {
    id: ConnectionId,
    _peer_addr: SocketAddr,
    ctx: Arc<ServerContext>,
    stream: XmppStream,
    outbound: mpsc::Sender<OutboundBytes>,
    identity: Identity,
    auth: AuthState,
    in_stream: bool,
    bound: bool,
    session_established: bool,
    encrypted: bool,
    close_pending: bool,
}

impl Connection {
    /// Drive a freshly accepted socket until the peer disconnects or a
    /// handler decides to close.
    ///
    /// The connection is a registry member from before the first read until
    /// after the last; the writer task keeps the socket alive until every
    /// queued write has been flushed.
    #[instrument(
        name = "xmpp.connection",
        skip(socket, ctx),
        fields(peer = %peer_addr, jid = tracing::field::Empty)
    )]
    pub async fn handle_connection(
        socket: TcpStream,
        peer_addr: SocketAddr,
        ctx: Arc<ServerContext>,
    ) -> Result<(), XmppError> {
        info!("New connection");

        let id = ConnectionId::next();
        let (read_half, write_half) = socket.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);

        ctx.registry
            .register(id, Identity::default(), outbound_tx.clone());
        let writer = spawn_writer(write_half, outbound_rx);

        let conn = Self {
            id,
            _peer_addr: peer_addr,
            ctx: Arc::clone(&ctx),
            stream: XmppStream::new(read_half),
            outbound: outbound_tx,
            identity: Identity::default(),
            auth: AuthState::NotAuthenticated,
            in_stream: false,
            bound: false,
            session_established: false,
            encrypted: false,
            close_pending: false,
        };

        // `run` consumes the connection, so the connection's own sender is
        // gone by the time we unregister; dropping the registry entry closes
        // the channel and lets the writer drain and exit.
        let result = run(conn).await;

        ctx.registry.unregister(id);
        let _ = writer.await;
        info!("Connection closed");
        result
    }

    /// Read stanzas until EOF, a fatal error, or `close_pending`.
    async fn run(&mut self) -> Result<(), XmppError> {
        loop {
            if self.close_pending {
                break;
            }

            match self.stream.read_stanza().await {
                Ok(Some(stanza)) => {
                    if let Err(e) = self.dispatch(stanza).await {
                        warn!(error = %e, "Error handling stanza");
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Clean connection close");
                    break;
                }
                Err(XmppError::XmlParse(msg)) => {
                    // Partial stream documents are normal for XMPP; anything
                    // else unparseable is logged and skipped.
                    warn!(error = %msg, "Ignoring unparseable stanza");
                }
                Err(e) => {
                    warn!(error = %e, "Read error");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Route a parsed stanza by tag and stream state.
    async fn dispatch(&mut self, stanza: ParsedStanza) -> Result<(), XmppError> {
        match stanza {
            ParsedStanza::StreamOpen(header) => self.handle_stream_open(header).await,
            ParsedStanza::StreamEnd => {
                debug!("End of stream");
                self.close_pending = true;
                Ok(())
            }

            // Everything below needs to be in an established stream.
            _ if !self.in_stream => {
                debug!("Stanza received out of stream");
                self.send(stanza::stream_error_invalid_namespace()).await
            }

            ParsedStanza::StartTls => {
                debug!("Client attempted STARTTLS, refusing");
                self.close_pending = true;
                self.send(stanza::starttls_refusal()).await
            }
            ParsedStanza::SaslAuth { mechanism, data } => {
                self.handle_auth(&mechanism, &data).await
            }
            ParsedStanza::Iq(element) => self.handle_iq(element).await,

            stanza => {
                // Everything below needs to be authorized.
                if self.enforce_authorized().await? {
                    return Ok(());
                }
                match stanza {
                    ParsedStanza::Message(element) => self.handle_message(element).await,
                    ParsedStanza::Presence(element) => self.handle_presence(element).await,
                    ParsedStanza::Unknown { name } => {
                        debug!(name = %name, "Unknown stanza, dropping");
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    /// Enqueue bytes for this connection's own socket.
    async fn send(&self, xml: impl Into<OutboundBytes>) -> Result<(), XmppError> {
        self.outbound
            .send(xml.into())
            .await
            .map_err(|_| XmppError::stream("outbound channel closed"))
    }

    fn bare_jid(&self) -> String {
        self.identity.bare_jid(&self.ctx.config.hostname)
    }

    fn full_jid(&self) -> String {
        self.identity.full_jid(&self.ctx.config.hostname)
    }

    /// Whether PLAIN may be used on this stream.
    fn plain_allowed(&self) -> bool {
        let config = &self.ctx.config;
        config.enable_plain_auth && (self.encrypted || config.enable_unsecure_auth)
    }

    fn feature_context(&self) -> FeatureContext {
        let config = &self.ctx.config;
        FeatureContext {
            tls_enabled: config.enable_tls,
            authenticated: self.auth.is_authenticated(),
            bound: self.bound,
            registration_enabled: config.enable_registration,
            plain_allowed: self.plain_allowed(),
            anonymous_allowed: config.enable_anonymous_auth,
        }
    }

    /// If the connection is unauthenticated, answer with a not-authorized
    /// stream error and report true so the caller stops processing.
    async fn enforce_authorized(&mut self) -> Result<bool, XmppError> {
        if self.auth.is_authenticated() {
            return Ok(false);
        }
        debug!("Unauthorized stanza");
        self.send(stanza::stream_error_not_authorized()).await?;
        Ok(true)
    }

    /// Reply to a `<stream:stream>` opener with the preamble, the stream
    /// response, and features computed from current connection state.
    async fn handle_stream_open(&mut self, header: StreamHeader) -> Result<(), XmppError> {
        if let Some(ref to) = header.to {
            if to != &self.ctx.config.hostname {
                debug!(expected = %self.ctx.config.hostname, got = %to, "Domain mismatch in stream header");
            }
        }

        let stream_id = Uuid::new_v4().to_string();
        let response = format!(
            "{}{}{}",
            stanza::XML_PREAMBLE,
            stanza::stream_response(&self.ctx.config.hostname, &stream_id),
            stanza::stream_features(&self.feature_context()),
        );
        self.in_stream = true;
        self.send(response).await
    }

    async fn handle_auth(&mut self, mechanism: &str, data: &str) -> Result<(), XmppError> {
        match Mechanism::from_name(mechanism) {
            Some(Mechanism::Plain) if self.plain_allowed() => self.handle_auth_plain(data).await,
            Some(Mechanism::Anonymous) if self.ctx.config.enable_anonymous_auth => {
                self.handle_auth_anonymous().await
            }
            _ => {
                debug!(mechanism = %mechanism, "Unsupported SASL mechanism");
                self.close_pending = true;
                self.send(stanza::sasl_failure_invalid_mechanism()).await
            }
        }
    }

    async fn handle_auth_plain(&mut self, data: &str) -> Result<(), XmppError> {
        let creds = match auth::parse_plain(data) {
            Ok(creds) => creds,
            Err(e) => {
                debug!(error = %e, "Malformed PLAIN payload");
                return self.send(stanza::sasl_failure_malformed_request()).await;
            }
        };

        // The node has to form a valid bare JID under our domain.
        let bare = format!("{}@{}", creds.node, self.ctx.config.hostname);
        if bare.parse::<BareJid>().is_err() {
            debug!(node = %creds.node, "Node does not form a valid JID");
            return self.send(stanza::sasl_failure_malformed_request()).await;
        }

        match self
            .ctx
            .store
            .verify_password(&creds.node, &creds.password)
            .await
        {
            Ok(true) => {
                self.set_authenticated(creds.node, AuthState::Authenticated);
                info!(jid = %self.bare_jid(), "PLAIN authentication successful");
                self.send(stanza::sasl_success()).await
            }
            Ok(false) => {
                warn!(node = %creds.node, "PLAIN authentication rejected");
                self.send(stanza::sasl_failure_not_authorized()).await
            }
            Err(e) => {
                warn!(error = %e, "Credential store failure during PLAIN auth");
                self.send(stanza::sasl_failure("temporary-auth-failure")).await
            }
        }
    }

    async fn handle_auth_anonymous(&mut self) -> Result<(), XmppError> {
        self.set_authenticated(Uuid::new_v4().to_string(), AuthState::Anonymous);
        info!(jid = %self.bare_jid(), "Anonymous session authenticated");
        self.send(stanza::sasl_success()).await
    }

    fn set_authenticated(&mut self, node: String, state: AuthState) {
        self.identity.node = node;
        if self.identity.nickname.is_empty() {
            self.identity.nickname = self.identity.node.clone();
        }
        self.auth = state;
        self.ctx.registry.update_identity(self.id, self.identity.clone());
        tracing::Span::current().record("jid", self.bare_jid());
    }

    async fn handle_iq(&mut self, element: Element) -> Result<(), XmppError> {
        let id = element.attr("id").unwrap_or_default().to_string();
        let iq_type = element.attr("type").unwrap_or_default().to_string();

        if element.children().count() != 1 {
            debug!(id = %id, "Unexpected number of iq child elements, dropping");
            return Ok(());
        }
        let child = match element.children().next() {
            Some(child) => child.clone(),
            None => return Ok(()),
        };

        match iq_type.as_str() {
            "set" => self.handle_iq_set(&id, &child).await,
            "get" => self.handle_iq_get(&id, &child).await,
            "result" => Ok(()),
            other => {
                debug!(iq_type = other, "Unknown iq type, dropping");
                Ok(())
            }
        }
    }

    async fn handle_iq_get(&mut self, id: &str, child: &Element) -> Result<(), XmppError> {
        // Registration form requests are allowed before authentication.
        if child.name() == "query" && child.ns() == ns::REGISTER {
            return self.handle_register_prompt(id).await;
        }

        // Everything below needs to be authorized.
        if self.enforce_authorized().await? {
            return Ok(());
        }

        if child.name() == "query" {
            match child.ns().as_str() {
                ns::ROSTER => self.handle_roster_get(id).await,
                ns::DISCO_ITEMS => {
                    let reply = stanza::iq_result_disco_empty(
                        id,
                        &self.full_jid(),
                        &self.ctx.config.hostname,
                        ns::DISCO_ITEMS,
                    );
                    self.send(reply).await
                }
                ns::DISCO_INFO => {
                    let reply = stanza::iq_result_disco_empty(
                        id,
                        &self.full_jid(),
                        &self.ctx.config.hostname,
                        ns::DISCO_INFO,
                    );
                    self.send(reply).await
                }
                other => {
                    debug!(query_ns = other, "Unknown iq get query");
                    self.send_service_unavailable(id).await
                }
            }
        } else if child.name() == "ping" {
            let reply = stanza::iq_result_ping(id, &self.full_jid(), &self.ctx.config.hostname);
            self.send(reply).await
        } else {
            debug!(child = %child.name(), "Unhandled iq get");
            self.send_service_unavailable(id).await
        }
    }

    async fn handle_iq_set(&mut self, id: &str, child: &Element) -> Result<(), XmppError> {
        // The in-band registration write path is stubbed.
        if child.name() == "query" && child.ns() == ns::REGISTER {
            return self.send_service_unavailable(id).await;
        }

        // Everything below needs to be authorized.
        if self.enforce_authorized().await? {
            return Ok(());
        }

        match child.name() {
            "bind" => self.handle_bind(id, child).await,
            "session" => {
                self.session_established = true;
                self.send(stanza::iq_result_session(id, &self.full_jid())).await
            }
            other => {
                debug!(child = other, "Unhandled iq set, dropping");
                Ok(())
            }
        }
    }

    /// Reply with the registration prompt form when registration is open to
    /// this connection, otherwise service-unavailable.
    async fn handle_register_prompt(&mut self, id: &str) -> Result<(), XmppError> {
        if self.ctx.config.enable_registration && self.auth == AuthState::NotAuthenticated {
            return self.send(stanza::iq_result_register_form(id)).await;
        }
        self.send_service_unavailable(id).await
    }

    async fn send_service_unavailable(&self, id: &str) -> Result<(), XmppError> {
        let to = if self.auth.is_authenticated() {
            self.full_jid()
        } else {
            String::new()
        };
        self.send(stanza::iq_error_service_unavailable(
            id,
            &to,
            &self.ctx.config.hostname,
        ))
        .await
    }

    /// Reply with one roster item per currently connected session,
    /// the requester included.
    async fn handle_roster_get(&mut self, id: &str) -> Result<(), XmppError> {
        let mut items = String::new();
        for peer in self.ctx.registry.snapshot() {
            items.push_str(&stanza::roster_item(&peer.nickname, &peer.bare_jid));
        }

        let response = format!(
            "{}{}{}",
            stanza::iq_header("result", id, &self.bare_jid(), ""),
            stanza::roster_query(&items),
            stanza::IQ_CLOSE,
        );
        self.send(response).await
    }

    /// Bind a resource: the requested one when present and usable, a
    /// generated one otherwise.
    async fn handle_bind(&mut self, id: &str, bind: &Element) -> Result<(), XmppError> {
        let requested = bind
            .get_child("resource", ns::BIND)
            .map(|r| r.text())
            .filter(|t| !t.trim().is_empty());

        let resource = match requested {
            Some(resource) => {
                let valid = self
                    .bare_jid()
                    .parse::<BareJid>()
                    .ok()
                    .and_then(|bare| bare.with_resource_str(&resource).ok())
                    .is_some();
                if valid {
                    resource
                } else {
                    debug!(resource = %resource, "Unusable resource requested, generating one");
                    Uuid::new_v4().to_string()
                }
            }
            None => Uuid::new_v4().to_string(),
        };

        self.identity.resource = resource;
        self.bound = true;
        self.ctx.registry.update_identity(self.id, self.identity.clone());

        let full_jid = self.full_jid();
        tracing::Span::current().record("jid", full_jid.as_str());
        info!(jid = %full_jid, "Resource bound");

        self.send(stanza::iq_result_bind(id, &full_jid)).await?;
        self.add_to_rosters();
        Ok(())
    }

    /// Push a roster item describing this freshly bound session to every
    /// connected peer, self included. A stand-in for a real roster
    /// subsystem; peers learn about each session as it binds.
    fn add_to_rosters(&self) {
        let item = stanza::roster_item(&self.identity.nickname, &self.full_jid());
        let query = stanza::roster_query(&item);

        for peer in self.ctx.registry.snapshot() {
            let push = format!(
                "{}{}{}",
                stanza::iq_header("set", &Uuid::new_v4().to_string(), &peer.bare_jid, &self.full_jid()),
                query,
                stanza::IQ_CLOSE,
            );
            peer.enqueue(push.into_bytes());
        }
    }

    /// Stamp the sender on a message and route it to its recipient.
    /// Messages without a recipient or a body are dropped.
    async fn handle_message(&mut self, mut element: Element) -> Result<(), XmppError> {
        let to = match element.attr("to") {
            Some(to) if !to.is_empty() => to.to_string(),
            _ => {
                debug!("Message without recipient, dropping");
                return Ok(());
            }
        };

        if !element.children().any(|c| c.name() == "body") {
            debug!("Message without body, dropping");
            return Ok(());
        }

        element.set_attr("from", self.full_jid());
        let bytes = parser::element_to_bytes(&element)?;
        let delivered = self.ctx.registry.write_to_jid(&to, &bytes);
        debug!(to = %to, delivered, "Forwarded message");
        Ok(())
    }

    async fn handle_presence(&mut self, mut element: Element) -> Result<(), XmppError> {
        let to = element.attr("to").unwrap_or_default().to_string();
        let presence_type = element.attr("type").unwrap_or_default().to_string();

        // Initial presence: probe every connected peer.
        if to.is_empty() && presence_type.is_empty() {
            for peer in self.ctx.registry.snapshot() {
                let probe = stanza::presence(&self.full_jid(), &peer.bare_jid, "probe");
                peer.enqueue(probe.into_bytes());
            }
        }

        if !to.is_empty() {
            // Directed presence: stamp the sender and route it.
            element.set_attr("from", self.full_jid());
            let bytes = parser::element_to_bytes(&element)?;
            self.ctx.registry.write_to_jid(&to, &bytes);
        } else {
            // Broadcast: readdress a copy to every peer's bare JID.
            element.set_attr("from", self.full_jid());
            for peer in self.ctx.registry.snapshot() {
                element.set_attr("to", peer.bare_jid.clone());
                let bytes = parser::element_to_bytes(&element)?;
                peer.enqueue(bytes);
            }
        }
        Ok(())
    }

    /// Whether this connection completed session establishment.
    pub fn session_established(&self) -> bool {
        self.session_established
    }
}

/// Run the connection loop on an owned `Connection`.
async fn run(mut conn: Connection) -> Result<(), XmppError> {
    conn.run().await
}
