//! Test utilities for exercising the server over real sockets.
//!
//! Provides an ephemeral-port test server backed by an in-memory credential
//! store and a raw XMPP test client with pattern-based reads.

// Each integration test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use lazyxmpp::{ServerContext, UserStore, XmppServer, XmppServerConfig};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test tracing subscriber once.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Test server handle. Shuts the accept loop down on drop.
pub struct TestServer {
    /// Address of the ephemeral listener
    pub addr: SocketAddr,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Start a test server with default configuration (hostname
    /// "localhost", everything enabled, TLS off).
    pub async fn start() -> Self {
        Self::start_with_config(XmppServerConfig::default()).await
    }

    /// Start a test server with custom configuration.
    pub async fn start_with_config(config: XmppServerConfig) -> Self {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let store = UserStore::in_memory()
            .await
            .expect("Failed to open in-memory store");
        let shutdown = CancellationToken::new();

        let server = XmppServer::with_listeners(config, store, vec![listener], shutdown.clone())
            .expect("Failed to assemble test server");
        let ctx = server.context();

        tokio::spawn(server.run());

        Self {
            addr,
            ctx,
            shutdown,
        }
    }

    /// The server's credential store, for seeding test users.
    pub fn store(&self) -> &UserStore {
        &self.ctx.store
    }

    /// The server's shared context.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Raw XMPP test client.
pub struct TestClient {
    stream: TcpStream,
    buffer: String,
}

impl TestClient {
    /// Connect to the test server.
    pub async fn connect(server: &TestServer) -> Self {
        let stream = TcpStream::connect(server.addr)
            .await
            .expect("Failed to connect to test server");
        Self {
            stream,
            buffer: String::new(),
        }
    }

    /// Send raw XML data.
    pub async fn send(&mut self, data: &str) -> std::io::Result<()> {
        self.stream.write_all(data.as_bytes()).await?;
        self.stream.flush().await
    }

    /// Read until the accumulated buffer contains `pattern`.
    pub async fn read_until(&mut self, pattern: &str, timeout_dur: Duration) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        loop {
            if self.buffer.contains(pattern) {
                return Ok(self.buffer.clone());
            }

            if start.elapsed() > timeout_dur {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("Timeout waiting for pattern: {}", pattern),
                ));
            }

            let mut buf = [0u8; 4096];
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            let n = match timeout(remaining, self.stream.read(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("Timeout waiting for pattern: {}", pattern),
                    ))
                }
            };

            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("Connection closed waiting for pattern: {}", pattern),
                ));
            }

            self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    /// Read until the server closes the connection, returning everything
    /// received.
    pub async fn read_until_eof(&mut self, timeout_dur: Duration) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        loop {
            let mut buf = [0u8; 4096];
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            let n = match timeout(remaining, self.stream.read(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "Timeout waiting for close",
                    ))
                }
            };
            if n == 0 {
                return Ok(self.buffer.clone());
            }
            self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    /// Assert that nothing arrives within the window.
    pub async fn expect_no_data(&mut self, window: Duration) {
        let mut buf = [0u8; 4096];
        match timeout(window, self.stream.read(&mut buf)).await {
            Err(_) => {}
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => panic!(
                "Expected silence, received: {}",
                String::from_utf8_lossy(&buf[..n])
            ),
            Ok(Err(e)) => panic!("Read error while expecting silence: {}", e),
        }
    }

    /// Clear the read buffer.
    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }

    /// Send the client stream header.
    pub async fn send_stream_header(&mut self) -> std::io::Result<()> {
        self.send(
            "<?xml version='1.0'?>\
             <stream:stream to='localhost' xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>",
        )
        .await
    }

    /// Open the stream and wait for the server's features.
    pub async fn open_stream(&mut self) -> String {
        self.send_stream_header().await.expect("send stream header");
        let response = self
            .read_until("</stream:features>", DEFAULT_TIMEOUT)
            .await
            .expect("stream features");
        self.clear_buffer();
        response
    }

    /// Authenticate with SASL ANONYMOUS and wait for success.
    pub async fn auth_anonymous(&mut self) {
        self.send("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='ANONYMOUS'/>")
            .await
            .expect("send auth");
        self.read_until("<success", DEFAULT_TIMEOUT)
            .await
            .expect("sasl success");
        self.clear_buffer();
    }

    /// Send SASL PLAIN credentials. The caller asserts the outcome.
    pub async fn send_plain_auth(&mut self, node: &str, password: &str) {
        let payload = encode_plain(node, password);
        self.send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            payload
        ))
        .await
        .expect("send auth");
    }

    /// Bind a resource and return the full JID from the reply.
    pub async fn bind_resource(&mut self, resource: Option<&str>) -> String {
        let body = match resource {
            Some(r) => format!("<resource>{}</resource>", r),
            None => String::new(),
        };
        self.send(&format!(
            "<iq id='bind_1' type='set'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>{}</bind></iq>",
            body
        ))
        .await
        .expect("send bind");

        let response = self
            .read_until("</jid></bind></iq>", DEFAULT_TIMEOUT)
            .await
            .expect("bind result");

        // Binding fans a roster push out to every session, ourselves
        // included; drain it so later reads start clean.
        self.read_until("jabber:iq:roster", DEFAULT_TIMEOUT)
            .await
            .expect("roster push after bind");
        self.clear_buffer();
        extract_bound_jid(&response).expect("bound jid in reply")
    }

    /// Full session setup: stream open, ANONYMOUS auth, bind.
    pub async fn establish_anonymous(&mut self, resource: &str) -> String {
        self.open_stream().await;
        self.auth_anonymous().await;
        self.bind_resource(Some(resource)).await
    }

    /// Full session setup with PLAIN credentials.
    pub async fn establish_plain(&mut self, node: &str, password: &str, resource: &str) -> String {
        self.open_stream().await;
        self.send_plain_auth(node, password).await;
        self.read_until("<success", DEFAULT_TIMEOUT)
            .await
            .expect("sasl success");
        self.clear_buffer();
        self.bind_resource(Some(resource)).await
    }
}

/// Encode SASL PLAIN credentials with an empty authzid.
pub fn encode_plain(node: &str, password: &str) -> String {
    BASE64_STANDARD.encode(format!("\0{}\0{}", node, password).as_bytes())
}

/// Extract the `<jid>` text from a bind result.
pub fn extract_bound_jid(response: &str) -> Option<String> {
    let start = response.find("<jid>")?;
    let end = response.find("</jid>")?;
    Some(response[start + 5..end].to_string())
}
