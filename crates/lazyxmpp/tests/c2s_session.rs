//! Stream negotiation, authentication, binding and iq handling over a real
//! socket.

mod common;

use std::time::Duration;

use common::{encode_plain, TestClient, TestServer, DEFAULT_TIMEOUT};
use lazyxmpp::XmppServerConfig;

#[tokio::test]
async fn anonymous_session_negotiation() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;

    client.send_stream_header().await.unwrap();
    let response = client
        .read_until("</stream:features>", DEFAULT_TIMEOUT)
        .await
        .unwrap();

    // Stream response echoes our hostname and carries a fresh id.
    assert!(response.contains("from=\"localhost\""));
    assert!(response.contains("id=\""));
    assert!(response.contains("<mechanism>ANONYMOUS</mechanism>"));
    assert!(response.contains("<mechanism>PLAIN</mechanism>"));
    assert!(response.contains("<required/>"));
    assert!(!response.contains("<starttls"));
    client.clear_buffer();

    client
        .send("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='ANONYMOUS'/>")
        .await
        .unwrap();
    let success = client.read_until("<success", DEFAULT_TIMEOUT).await.unwrap();
    assert!(success.contains("urn:ietf:params:xml:ns:xmpp-sasl"));
}

#[tokio::test]
async fn plain_auth_accepts_registered_credentials() {
    let server = TestServer::start().await;
    server.store().register_user("alice", "secret").await.unwrap();

    let mut client = TestClient::connect(&server).await;
    client.open_stream().await;
    client.send_plain_auth("alice", "secret").await;
    client.read_until("<success", DEFAULT_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn plain_auth_rejects_wrong_password() {
    let server = TestServer::start().await;
    server.store().register_user("alice", "secret").await.unwrap();

    let mut client = TestClient::connect(&server).await;
    client.open_stream().await;
    client.send_plain_auth("alice", "wrong").await;

    let failure = client.read_until("</failure>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(failure.contains("<not-authorized/>"));
    client.clear_buffer();

    // The stream stays open after a credential failure.
    client.auth_anonymous().await;
}

#[tokio::test]
async fn plain_auth_rejects_unknown_user() {
    let server = TestServer::start().await;

    let mut client = TestClient::connect(&server).await;
    client.open_stream().await;
    client.send_plain_auth("nobody", "whatever").await;

    let failure = client.read_until("</failure>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(failure.contains("<not-authorized/>"));
}

#[tokio::test]
async fn malformed_plain_payload_keeps_stream_open() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;
    client.open_stream().await;

    // No NUL separators at all.
    let payload = {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        STANDARD.encode(b"no-nul-separator")
    };
    client
        .send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            payload
        ))
        .await
        .unwrap();

    let failure = client.read_until("</failure>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(failure.contains("<malformed-request/>"));
    assert!(!failure.contains("</stream:stream>"));
    client.clear_buffer();

    client.auth_anonymous().await;
}

#[tokio::test]
async fn plain_payload_without_password_separator_is_malformed() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;
    client.open_stream().await;

    let payload = {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        STANDARD.encode(b"\0alice-no-password")
    };
    client
        .send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            payload
        ))
        .await
        .unwrap();

    let failure = client.read_until("</failure>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(failure.contains("<malformed-request/>"));
}

#[tokio::test]
async fn unknown_mechanism_closes_the_stream() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;
    client.open_stream().await;

    client
        .send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='SCRAM-SHA-256'>{}</auth>",
            encode_plain("alice", "secret")
        ))
        .await
        .unwrap();

    let response = client.read_until_eof(DEFAULT_TIMEOUT).await.unwrap();
    assert!(response.contains("<invalid-mechanism/>"));
    assert!(response.contains("</stream:stream>"));
}

#[tokio::test]
async fn bind_with_requested_resource() {
    let server = TestServer::start().await;
    server.store().register_user("alice", "secret").await.unwrap();

    let mut client = TestClient::connect(&server).await;
    client.open_stream().await;
    client.send_plain_auth("alice", "secret").await;
    client.read_until("<success", DEFAULT_TIMEOUT).await.unwrap();
    client.clear_buffer();

    client
        .send(
            "<iq id='b1' type='set'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>laptop</resource></bind></iq>",
        )
        .await
        .unwrap();

    let response = client.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(response.contains(
        "<iq type='result' id='b1'>\
         <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
         <jid>alice@localhost/laptop</jid></bind></iq>"
    ));
}

#[tokio::test]
async fn bind_without_resource_generates_one() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;

    client.open_stream().await;
    client.auth_anonymous().await;
    let jid = client.bind_resource(None).await;

    let (bare, resource) = jid.split_once('/').expect("full jid has a resource");
    assert!(bare.ends_with("@localhost"));
    // Generated ids are canonical UUIDs.
    assert_eq!(resource.len(), 36);
}

#[tokio::test]
async fn stanza_before_stream_open_yields_invalid_namespace() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;

    client.send("<presence/>").await.unwrap();
    let error = client
        .read_until("</stream:stream>", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert!(error.contains("<invalid-namespace"));
    client.clear_buffer();

    // The stream was never opened; a proper opener still works.
    let features = client.open_stream().await;
    assert!(features.contains("<mechanism>"));
}

#[tokio::test]
async fn starttls_is_refused_and_stream_closed() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;
    client.open_stream().await;

    client
        .send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
        .await
        .unwrap();

    let response = client.read_until_eof(DEFAULT_TIMEOUT).await.unwrap();
    assert!(response.contains("<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"));
    assert!(response.contains("</stream:stream>"));
}

#[tokio::test]
async fn stream_restart_after_auth_offers_bind() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;

    client.open_stream().await;
    client.auth_anonymous().await;

    let features = client.open_stream().await;
    assert!(features.contains("<bind"));
    assert!(features.contains("<session"));
    assert!(!features.contains("<mechanism>"));
    assert!(!features.contains("<register"));
}

#[tokio::test]
async fn iq_ping_gets_result() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;
    client.establish_anonymous("web").await;

    client
        .send("<iq id='p1' type='get'><ping xmlns='urn:xmpp:ping'/></iq>")
        .await
        .unwrap();

    let response = client.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(response.contains("type=\"result\""));
    assert!(response.contains("id=\"p1\""));
}

#[tokio::test]
async fn disco_queries_get_empty_results() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;
    client.establish_anonymous("web").await;

    client
        .send("<iq id='d1' type='get'><query xmlns='http://jabber.org/protocol/disco#items'/></iq>")
        .await
        .unwrap();
    let items = client.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(items.contains("<query xmlns=\"http://jabber.org/protocol/disco#items\"></query>"));
    client.clear_buffer();

    client
        .send("<iq id='d2' type='get'><query xmlns='http://jabber.org/protocol/disco#info'/></iq>")
        .await
        .unwrap();
    let info = client.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(info.contains("<query xmlns=\"http://jabber.org/protocol/disco#info\"></query>"));
}

#[tokio::test]
async fn iq_session_establishment_echoes_session() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;
    client.establish_anonymous("web").await;

    client
        .send("<iq id='s1' type='set'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>")
        .await
        .unwrap();

    let response = client.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(response.contains("type=\"result\""));
    assert!(response.contains("id=\"s1\""));
    assert!(response.contains("<session xmlns=\"urn:ietf:params:xml:ns:xmpp-session\"/>"));
}

#[tokio::test]
async fn register_prompt_before_auth() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;
    client.open_stream().await;

    client
        .send("<iq id='r1' type='get'><query xmlns='jabber:iq:register'/></iq>")
        .await
        .unwrap();

    let response = client.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(response.contains("<instructions>"));
    assert!(response.contains("<username/>"));
    assert!(response.contains("<password/>"));
}

#[tokio::test]
async fn register_prompt_unavailable_once_authenticated() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;
    client.establish_anonymous("web").await;

    client
        .send("<iq id='r1' type='get'><query xmlns='jabber:iq:register'/></iq>")
        .await
        .unwrap();

    let response = client.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(response.contains("<service-unavailable"));
}

#[tokio::test]
async fn register_prompt_unavailable_when_disabled() {
    let config = XmppServerConfig {
        enable_registration: false,
        ..Default::default()
    };
    let server = TestServer::start_with_config(config).await;
    let mut client = TestClient::connect(&server).await;

    let features = client.open_stream().await;
    assert!(!features.contains("<register"));

    client
        .send("<iq id='r1' type='get'><query xmlns='jabber:iq:register'/></iq>")
        .await
        .unwrap();
    let response = client.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(response.contains("<service-unavailable"));
}

#[tokio::test]
async fn register_write_path_is_stubbed() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;
    client.open_stream().await;

    client
        .send(
            "<iq id='r2' type='set'><query xmlns='jabber:iq:register'>\
             <username>eve</username><password>pw</password></query></iq>",
        )
        .await
        .unwrap();

    let response = client.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(response.contains("<service-unavailable"));
    assert!(!server.store().is_registered("eve").await.unwrap());
}

#[tokio::test]
async fn unknown_iq_get_query_is_service_unavailable() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;
    client.establish_anonymous("web").await;

    client
        .send("<iq id='q1' type='get'><query xmlns='jabber:iq:private'/></iq>")
        .await
        .unwrap();

    let response = client.read_until("</iq>", DEFAULT_TIMEOUT).await.unwrap();
    assert!(response.contains("type=\"error\""));
    assert!(response.contains(
        "<error type='cancel'>\
         <service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>"
    ));
}

#[tokio::test]
async fn iq_with_multiple_children_is_dropped() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;
    client.establish_anonymous("web").await;

    client
        .send(
            "<iq id='x1' type='get'>\
             <ping xmlns='urn:xmpp:ping'/><ping xmlns='urn:xmpp:ping'/></iq>",
        )
        .await
        .unwrap();

    client.expect_no_data(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn bind_before_auth_is_not_authorized() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;
    client.open_stream().await;

    client
        .send("<iq id='b1' type='set'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>")
        .await
        .unwrap();

    let response = client
        .read_until("</stream:stream>", DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert!(response.contains("<not-authorized"));
}

#[tokio::test]
async fn end_stream_closes_the_connection() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server).await;
    client.establish_anonymous("web").await;

    client.send("</stream:stream>").await.unwrap();
    client.read_until_eof(DEFAULT_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn plain_disabled_by_unsecure_auth_flag() {
    let config = XmppServerConfig {
        enable_unsecure_auth: false,
        ..Default::default()
    };
    let server = TestServer::start_with_config(config).await;
    server.store().register_user("alice", "secret").await.unwrap();

    let mut client = TestClient::connect(&server).await;
    let features = client.open_stream().await;
    assert!(!features.contains("<mechanism>PLAIN</mechanism>"));
    assert!(features.contains("<mechanism>ANONYMOUS</mechanism>"));

    // A PLAIN attempt on an unencrypted stream is treated like an unknown
    // mechanism.
    client.send_plain_auth("alice", "secret").await;
    let response = client.read_until_eof(DEFAULT_TIMEOUT).await.unwrap();
    assert!(response.contains("<invalid-mechanism/>"));
}
