//! Serialized stanza builders.
//!
//! Pure functions producing the raw XMPP fragments the server writes:
//! stream header and features, SASL results, stream errors, and the iq,
//! roster and presence templates. Everything here returns `String`s ready
//! to be enqueued on a connection's outbound channel.

use crate::parser::ns;

/// The XML declaration sent before a stream response.
pub const XML_PREAMBLE: &str = "<?xml version='1.0'?>";

/// Closing tag for an `<iq>` built with [`iq_header`].
pub const IQ_CLOSE: &str = "</iq>";

/// Connection-state inputs to the stream-features generators.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureContext {
    /// Server has TLS enabled (always false in this version)
    pub tls_enabled: bool,
    /// Connection has completed SASL
    pub authenticated: bool,
    /// Connection has bound a resource
    pub bound: bool,
    /// Server offers in-band registration
    pub registration_enabled: bool,
    /// PLAIN may be offered on this stream
    pub plain_allowed: bool,
    /// ANONYMOUS may be offered on this stream
    pub anonymous_allowed: bool,
}

/// Escape a string for use in XML text or attribute values.
pub fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// The server's reply to a `<stream:stream>` opener.
pub fn stream_response(hostname: &str, stream_id: &str) -> String {
    format!(
        "<stream:stream from=\"{}\" id=\"{}\" version=\"1.0\" \
         xmlns=\"jabber:client\" xmlns:stream=\"{}\">",
        escape_xml(hostname),
        stream_id,
        ns::STREAM
    )
}

/// Assemble `<stream:features>` from the per-connection generators.
pub fn stream_features(ctx: &FeatureContext) -> String {
    format!(
        "<stream:features>{}{}{}{}{}{}</stream:features>",
        features_tls(ctx),
        features_mechanisms(ctx),
        features_compression(ctx),
        features_bind(ctx),
        features_session(ctx),
        features_register(ctx),
    )
}

fn features_tls(ctx: &FeatureContext) -> &'static str {
    if ctx.tls_enabled {
        "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"
    } else {
        ""
    }
}

fn features_mechanisms(ctx: &FeatureContext) -> String {
    // Don't offer mechanisms if we are already logged in.
    if ctx.authenticated {
        return String::new();
    }

    let mut mechanisms = String::new();
    if ctx.anonymous_allowed {
        mechanisms.push_str("<mechanism>ANONYMOUS</mechanism>");
    }
    if ctx.plain_allowed {
        mechanisms.push_str("<mechanism>PLAIN</mechanism>");
    }
    if mechanisms.is_empty() {
        return String::new();
    }

    format!(
        "<mechanisms xmlns=\"{}\">{}<required/></mechanisms>",
        ns::SASL,
        mechanisms
    )
}

fn features_compression(_ctx: &FeatureContext) -> &'static str {
    // Stream compression is an extension point, never advertised.
    ""
}

fn features_bind(ctx: &FeatureContext) -> String {
    if ctx.authenticated && !ctx.bound {
        format!("<bind xmlns=\"{}\"><required/></bind>", ns::BIND)
    } else {
        String::new()
    }
}

fn features_session(ctx: &FeatureContext) -> String {
    if ctx.authenticated && !ctx.bound {
        format!("<session xmlns=\"{}\"><optional/></session>", ns::SESSION)
    } else {
        String::new()
    }
}

fn features_register(ctx: &FeatureContext) -> String {
    if !ctx.authenticated && !ctx.bound && ctx.registration_enabled {
        format!("<register xmlns='{}'/>", ns::REGISTER_FEATURE)
    } else {
        String::new()
    }
}

/// SASL success payload.
pub fn sasl_success() -> String {
    format!("<success xmlns=\"{}\"/>", ns::SASL)
}

/// SASL failure with the given condition element.
pub fn sasl_failure(condition: &str) -> String {
    format!("<failure xmlns='{}'><{}/></failure>", ns::SASL, condition)
}

/// SASL failure for an unsupported mechanism. Ends the stream.
pub fn sasl_failure_invalid_mechanism() -> String {
    format!("{}</stream:stream>", sasl_failure("invalid-mechanism"))
}

/// SASL failure for a structurally broken payload. The stream stays open.
pub fn sasl_failure_malformed_request() -> String {
    sasl_failure("malformed-request")
}

/// SASL failure for bad credentials. The stream stays open.
pub fn sasl_failure_not_authorized() -> String {
    sasl_failure("not-authorized")
}

/// Stream error sent when a stanza arrives before any stream was opened.
///
/// Sent as a self-contained XML document because no stream response has
/// been emitted on this connection yet.
pub fn stream_error_invalid_namespace() -> String {
    format!(
        "{}<stream:stream id='' xmlns:stream='{}' version='1.0' xmlns='jabber:client'>\
         <stream:error><invalid-namespace xmlns='{}'/></stream:error></stream:stream>",
        XML_PREAMBLE,
        ns::STREAM,
        ns::STREAMS
    )
}

/// Stream error sent when an unauthenticated connection tries a routed stanza.
pub fn stream_error_not_authorized() -> String {
    format!(
        "<stream:error><not-authorized xmlns='{}'/></stream:error></stream:stream>",
        ns::STREAMS
    )
}

/// Refusal sent in response to `<starttls>`. Ends the stream.
pub fn starttls_refusal() -> String {
    format!("<failure xmlns='{}'/></stream:stream>", ns::TLS)
}

/// Opening `<iq>` tag. Empty `to`/`from` are omitted.
pub fn iq_header(iq_type: &str, id: &str, to: &str, from: &str) -> String {
    let mut header = format!("<iq type=\"{}\" id=\"{}\"", iq_type, escape_xml(id));
    if !to.is_empty() {
        header.push_str(&format!(" to=\"{}\"", escape_xml(to)));
    }
    if !from.is_empty() {
        header.push_str(&format!(" from=\"{}\"", escape_xml(from)));
    }
    header.push('>');
    header
}

/// Result for a resource bind request.
pub fn iq_result_bind(id: &str, full_jid: &str) -> String {
    format!(
        "<iq type='result' id='{}'><bind xmlns='{}'><jid>{}</jid></bind></iq>",
        escape_xml(id),
        ns::BIND,
        escape_xml(full_jid)
    )
}

/// Result for a session establishment request.
pub fn iq_result_session(id: &str, to: &str) -> String {
    format!(
        "{}<session xmlns=\"{}\"/>{}",
        iq_header("result", id, to, ""),
        ns::SESSION,
        IQ_CLOSE
    )
}

/// Result for an iq ping.
pub fn iq_result_ping(id: &str, to: &str, from: &str) -> String {
    format!("{}{}", iq_header("result", id, to, from), IQ_CLOSE)
}

/// A roster `<query>` wrapping the given serialized items.
pub fn roster_query(items: &str) -> String {
    format!("<query xmlns=\"{}\">{}</query>", ns::ROSTER, items)
}

/// A single roster `<item>`.
pub fn roster_item(name: &str, jid: &str) -> String {
    format!(
        "<item subscription=\"to\" name=\"{}\" jid=\"{}\"></item>",
        escape_xml(name),
        escape_xml(jid)
    )
}

/// Result for a registration form request.
pub fn iq_result_register_form(id: &str) -> String {
    format!(
        "{}<query xmlns='{}'>\
         <instructions>Choose a username and password for use with this service.</instructions>\
         <username/><password/></query>{}",
        iq_header("result", id, "", ""),
        ns::REGISTER,
        IQ_CLOSE
    )
}

/// Result for a disco query, echoing the requested namespace with no items.
pub fn iq_result_disco_empty(id: &str, to: &str, from: &str, query_ns: &str) -> String {
    format!(
        "{}<query xmlns=\"{}\"></query>{}",
        iq_header("result", id, to, from),
        query_ns,
        IQ_CLOSE
    )
}

/// Service-unavailable error iq.
pub fn iq_error_service_unavailable(id: &str, to: &str, from: &str) -> String {
    format!(
        "{}<error type='cancel'><service-unavailable xmlns='{}'/></error>{}",
        iq_header("error", id, to, from),
        ns::STANZAS,
        IQ_CLOSE
    )
}

/// A bare `<presence>` stanza. An empty `type` is omitted.
pub fn presence(from: &str, to: &str, presence_type: &str) -> String {
    let mut stanza = format!(
        "<presence from=\"{}\" to=\"{}\"",
        escape_xml(from),
        escape_xml(to)
    );
    if !presence_type.is_empty() {
        stanza.push_str(&format!(" type=\"{}\"", presence_type));
    }
    stanza.push_str("/>");
    stanza
}
