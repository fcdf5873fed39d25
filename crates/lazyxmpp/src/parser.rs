//! Incremental XML parsing for XMPP streams.
//!
//! XMPP uses a single long-lived XML document per session, so the parser
//! accumulates bytes and emits complete top-level elements (stanzas) as they
//! become available. The outer `<stream:stream>` element is never closed
//! during normal operation; its opening tag is recognised on its own and the
//! matching close tag ends the session.

use minidom::Element;

use crate::XmppError;

/// Namespace URIs used in XMPP
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error namespace
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Roster namespace
    pub const ROSTER: &str = "jabber:iq:roster";
    /// In-band registration namespace
    pub const REGISTER: &str = "jabber:iq:register";
    /// Registration stream feature namespace
    pub const REGISTER_FEATURE: &str = "http://jabber.org/features/iq-register";
    /// Service discovery items namespace
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    /// Service discovery info namespace
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    /// XMPP ping namespace
    pub const PING: &str = "urn:xmpp:ping";
}

const STREAM_CLOSE: &str = "</stream:stream>";

/// Parsed stream header information.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source domain)
    pub from: Option<String>,
    /// The 'version' attribute (should be "1.0")
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Parse a stream header from its opening tag.
    ///
    /// Stream headers are intentionally unclosed XML, so attributes are
    /// extracted by scanning rather than DOM parsing.
    pub fn parse(tag: &str) -> Result<Self, XmppError> {
        if !tag.starts_with("<stream:stream") && !tag.starts_with("<stream ") {
            return Err(XmppError::xml_parse("No stream:stream element found"));
        }

        Ok(Self {
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            version: extract_attribute(tag, "version"),
            lang: extract_attribute(tag, "xml:lang"),
        })
    }
}

/// Extract an attribute value from an XML tag string.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    // Try both single and double quotes
    for quote in ['"', '\''] {
        let pattern = format!("{}={}", name, quote);
        if let Some(start) = tag.find(&pattern) {
            let value_start = start + pattern.len();
            if let Some(value_end) = tag[value_start..].find(quote) {
                return Some(tag[value_start..value_start + value_end].to_string());
            }
        }
    }
    None
}

/// Parsed stanza variants.
#[derive(Debug, Clone)]
pub enum ParsedStanza {
    /// Opening `<stream:stream>` tag
    StreamOpen(StreamHeader),
    /// Closing `</stream:stream>` tag
    StreamEnd,
    /// STARTTLS request
    StartTls,
    /// SASL auth request with mechanism and base64 payload
    SaslAuth {
        /// The SASL mechanism name
        mechanism: String,
        /// The base64 payload (may be empty)
        data: String,
    },
    /// IQ stanza
    Iq(Element),
    /// Message stanza
    Message(Element),
    /// Presence stanza
    Presence(Element),
    /// Anything else that appeared at the top level
    Unknown {
        /// Tag name of the unrecognised element
        name: String,
    },
}

/// Incremental XML parser for XMPP stanzas.
pub struct XmlParser {
    /// Accumulated data buffer
    buffer: Vec<u8>,
}

impl XmlParser {
    /// Create a new XML parser.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
        }
    }

    /// Feed data into the parser.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Clear the parser state and buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Parse and return the next complete stanza from the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A malformed element is
    /// consumed before the error is reported, so a bad stanza never wedges
    /// the buffer.
    pub fn next_stanza(&mut self) -> Result<Option<ParsedStanza>, XmppError> {
        loop {
            let data = String::from_utf8_lossy(&self.buffer).to_string();

            // Drop inter-stanza whitespace (and anything else before a tag).
            let start = match data.find('<') {
                Some(pos) => pos,
                None => {
                    self.buffer.clear();
                    return Ok(None);
                }
            };
            let rest = &data[start..];

            // XML declaration: consume and keep scanning.
            if rest.starts_with("<?xml") {
                match rest.find('>') {
                    Some(end) => {
                        self.buffer = rest[end + 1..].as_bytes().to_vec();
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            if rest.starts_with(STREAM_CLOSE) {
                self.buffer = rest[STREAM_CLOSE.len()..].as_bytes().to_vec();
                return Ok(Some(ParsedStanza::StreamEnd));
            }

            if rest.starts_with("<stream:stream") || rest.starts_with("<stream ") {
                let end = match rest.find('>') {
                    Some(end) => end,
                    None => return Ok(None),
                };
                let header = StreamHeader::parse(&rest[..=end])?;
                self.buffer = rest[end + 1..].as_bytes().to_vec();
                return Ok(Some(ParsedStanza::StreamOpen(header)));
            }

            // A stray close tag at the top level is dropped.
            if rest.starts_with("</") {
                match rest.find('>') {
                    Some(end) => {
                        self.buffer = rest[end + 1..].as_bytes().to_vec();
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            let tag = match tag_name(rest) {
                Some(tag) => tag,
                None => return Ok(None),
            };

            let end = match find_stanza_end(rest, &tag) {
                Some(end) => end,
                None => return Ok(None),
            };

            let xml = rest[..end].to_string();
            self.buffer = rest[end..].as_bytes().to_vec();
            return parse_stanza(&tag, &xml).map(Some);
        }
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the tag name from an opening tag. Returns None if the buffer does
/// not yet contain the full name.
fn tag_name(data: &str) -> Option<String> {
    let body = &data[1..];
    let end = body.find(|c: char| c.is_whitespace() || c == '>' || c == '/')?;
    if end == 0 {
        return None;
    }
    Some(body[..end].to_string())
}

/// Find the end position of a stanza (after the closing tag or self-closing
/// tag). Returns None if the stanza is not yet complete.
fn find_stanza_end(data: &str, tag_name: &str) -> Option<usize> {
    // Check for self-closing tag first
    if let Some(gt_pos) = data.find('>') {
        if gt_pos > 0 && data.as_bytes()[gt_pos - 1] == b'/' {
            return Some(gt_pos + 1);
        }
    }

    // Look for closing tag
    let close_tag = format!("</{}", tag_name);
    if let Some(close_start) = data.find(&close_tag) {
        if let Some(close_end) = data[close_start..].find('>') {
            return Some(close_start + close_end + 1);
        }
    }

    None
}

/// Turn a complete top-level element into a `ParsedStanza`.
fn parse_stanza(tag: &str, xml: &str) -> Result<ParsedStanza, XmppError> {
    match tag {
        "starttls" => Ok(ParsedStanza::StartTls),
        "auth" => Ok(parse_auth(xml)),
        "iq" => parse_element(xml).map(ParsedStanza::Iq),
        "message" => parse_element(xml).map(ParsedStanza::Message),
        "presence" => parse_element(xml).map(ParsedStanza::Presence),
        other => Ok(ParsedStanza::Unknown {
            name: other.to_string(),
        }),
    }
}

/// Parse a SASL `<auth>` element into mechanism and payload.
fn parse_auth(data: &str) -> ParsedStanza {
    let mechanism = extract_attribute(data, "mechanism").unwrap_or_default();

    // Extract content between > and </auth>; a self-closing tag has none.
    let content_start = data.find('>').map(|i| i + 1).unwrap_or(0);
    let content_end = data.find("</auth>").unwrap_or(content_start);
    let content = if content_start < content_end {
        data[content_start..content_end].trim().to_string()
    } else {
        String::new()
    };

    ParsedStanza::SaslAuth {
        mechanism,
        data: content,
    }
}

/// Parse a string into a minidom Element, defaulting the namespace to
/// `jabber:client` when the sender did not re-declare it mid-stream.
fn parse_element(xml: &str) -> Result<Element, XmppError> {
    let xml = with_default_ns(xml);
    xml.parse::<Element>()
        .map_err(|e| XmppError::xml_parse(format!("Failed to parse element: {}", e)))
}

/// Inject `xmlns='jabber:client'` into an opening tag that lacks any default
/// namespace declaration. Stanzas inside an XMPP stream inherit the stream's
/// default namespace, which is lost when each stanza is parsed standalone.
fn with_default_ns(xml: &str) -> String {
    let open_end = match xml.find('>') {
        Some(pos) => pos,
        None => return xml.to_string(),
    };
    if xml[..open_end].contains("xmlns=") {
        return xml.to_string();
    }

    let insert_at = if xml.as_bytes()[open_end - 1] == b'/' {
        open_end - 1
    } else {
        open_end
    };
    format!(
        "{} xmlns='{}'{}",
        &xml[..insert_at],
        ns::JABBER_CLIENT,
        &xml[insert_at..]
    )
}

/// Convert a minidom Element to serialized bytes.
pub fn element_to_bytes(element: &Element) -> Result<Vec<u8>, XmppError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| XmppError::xml_parse(format!("Failed to serialize element: {}", e)))?;
    Ok(output)
}

/// Convert a minidom Element to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, XmppError> {
    let bytes = element_to_bytes(element)?;
    String::from_utf8(bytes).map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8: {}", e)))
}
