//! Socket I/O for XMPP connections.
//!
//! The read half of each socket feeds the incremental parser; the write
//! half is owned by a dedicated writer task draining the connection's
//! outbound channel, so registry fan-out and the connection's own replies
//! share one FIFO path to the peer.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::parser::{ParsedStanza, XmlParser};
use crate::registry::OutboundBytes;
use crate::XmppError;

/// Read buffer size per socket read.
const READ_BUF_SIZE: usize = 8192;

/// The inbound side of an XMPP stream.
pub struct XmppStream {
    reader: OwnedReadHalf,
    parser: XmlParser,
}

impl XmppStream {
    /// Wrap the read half of an accepted socket.
    pub fn new(reader: OwnedReadHalf) -> Self {
        Self {
            reader,
            parser: XmlParser::new(),
        }
    }

    /// Read the next stanza, pulling more bytes from the socket as needed.
    ///
    /// Returns `Ok(None)` on clean EOF. IO errors surface as
    /// [`XmppError::Io`] and end the connection; parse errors surface as
    /// [`XmppError::XmlParse`] and leave the stream usable.
    pub async fn read_stanza(&mut self) -> Result<Option<ParsedStanza>, XmppError> {
        let mut buf = [0u8; READ_BUF_SIZE];

        loop {
            if let Some(stanza) = self.parser.next_stanza()? {
                return Ok(Some(stanza));
            }

            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.parser.feed(&buf[..n]);
        }
    }
}

/// Spawn the writer task for a connection.
///
/// The task drains the outbound channel in FIFO order and shuts the socket
/// down once every sender is gone. Write errors end the task; the read
/// side notices via EOF on its next read.
pub fn spawn_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<OutboundBytes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                debug!(error = %e, "Write error, stopping writer");
                break;
            }
            if let Err(e) = writer.flush().await {
                debug!(error = %e, "Flush error, stopping writer");
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}
