//! TLS Upgrade Manager (RFC 3207 `STARTTLS`).
//!
//! Wraps [`Connection::upgrade`] with the two things the raw handshake
//! doesn't know about: refusing to start a handshake over a connection that
//! already has pipelined plaintext waiting, and bounding how long the
//! handshake itself is allowed to take.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    connection::{Connection, TlsInfo},
    error::{TlsError, TlsResult},
    framer::Framer,
    session::TlsContext,
};

/// Default ceiling on how long a `STARTTLS` handshake may take before the
/// connection is abandoned.
const DEFAULT_HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Drives a `STARTTLS` upgrade: pipelining check, timeout, handshake.
#[derive(Debug, Clone, Copy)]
pub struct TlsUpgradeManager {
    handshake_timeout: std::time::Duration,
}

impl Default for TlsUpgradeManager {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl TlsUpgradeManager {
    #[must_use]
    pub const fn new(handshake_timeout: std::time::Duration) -> Self {
        Self { handshake_timeout }
    }

    /// Whether the upgrade must be refused because the client pipelined
    /// input ahead of the server's `220` response (RFC 3207 Section 4.2):
    /// any bytes already framed-but-unconsumed, or sitting in the
    /// connection's internal read buffer, would otherwise be silently fed
    /// into the new TLS stream as if the peer had sent them over it.
    #[must_use]
    pub fn is_pipelined<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync>(
        framer: &Framer,
        connection: &Connection<Stream>,
    ) -> bool {
        framer.has_buffered_input() || connection.has_buffered_plaintext()
    }

    /// Perform the handshake, bounded by `handshake_timeout`.
    ///
    /// # Errors
    /// Returns [`TlsError::HandshakeTimeout`] if the handshake doesn't
    /// complete in time, or whatever [`Connection::upgrade`] itself returns
    /// (certificate/key loading, rustls errors, ...).
    pub async fn upgrade<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync>(
        &self,
        connection: Connection<Stream>,
        tls_context: &TlsContext,
    ) -> TlsResult<(Connection<Stream>, TlsInfo)> {
        tokio::time::timeout(self.handshake_timeout, connection.upgrade(tls_context))
            .await
            .map_err(|_| TlsError::HandshakeTimeout(self.handshake_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn pipelined_input_is_detected_from_the_framer() {
        let mut framer = Framer::new();
        framer.feed(b"QUIT\r\n").unwrap();
        let connection = Connection::Plain {
            stream: Cursor::new(Vec::<u8>::new()),
            read_buf: Vec::new(),
            read_pos: 0,
            read_len: 0,
        };
        assert!(TlsUpgradeManager::is_pipelined(&framer, &connection));
    }

    #[test]
    fn no_pipelined_input_when_both_are_empty() {
        let framer = Framer::new();
        let connection = Connection::Plain {
            stream: Cursor::new(Vec::<u8>::new()),
            read_buf: Vec::new(),
            read_pos: 0,
            read_len: 0,
        };
        assert!(!TlsUpgradeManager::is_pipelined(&framer, &connection));
    }
}
