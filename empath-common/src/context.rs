use std::{borrow::Cow, collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{delivery::DeliveryContext, envelope::Envelope, status::Status};

/// A single ESMTP extension keyword advertised in an EHLO response
/// (RFC 5321 Section 4.1.1.1, RFC 1869).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    /// `STARTTLS` (RFC 3207).
    StartTls,
    /// `HELP`.
    Help,
    /// `SIZE <max-bytes>` (RFC 1870); `0` advertises no limit.
    Size(usize),
    /// `AUTH <mechanism>...` (RFC 4954).
    Auth(Vec<String>),
    /// `SMTPUTF8` (RFC 6531).
    SmtpUtf8,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StartTls => f.write_str("STARTTLS"),
            Self::Help => f.write_str("HELP"),
            Self::Size(0) => f.write_str("SIZE"),
            Self::Size(max) => write!(f, "SIZE {max}"),
            Self::Auth(mechanisms) => write!(f, "AUTH {}", mechanisms.join(" ")),
            Self::SmtpUtf8 => f.write_str("SMTPUTF8"),
        }
    }
}

/// The state carried for the lifetime of a single SMTP connection.
///
/// `Context` is deliberately the one place every collaborator touches: the
/// finite state machine reads and writes [`Envelope`] through it, transaction
/// handlers stash scratch values in `metadata`, and the final response a
/// handler wants written back to the client goes in `response`. Everything
/// here is plain data; nothing in this struct talks to the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    /// Correlates this connection across logs, spool metadata and DSNs.
    pub id: String,

    /// Set once EHLO succeeds; gates which extensions are advertised/usable.
    pub extended: bool,

    /// Hostname sent in the greeting banner and EHLO/HELO responses.
    #[serde(skip)]
    pub banner: Arc<str>,

    /// Extensions advertised in the EHLO response, derived from the
    /// listener's configured [`Extension`](crate)s.
    #[serde(skip)]
    pub capabilities: Vec<Capability>,

    /// Maximum accepted message size in bytes (RFC 1870 SIZE); `0` means
    /// unlimited.
    #[serde(default)]
    pub max_message_size: usize,

    /// Sender/recipients/size declarations for the transaction in progress.
    pub envelope: Envelope,

    /// True once STARTTLS has completed and the session is operating over TLS.
    #[serde(default)]
    pub tls_active: bool,

    /// True once AUTH has succeeded for this connection.
    #[serde(default)]
    pub authenticated: bool,

    /// The SASL identity bound to this connection, if authenticated.
    #[serde(default)]
    pub authenticated_username: Option<String>,

    /// Consecutive failed AUTH attempts, used by the rate limiter.
    #[serde(default)]
    pub auth_failed_attempts: u32,

    /// If set, AUTH is refused until this monotonic deadline (unix seconds) passes.
    #[serde(default)]
    pub auth_locked_until: Option<u64>,

    /// Peer address, stringified, for logging/audit without pulling in `std::net`.
    #[serde(default)]
    pub peer_address: Option<String>,

    /// The raw message body accumulated for the transaction in progress.
    #[serde(skip)]
    pub data: Option<Arc<[u8]>>,

    /// Free-form scratch space for interceptors and transaction handlers.
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// The response a handler wants written back to the client, if it wants
    /// to override whatever the state machine would otherwise send.
    #[serde(skip)]
    pub response: Option<(Status, Cow<'static, str>)>,

    /// The identifier assigned by the spool backend once this message has
    /// been written to durable storage.
    #[serde(default)]
    pub tracking_id: Option<String>,

    /// Outbound relay state, persisted alongside the spooled message so the
    /// delivery processor can resume after a restart.
    #[serde(default)]
    pub delivery: Option<DeliveryContext>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            id: String::new(),
            extended: false,
            banner: Arc::from(""),
            capabilities: Vec::new(),
            max_message_size: 0,
            envelope: Envelope::default(),
            tls_active: false,
            authenticated: false,
            authenticated_username: None,
            auth_failed_attempts: 0,
            auth_locked_until: None,
            peer_address: None,
            data: None,
            metadata: HashMap::new(),
            response: None,
            tracking_id: None,
            delivery: None,
        }
    }
}

impl Context {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn message(&self) -> String {
        self.data.as_deref().map_or_else(String::new, |data| {
            std::str::from_utf8(data).map_or_else(|_| format!("{data:?}"), str::to_string)
        })
    }

    #[must_use]
    pub fn sender(&self) -> Option<String> {
        self.envelope.sender().map(ToString::to_string)
    }

    #[must_use]
    pub fn recipients(&self) -> Vec<String> {
        self.envelope
            .recipients()
            .map(|recipients| recipients.iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    /// Set the response the client should receive for the command in flight.
    pub fn respond(&mut self, status: Status, message: impl Into<Cow<'static, str>>) {
        self.response = Some((status, message.into()));
    }

    /// Clear the transaction-scoped envelope and data, per RFC 5321 RSET
    /// semantics. Authentication state survives by default; callers that
    /// want RSET to also drop authentication should clear it explicitly.
    pub fn reset_transaction(&mut self) {
        self.envelope = Envelope::default();
        self.data = None;
        self.response = None;
    }

    /// Clear everything a STARTTLS upgrade must discard: any pipelined
    /// transaction state and, per RFC 3207, any prior AUTH state, since the
    /// negotiation that established it happened on the clear-text channel.
    pub fn reset_for_starttls(&mut self) {
        self.reset_transaction();
        self.authenticated = false;
        self.authenticated_username = None;
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::Context;
    use crate::status::Status;

    #[test]
    fn new_context_has_id() {
        let ctx = Context::new("abc123");
        assert_eq!(ctx.id(), "abc123");
        assert!(!ctx.extended);
        assert!(!ctx.authenticated);
    }

    #[test]
    fn reset_transaction_clears_envelope_not_auth() {
        let mut ctx = Context::new("abc123");
        ctx.authenticated = true;
        ctx.authenticated_username = Some("alice".to_string());
        ctx.envelope.set_declared_size(Some(100));
        ctx.data = Some(Arc::from(b"body".as_slice()));

        ctx.reset_transaction();

        assert!(ctx.authenticated);
        assert_eq!(ctx.authenticated_username.as_deref(), Some("alice"));
        assert!(ctx.data.is_none());
        assert_eq!(ctx.envelope.declared_size(), None);
    }

    #[test]
    fn reset_for_starttls_clears_auth_too() {
        let mut ctx = Context::new("abc123");
        ctx.authenticated = true;
        ctx.authenticated_username = Some("alice".to_string());

        ctx.reset_for_starttls();

        assert!(!ctx.authenticated);
        assert_eq!(ctx.authenticated_username, None);
    }

    #[test]
    fn respond_sets_response() {
        let mut ctx = Context::new("abc123");
        ctx.respond(Status::Ok, "2.0.0 Ok");
        assert_eq!(ctx.response.unwrap().0, Status::Ok);
    }
}
