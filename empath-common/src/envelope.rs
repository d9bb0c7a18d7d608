use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::address::{Address, AddressList};

/// RFC 3461 DSN parameters negotiated for a single recipient via `RCPT TO`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RcptDsn {
    /// The `NOTIFY=` parameter: which delivery events should trigger a DSN.
    pub notify: Option<Vec<DsnNotify>>,
    /// The `ORCPT=` parameter: the original recipient, for DSNs to report against.
    pub orcpt: Option<String>,
}

/// The events a sender asked to be notified about for a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DsnNotify {
    Never,
    Success,
    Failure,
    Delay,
}

/// The MAIL FROM/RCPT TO state of the transaction currently in progress.
///
/// Cleared wholesale by `RSET` and by a fresh `MAIL FROM`; survives a
/// `BDAT`/`DATA` sequence so the delivery pipeline downstream of spooling can
/// read back exactly what the client declared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    sender: Option<Address>,
    recipients: Option<AddressList>,

    /// The `SIZE=` parameter from `MAIL FROM`, if the client declared one.
    #[serde(default)]
    declared_size: Option<usize>,

    /// Whether the client negotiated the `SMTPUTF8` extension for this
    /// transaction (RFC 6531), permitting UTF-8 local-parts and headers.
    #[serde(default)]
    smtp_utf8: bool,

    /// The `RET=` parameter from `MAIL FROM` (RFC 3461): `FULL` or `HDRS`.
    #[serde(default)]
    dsn_ret: Option<DsnRet>,

    /// The `ENVID=` parameter from `MAIL FROM` (RFC 3461), echoed back in DSNs.
    #[serde(default)]
    dsn_envid: Option<String>,

    /// Per-recipient DSN parameters, keyed by the recipient's mailbox string.
    #[serde(default)]
    rcpt_dsn: HashMap<String, RcptDsn>,
}

/// The `RET=` parameter of RFC 3461: how much of the original message a DSN
/// should include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DsnRet {
    Full,
    Hdrs,
}

impl Envelope {
    /// Returns a reference to the [`Envelope`] sender for this message
    #[inline]
    pub const fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    /// Returns a mutable reference to the [`Envelope`] sender for this message
    #[inline]
    pub const fn sender_mut(&mut self) -> &mut Option<Address> {
        &mut self.sender
    }

    /// Returns a reference to the [`Envelope`] recipients for this message
    #[inline]
    pub const fn recipients(&self) -> Option<&AddressList> {
        self.recipients.as_ref()
    }

    /// Returns a mutable reference to the [`Envelope`] recipients for this message
    #[inline]
    pub const fn recipients_mut(&mut self) -> &mut Option<AddressList> {
        &mut self.recipients
    }

    #[must_use]
    pub const fn declared_size(&self) -> Option<usize> {
        self.declared_size
    }

    pub fn set_declared_size(&mut self, size: Option<usize>) {
        self.declared_size = size;
    }

    #[must_use]
    pub const fn smtp_utf8(&self) -> bool {
        self.smtp_utf8
    }

    pub fn set_smtp_utf8(&mut self, value: bool) {
        self.smtp_utf8 = value;
    }

    #[must_use]
    pub const fn dsn_ret(&self) -> Option<DsnRet> {
        self.dsn_ret
    }

    pub fn set_dsn_ret(&mut self, ret: Option<DsnRet>) {
        self.dsn_ret = ret;
    }

    #[must_use]
    pub fn dsn_envid(&self) -> Option<&str> {
        self.dsn_envid.as_deref()
    }

    pub fn set_dsn_envid(&mut self, envid: Option<String>) {
        self.dsn_envid = envid;
    }

    pub fn set_rcpt_dsn(&mut self, mailbox: impl Into<String>, dsn: RcptDsn) {
        self.rcpt_dsn.insert(mailbox.into(), dsn);
    }

    #[must_use]
    pub fn rcpt_dsn(&self, mailbox: &str) -> Option<&RcptDsn> {
        self.rcpt_dsn.get(mailbox)
    }
}

#[cfg(test)]
mod test {
    use super::{DsnNotify, DsnRet, Envelope, RcptDsn};

    #[test]
    fn declared_size_round_trips() {
        let mut envelope = Envelope::default();
        assert_eq!(envelope.declared_size(), None);
        envelope.set_declared_size(Some(4096));
        assert_eq!(envelope.declared_size(), Some(4096));
    }

    #[test]
    fn dsn_parameters_round_trip() {
        let mut envelope = Envelope::default();
        envelope.set_dsn_ret(Some(DsnRet::Full));
        envelope.set_dsn_envid(Some("envid-1".to_string()));
        envelope.set_rcpt_dsn(
            "alice@example.com",
            RcptDsn {
                notify: Some(vec![DsnNotify::Success, DsnNotify::Failure]),
                orcpt: Some("rfc822;alice@example.com".to_string()),
            },
        );

        assert_eq!(envelope.dsn_ret(), Some(DsnRet::Full));
        assert_eq!(envelope.dsn_envid(), Some("envid-1"));
        assert!(envelope.rcpt_dsn("alice@example.com").is_some());
        assert!(envelope.rcpt_dsn("bob@example.com").is_none());
    }

    #[test]
    fn serializes_for_spool_metadata() {
        let mut envelope = Envelope::default();
        envelope.set_declared_size(Some(128));
        envelope.set_smtp_utf8(true);

        let ron = ron::to_string(&envelope).expect("envelope serializes");
        let back: Envelope = ron::from_str(&ron).expect("envelope deserializes");
        assert_eq!(back.declared_size(), Some(128));
        assert!(back.smtp_utf8());
    }
}
