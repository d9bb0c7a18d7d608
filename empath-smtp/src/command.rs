use core::fmt::{self, Display, Formatter};

use empath_common::{
    address::{Address, AddressList},
    envelope::{DsnNotify, DsnRet},
};
use mailparse::MailAddr;

#[derive(PartialEq, PartialOrd, Eq, Hash, Debug)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

/// The ESMTP parameters attached to a `MAIL FROM` command (RFC 1870, RFC 3461, RFC 6531).
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct MailParameters {
    /// `SIZE=` (RFC 1870): declared message size in bytes.
    pub size: Option<usize>,
    /// `SMTPUTF8` (RFC 6531): the transaction uses UTF-8 local-parts/headers.
    pub smtp_utf8: bool,
    /// `RET=` (RFC 3461): how much of the message a DSN should include.
    pub ret: Option<DsnRet>,
    /// `ENVID=` (RFC 3461): opaque envelope identifier echoed back in DSNs.
    pub envid: Option<String>,
}

impl MailParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any ESMTP parameter was set (no `SIZE`/`SMTPUTF8`/`RET`/`ENVID`).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size.is_none() && !self.smtp_utf8 && self.ret.is_none() && self.envid.is_none()
    }
}

impl Display for MailParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        if let Some(size) = self.size {
            write!(f, "SIZE={size}")?;
            wrote = true;
        }
        if self.smtp_utf8 {
            if wrote {
                f.write_str(" ")?;
            }
            f.write_str("SMTPUTF8")?;
            wrote = true;
        }
        if let Some(ret) = self.ret {
            if wrote {
                f.write_str(" ")?;
            }
            write!(f, "RET={}", match ret {
                DsnRet::Full => "FULL",
                DsnRet::Hdrs => "HDRS",
            })?;
            wrote = true;
        }
        if let Some(envid) = &self.envid {
            if wrote {
                f.write_str(" ")?;
            }
            write!(f, "ENVID={envid}")?;
        }
        Ok(())
    }
}

/// The ESMTP parameters attached to a `RCPT TO` command (RFC 3461).
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct RcptParams {
    /// `NOTIFY=` : which delivery events this recipient wants reported.
    pub notify: Option<Vec<DsnNotify>>,
    /// `ORCPT=` : the original recipient, verbatim.
    pub orcpt: Option<String>,
}

/// A SASL mechanism named in an `AUTH` command (RFC 4954).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AuthMechanism {
    Plain,
    Login,
}

impl Display for AuthMechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        })
    }
}

#[derive(Eq, PartialEq, Debug)]
pub enum Command {
    Helo(HeloVariant),
    Help,
    /// If this contains `None`, then it should be assumed this is the `null sender`, or `null reverse-path`,
    /// from [RFC-5321](https://www.ietf.org/rfc/rfc5321.txt).
    MailFrom(Option<Address>, MailParameters),
    RcptTo(AddressList, RcptParams),
    Rset,
    /// `AUTH <mechanism> [initial-response]` (RFC 4954).
    Auth(AuthMechanism, Option<String>),
    /// A base64 line sent in response to a 334 continuation challenge.
    /// Never produced by `TryFrom<&str>`; the session layer constructs this
    /// directly once it knows AUTH negotiation is in progress.
    AuthContinuation(String),
    Data,
    /// `BDAT <chunk-size> [LAST]` (RFC 3030).
    Bdat(usize, bool),
    Quit,
    StartTLS,
    Invalid(String),
}

impl Command {
    #[must_use]
    pub fn inner(&self) -> String {
        match self {
            Self::MailFrom(from, _) => from.as_ref().map_or_else(String::new, |f| match &**f {
                MailAddr::Group(_) => String::new(),
                MailAddr::Single(s) => s.to_string(),
            }),
            Self::RcptTo(to, _) => to.to_string(),
            Self::Invalid(command) => command.clone(),
            Self::Helo(HeloVariant::Ehlo(id) | HeloVariant::Helo(id)) => id.clone(),
            _ => String::new(),
        }
    }

    /// Extract the SIZE parameter from a MAIL FROM command, if present.
    ///
    /// Per RFC 1870, the SIZE parameter indicates the size (in bytes) of the
    /// message the client intends to transmit.
    #[must_use]
    pub const fn size(&self) -> Option<usize> {
        match self {
            Self::MailFrom(_, params) => params.size,
            _ => None,
        }
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v) => fmt.write_fmt(format_args!("{} {}", v, self.inner())),
            Self::MailFrom(s, params) => {
                let addr = s.as_ref().map_or_else(String::new, |f| match &**f {
                    MailAddr::Group(_) => String::new(),
                    MailAddr::Single(s) => s.to_string(),
                });
                fmt.write_fmt(format_args!("MAIL FROM:{addr}"))?;
                if let Some(size) = params.size {
                    fmt.write_fmt(format_args!(" SIZE={size}"))?;
                }
                if params.smtp_utf8 {
                    fmt.write_str(" SMTPUTF8")?;
                }
                Ok(())
            }
            Self::RcptTo(rcpt, _) => fmt.write_fmt(format_args!("RCPT TO:{rcpt}")),
            Self::Data => fmt.write_str("DATA"),
            Self::Bdat(size, last) => {
                if *last {
                    fmt.write_fmt(format_args!("BDAT {size} LAST"))
                } else {
                    fmt.write_fmt(format_args!("BDAT {size}"))
                }
            }
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTLS => fmt.write_str("STARTTLS"),
            Self::Invalid(s) => fmt.write_str(s),
            Self::Help => fmt.write_str("HELP"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Auth(mechanism, _) => fmt.write_fmt(format_args!("AUTH {mechanism}")),
            Self::AuthContinuation(_) => fmt.write_str("<auth-continuation>"),
        }
    }
}

fn parse_mail_params(rest: &str) -> Result<MailParameters, Command> {
    let mut params = MailParameters::default();
    let mut seen_size = false;

    for param in rest.split_whitespace() {
        let upper = param.to_ascii_uppercase();
        if let Some(value) = upper.strip_prefix("SIZE=") {
            if seen_size {
                return Err(Command::Invalid(
                    "Duplicate SIZE parameter not allowed".to_string(),
                ));
            }
            seen_size = true;
            if let Ok(value) = value.parse::<usize>() {
                if value != 0 {
                    params.size = Some(value);
                }
            }
        } else if upper == "SMTPUTF8" {
            params.smtp_utf8 = true;
        } else if let Some(value) = upper.strip_prefix("RET=") {
            params.ret = match value {
                "FULL" => Some(DsnRet::Full),
                "HDRS" => Some(DsnRet::Hdrs),
                _ => None,
            };
        } else if param.len() > 6 && param[..6].eq_ignore_ascii_case("ENVID=") {
            params.envid = Some(param[6..].to_string());
        }
    }

    Ok(params)
}

fn parse_rcpt_params(rest: &str) -> RcptParams {
    let mut params = RcptParams::default();

    for param in rest.split_whitespace() {
        let upper = param.to_ascii_uppercase();
        if let Some(value) = upper.strip_prefix("NOTIFY=") {
            let notify = value
                .split(',')
                .filter_map(|v| match v {
                    "NEVER" => Some(DsnNotify::Never),
                    "SUCCESS" => Some(DsnNotify::Success),
                    "FAILURE" => Some(DsnNotify::Failure),
                    "DELAY" => Some(DsnNotify::Delay),
                    _ => None,
                })
                .collect::<Vec<_>>();
            if !notify.is_empty() {
                params.notify = Some(notify);
            }
        } else if param.len() > 6 && param[..6].eq_ignore_ascii_case("ORCPT=") {
            params.orcpt = Some(param[6..].to_string());
        }
    }

    params
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let comm = command.to_ascii_uppercase();
        let comm = comm.trim();

        if comm.starts_with("MAIL FROM:") {
            if comm.len() < 11 {
                return Err(Self::Invalid(command.to_owned()));
            }

            let rest = command[10..].trim();
            let parts: Vec<&str> = rest.splitn(2, char::is_whitespace).collect();
            let addr = parts[0];
            let params = parts.get(1).map_or_else(
                || Ok(MailParameters::default()),
                |rest| parse_mail_params(rest),
            )?;

            if addr == "<>" {
                return Ok(Self::MailFrom(None, params));
            }

            mailparse::addrparse(addr).map_or_else(
                |err| Err(Self::Invalid(err.to_string())),
                |from| {
                    Ok(Self::MailFrom(
                        if from.is_empty() {
                            None
                        } else {
                            Some(from[0].clone().into())
                        },
                        params,
                    ))
                },
            )
        } else if comm.starts_with("RCPT TO:") {
            if comm.len() < 9 {
                return Err(Self::Invalid(command.to_owned()));
            }

            let rest = command[8..].trim();
            let parts: Vec<&str> = rest.splitn(2, char::is_whitespace).collect();
            let addr = parts[0];
            let params = parts.get(1).map_or_else(RcptParams::default, |rest| {
                parse_rcpt_params(rest)
            });

            mailparse::addrparse(addr).map_or_else(
                |e| Err(Self::Invalid(e.to_string())),
                |to| Ok(Self::RcptTo(to.into(), params)),
            )
        } else if comm.starts_with("EHLO") || comm.starts_with("HELO") {
            match command.split_once(' ') {
                None => Err(Self::Invalid(format!("Expected hostname in {comm}"))),
                Some((_, host)) if comm.starts_with('H') => {
                    Ok(Self::Helo(HeloVariant::Helo(host.trim().to_string())))
                }
                Some((_, host)) => Ok(Self::Helo(HeloVariant::Ehlo(host.trim().to_string()))),
            }
        } else if comm.starts_with("BDAT") {
            let rest = comm.strip_prefix("BDAT").unwrap_or_default().trim();
            let mut parts = rest.split_whitespace();
            let size = parts.next().and_then(|s| s.parse::<usize>().ok());
            let last = parts.next().is_some_and(|s| s == "LAST");

            size.map_or_else(
                || Err(Self::Invalid(command.to_owned())),
                |size| Ok(Self::Bdat(size, last)),
            )
        } else if comm.starts_with("AUTH") {
            let rest = command.get(4..).unwrap_or_default().trim();
            let mut parts = rest.splitn(2, char::is_whitespace);
            let mechanism = parts.next().unwrap_or_default().to_ascii_uppercase();
            let initial = parts.next().map(str::to_string);

            match mechanism.as_str() {
                "PLAIN" => Ok(Self::Auth(AuthMechanism::Plain, initial)),
                "LOGIN" => Ok(Self::Auth(AuthMechanism::Login, initial)),
                _ => Err(Self::Invalid(command.to_owned())),
            }
        } else {
            match comm {
                "DATA" => Ok(Self::Data),
                "QUIT" => Ok(Self::Quit),
                "STARTTLS" => Ok(Self::StartTLS),
                "HELP" => Ok(Self::Help),
                "RSET" => Ok(Self::Rset),
                _ => Err(Self::Invalid(command.to_owned())),
            }
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Invalid("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}

impl TryFrom<String> for Command {
    type Error = Self;

    fn try_from(command: String) -> Result<Self, Self::Error> {
        Self::try_from(command.as_str())
    }
}

#[cfg(test)]
mod test {
    use crate::command::{AuthMechanism, Command, HeloVariant};

    // Idea copied from https://gitlab.com/erichdongubler-experiments/rust_case_permutations/blob/master/src/lib.rs#L97
    fn string_casing(string: &str) -> impl Iterator<Item = String> {
        let len = string.len();
        let num_cases = usize::pow(2, u32::try_from(len).unwrap_or(0));

        let (upper, lower) = string.chars().fold(
            (Vec::with_capacity(len), Vec::with_capacity(len)),
            |(mut upper, mut lower), c| {
                upper.push(c.to_ascii_uppercase());
                lower.push(c.to_ascii_lowercase());
                (upper, lower)
            },
        );

        (0..num_cases).map(move |i| {
            (0..len).fold(String::with_capacity(len), |mut s, idx| {
                if (i & (1 << idx)) == 0 {
                    s.push(lower[idx]);
                } else {
                    s.push(upper[idx]);
                }
                s
            })
        })
    }

    #[test]
    fn mail_from_command() {
        let Ok(Command::MailFrom(Some(_), params)) =
            Command::try_from("Mail From: test@gmail.com")
        else {
            panic!("expected MailFrom");
        };
        assert_eq!(params.size, None);

        assert!(Command::try_from("Mail From:").is_err());
        assert!(Command::try_from("Mail FROM:dasdas").is_err());
        assert!(Command::try_from("Mail FROM dasdas").is_err());

        assert!(matches!(
            Command::try_from("MAIL FROM: <>"),
            Ok(Command::MailFrom(None, _))
        ));

        let Ok(Command::MailFrom(Some(_), params)) =
            Command::try_from("MAIL FROM: <test@gmail.com> SIZE=12345")
        else {
            panic!("expected MailFrom");
        };
        assert_eq!(params.size, Some(12345));

        for comm in string_casing("mail from") {
            assert!(matches!(
                Command::try_from(format!("{comm}: test@gmail.com")),
                Ok(Command::MailFrom(_, _))
            ));
        }
    }

    #[test]
    fn mail_from_size_edge_cases() {
        assert!(matches!(
            Command::try_from("MAIL FROM: <test@example.com> SIZE=0"),
            Ok(Command::MailFrom(_, params)) if params.size.is_none()
        ));

        assert!(matches!(
            Command::try_from("MAIL FROM: <test@example.com> SIZE=abc"),
            Ok(Command::MailFrom(_, params)) if params.size.is_none()
        ));

        assert!(matches!(
            Command::try_from("MAIL FROM: <test@example.com> SIZE=1000 SIZE=2000"),
            Err(Command::Invalid(_))
        ));

        assert!(matches!(
            Command::try_from("MAIL FROM: <test@example.com> size=5000"),
            Ok(Command::MailFrom(_, params)) if params.size == Some(5000)
        ));
    }

    #[test]
    fn mail_from_esmtp_params() {
        assert!(matches!(
            Command::try_from("MAIL FROM: <test@example.com> SMTPUTF8 RET=HDRS ENVID=abc123"),
            Ok(Command::MailFrom(_, params))
                if params.smtp_utf8
                    && params.ret == Some(empath_common::envelope::DsnRet::Hdrs)
                    && params.envid.as_deref() == Some("abc123")
        ));
    }

    #[test]
    fn rcpt_to_command() {
        assert!(matches!(
            Command::try_from("Rcpt To: test@gmail.com"),
            Ok(Command::RcptTo(_, _))
        ));

        assert!(Command::try_from("Rcpt To:").is_err());
        assert!(Command::try_from("RCPT TO:dasdsa").is_err());
        assert!(Command::try_from("RCPT TO dasdsa").is_err());

        for comm in string_casing("rcpt to") {
            assert!(matches!(
                Command::try_from(format!("{comm}: test@gmail.com")),
                Ok(Command::RcptTo(_, _))
            ));
        }
    }

    #[test]
    fn rcpt_to_dsn_params() {
        assert!(matches!(
            Command::try_from("RCPT TO: <test@example.com> NOTIFY=SUCCESS,FAILURE ORCPT=rfc822;test@example.com"),
            Ok(Command::RcptTo(_, params)) if params.notify.is_some() && params.orcpt.is_some()
        ));
    }

    #[test]
    fn helo_ehlo_command() {
        assert!(Command::try_from("EHLO").is_err());
        assert!(Command::try_from("HELO").is_err());

        assert_eq!(
            Command::try_from("EHLO Testing things"),
            Ok(Command::Helo(HeloVariant::Ehlo(String::from(
                "Testing things"
            ))))
        );

        assert_eq!(
            Command::try_from("HELO Testing things"),
            Ok(Command::Helo(HeloVariant::Helo(String::from(
                "Testing things"
            ))))
        );

        for comm in string_casing("ehlo") {
            assert!(matches!(
                Command::try_from(format!("{comm} test")),
                Ok(Command::Helo(HeloVariant::Ehlo(_)))
            ));
        }

        for comm in string_casing("helo") {
            assert!(matches!(
                Command::try_from(format!("{comm} test")),
                Ok(Command::Helo(HeloVariant::Helo(_))),
            ));
        }
    }

    #[test]
    fn bdat_command() {
        assert_eq!(Command::try_from("BDAT 1024"), Ok(Command::Bdat(1024, false)));
        assert_eq!(
            Command::try_from("BDAT 0 LAST"),
            Ok(Command::Bdat(0, true))
        );
        assert!(Command::try_from("BDAT abc").is_err());
    }

    #[test]
    fn auth_command() {
        assert_eq!(
            Command::try_from("AUTH PLAIN"),
            Ok(Command::Auth(AuthMechanism::Plain, None))
        );
        assert_eq!(
            Command::try_from("AUTH LOGIN"),
            Ok(Command::Auth(AuthMechanism::Login, None))
        );
        assert_eq!(
            Command::try_from("AUTH PLAIN AGFsaWNlAGFsaWNlAHNlY3JldA=="),
            Ok(Command::Auth(
                AuthMechanism::Plain,
                Some("AGFsaWNlAGFsaWNlAHNlY3JldA==".to_string())
            ))
        );
        assert!(Command::try_from("AUTH KERBEROS").is_err());
    }

    #[test]
    fn other_commands() {
        assert_eq!(Command::try_from("DATA"), Ok(Command::Data));
        for comm in string_casing("data") {
            assert_eq!(Command::try_from(comm), Ok(Command::Data));
        }

        assert_eq!(Command::try_from("QUIT"), Ok(Command::Quit));
        for comm in string_casing("quit") {
            assert_eq!(Command::try_from(comm), Ok(Command::Quit));
        }

        assert_eq!(Command::try_from("STARTTLS"), Ok(Command::StartTLS));
        for comm in string_casing("starttls") {
            assert_eq!(Command::try_from(comm), Ok(Command::StartTLS));
        }

        assert_eq!(Command::try_from("RSET"), Ok(Command::Rset));
        for comm in string_casing("rset") {
            assert_eq!(Command::try_from(comm), Ok(Command::Rset));
        }

        assert_eq!(Command::try_from("HELP"), Ok(Command::Help));
        for comm in string_casing("help") {
            assert_eq!(Command::try_from(comm), Ok(Command::Help));
        }
    }
}
