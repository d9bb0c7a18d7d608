use core::fmt::{self, Display, Formatter};

#[repr(C, u32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    ConnectionError = 101,
    #[allow(clippy::enum_variant_names)]
    SystemStatus = 211,
    HelpMessage = 215,
    ServiceReady = 220,
    GoodBye = 221,
    AuthenticationSuccessful = 235,
    Ok = 250,
    StartMailInput = 354,
    AuthContinue = 334,
    Unavailable = 421,
    ActionUnavailable = 451,
    TlsNotAvailable = 454,
    SyntaxError = 500,
    SyntaxErrorInParameters = 501,
    CommandNotImplemented = 502,
    InvalidCommandSequence = 503,
    AuthenticationRequired = 530,
    AuthenticationFailed = 535,
    Error = 550,
    ExceededStorage = 552,
    TransactionFailed = 554,
    Unknown(u32),
}

impl Status {
    /// Checks if the status is a permanent rejection
    #[must_use]
    pub fn is_permanent(self) -> bool {
        u32::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    #[must_use]
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&u32::from(self))
    }
}

impl From<u32> for Status {
    fn from(value: u32) -> Self {
        match value {
            101 => Self::ConnectionError,
            211 => Self::SystemStatus,
            215 => Self::HelpMessage,
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            235 => Self::AuthenticationSuccessful,
            250 => Self::Ok,
            354 => Self::StartMailInput,
            334 => Self::AuthContinue,
            421 => Self::Unavailable,
            451 => Self::ActionUnavailable,
            454 => Self::TlsNotAvailable,
            500 => Self::SyntaxError,
            501 => Self::SyntaxErrorInParameters,
            502 => Self::CommandNotImplemented,
            503 => Self::InvalidCommandSequence,
            530 => Self::AuthenticationRequired,
            535 => Self::AuthenticationFailed,
            550 => Self::Error,
            552 => Self::ExceededStorage,
            554 => Self::TransactionFailed,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        match value {
            Status::ConnectionError => 101,
            Status::SystemStatus => 211,
            Status::HelpMessage => 215,
            Status::ServiceReady => 220,
            Status::GoodBye => 221,
            Status::AuthenticationSuccessful => 235,
            Status::Ok => 250,
            Status::StartMailInput => 354,
            Status::AuthContinue => 334,
            Status::Unavailable => 421,
            Status::ActionUnavailable => 451,
            Status::TlsNotAvailable => 454,
            Status::SyntaxError => 500,
            Status::SyntaxErrorInParameters => 501,
            Status::CommandNotImplemented => 502,
            Status::InvalidCommandSequence => 503,
            Status::AuthenticationRequired => 530,
            Status::AuthenticationFailed => 535,
            Status::Error => 550,
            Status::ExceededStorage => 552,
            Status::TransactionFailed => 554,
            Status::Unknown(v) => v,
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u32::from(*self))
    }
}

#[cfg(test)]
mod test {
    use super::Status;

    #[test]
    fn status() {
        assert!(Status::Error.is_permanent());
        assert!(!Status::Error.is_temporary());

        assert!(Status::Unavailable.is_temporary());
        assert!(!Status::Unavailable.is_permanent());

        assert_eq!(Status::from(550), Status::Error);
        assert_eq!(u32::from(Status::Error), 550);
    }

    #[test]
    fn auth_codes_round_trip() {
        assert_eq!(Status::from(530), Status::AuthenticationRequired);
        assert_eq!(Status::from(535), Status::AuthenticationFailed);
        assert!(Status::AuthenticationFailed.is_permanent());
    }

    #[test]
    fn unknown_preserves_value() {
        assert_eq!(u32::from(Status::from(999)), 999);
    }
}
