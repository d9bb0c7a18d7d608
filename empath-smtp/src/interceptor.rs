//! In-process command interceptor chain.
//!
//! Runs ahead of [`crate::transaction_handler::SmtpTransactionHandler`] for
//! the three transaction-entry commands (`MAIL`, `RCPT`, `DATA`) and can
//! short-circuit them before a module is ever dispatched. This is
//! deliberately separate from the FFI module system: interceptors are
//! in-process, synchronous, and exist for invariants the server itself wants
//! to hold regardless of what plugins are loaded.

use std::borrow::Cow;

use empath_common::{context::Context, status::Status};

/// Which transaction-entry command is being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Mail,
    Rcpt,
    Data,
}

/// The outcome of running a stage through the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Allow the command to proceed to the transaction handler.
    Proceed,
    /// Reject the command with a specific SMTP status and message; the
    /// session keeps running.
    Deny(Status, Cow<'static, str>),
    /// Reject the command and close the connection outright.
    Drop,
}

/// A single policy check run against one [`Stage`].
pub trait Interceptor: Send + Sync {
    fn intercept(&self, stage: Stage, ctx: &mut Context) -> Decision;
}

/// An ordered list of [`Interceptor`]s; the first non-[`Decision::Proceed`]
/// wins.
#[derive(Default)]
pub struct InterceptorChain {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl InterceptorChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Box::new(interceptor));
        self
    }

    /// Run every interceptor for `stage` in order, stopping at the first
    /// decision that isn't [`Decision::Proceed`].
    pub fn run(&self, stage: Stage, ctx: &mut Context) -> Decision {
        for interceptor in &self.interceptors {
            match interceptor.intercept(stage, ctx) {
                Decision::Proceed => {}
                decision => return decision,
            }
        }
        Decision::Proceed
    }
}

/// Key used in [`Context::metadata`] to remember that `MAIL FROM` has been
/// accepted for the transaction in progress, so `RCPT TO` can tell a real
/// `MAIL FROM:<>` (null sender, still a valid transaction) apart from never
/// having seen one at all.
const MAIL_FROM_SEEN_KEY: &str = "interceptor.mail_from_seen";

/// The core preconditions every deployment enforces, independent of any
/// loaded module: `MAIL` requires a greeted (and optionally authenticated)
/// session, `RCPT` requires a `MAIL FROM` already accepted this transaction,
/// and `DATA` requires at least one recipient.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreInterceptor {
    /// Whether `MAIL FROM` requires a successfully authenticated session.
    pub require_auth_for_mail: bool,
}

impl CoreInterceptor {
    #[must_use]
    pub const fn new(require_auth_for_mail: bool) -> Self {
        Self { require_auth_for_mail }
    }
}

impl Interceptor for CoreInterceptor {
    fn intercept(&self, stage: Stage, ctx: &mut Context) -> Decision {
        match stage {
            Stage::Mail => {
                if self.require_auth_for_mail && !(ctx.tls_active && ctx.authenticated) {
                    return Decision::Deny(
                        Status::AuthenticationRequired,
                        Cow::Borrowed("Authentication required before MAIL"),
                    );
                }
                ctx.metadata.insert(MAIL_FROM_SEEN_KEY.to_string(), "1".to_string());
                Decision::Proceed
            }
            Stage::Rcpt => {
                if ctx.metadata.contains_key(MAIL_FROM_SEEN_KEY) {
                    Decision::Proceed
                } else {
                    Decision::Deny(
                        Status::InvalidCommandSequence,
                        Cow::Borrowed("RCPT TO requires MAIL FROM first"),
                    )
                }
            }
            Stage::Data => {
                if ctx.recipients().is_empty() {
                    Decision::Deny(
                        Status::InvalidCommandSequence,
                        Cow::Borrowed("DATA requires at least one recipient"),
                    )
                } else {
                    Decision::Proceed
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::new("test")
    }

    #[test]
    fn mail_proceeds_without_auth_by_default() {
        let chain = InterceptorChain::new().with(CoreInterceptor::default());
        let mut ctx = ctx();
        assert_eq!(chain.run(Stage::Mail, &mut ctx), Decision::Proceed);
    }

    #[test]
    fn mail_denied_when_auth_required_and_missing() {
        let chain = InterceptorChain::new().with(CoreInterceptor::new(true));
        let mut ctx = ctx();
        assert!(matches!(
            chain.run(Stage::Mail, &mut ctx),
            Decision::Deny(Status::AuthenticationRequired, _)
        ));
    }

    #[test]
    fn mail_proceeds_when_auth_required_and_present() {
        let chain = InterceptorChain::new().with(CoreInterceptor::new(true));
        let mut ctx = ctx();
        ctx.authenticated = true;
        ctx.tls_active = true;
        assert_eq!(chain.run(Stage::Mail, &mut ctx), Decision::Proceed);
    }

    #[test]
    fn mail_denied_when_authenticated_but_not_over_tls() {
        let chain = InterceptorChain::new().with(CoreInterceptor::new(true));
        let mut ctx = ctx();
        ctx.authenticated = true;
        assert!(matches!(
            chain.run(Stage::Mail, &mut ctx),
            Decision::Deny(Status::AuthenticationRequired, _)
        ));
    }

    #[test]
    fn rcpt_denied_without_a_prior_mail_from() {
        let chain = InterceptorChain::new().with(CoreInterceptor::default());
        let mut ctx = ctx();
        assert!(matches!(
            chain.run(Stage::Rcpt, &mut ctx),
            Decision::Deny(Status::InvalidCommandSequence, _)
        ));
    }

    #[test]
    fn rcpt_proceeds_after_mail_from_including_null_sender() {
        let chain = InterceptorChain::new().with(CoreInterceptor::default());
        let mut ctx = ctx();
        assert_eq!(chain.run(Stage::Mail, &mut ctx), Decision::Proceed);
        assert_eq!(chain.run(Stage::Rcpt, &mut ctx), Decision::Proceed);
    }

    #[test]
    fn data_denied_without_recipients() {
        let chain = InterceptorChain::new().with(CoreInterceptor::default());
        let mut ctx = ctx();
        assert!(matches!(
            chain.run(Stage::Data, &mut ctx),
            Decision::Deny(Status::InvalidCommandSequence, _)
        ));
    }

    #[test]
    fn data_proceeds_with_a_recipient() {
        use empath_common::address::AddressList;

        let chain = InterceptorChain::new().with(CoreInterceptor::default());
        let mut ctx = ctx();
        let rcpt: AddressList = mailparse::addrparse("a@b.com").unwrap().into();
        *ctx.envelope.recipients_mut() = Some(rcpt);
        assert_eq!(chain.run(Stage::Data, &mut ctx), Decision::Proceed);
    }
}
