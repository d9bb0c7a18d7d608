use empath_common::{context, status::Status, tracing};
use empath_tracing::traced;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    State,
    interceptor::{Decision, Stage},
    session::Session,
    state,
    transaction_handler::SmtpTransactionHandler,
};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    /// Handle validation and work for each state using SMTP transaction handler
    ///
    /// This delegates to the `SmtpTransactionHandler` trait which provides separation
    /// between protocol concerns (FSM) and business concerns (validation, spooling).
    ///
    /// Flow:
    /// 1. The in-process interceptor chain runs first for `MAIL`/`RCPT`/`DATA` and
    ///    can deny or drop the command before a module is ever dispatched.
    /// 2. `SmtpTransactionHandler` dispatches to modules for validation.
    /// 3. If validation passes, `SmtpTransactionHandler` performs work (spooling, audit).
    /// 4. State transitions happen separately in FSM layer.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing)]
    pub(super) async fn emit(&mut self, validate_context: &mut context::Context) {
        let stage = match self.context.state {
            State::MailFrom(_) => Some(Stage::Mail),
            State::RcptTo(_) => Some(Stage::Rcpt),
            State::PostDot(_) => Some(Stage::Data),
            _ => None,
        };

        let mut valid = true;
        let mut dropped = false;

        if let Some(stage) = stage {
            match self.interceptors.run(stage, validate_context) {
                Decision::Proceed => {}
                Decision::Deny(status, message) => {
                    validate_context.respond(status, message);
                    valid = false;
                }
                Decision::Drop => {
                    validate_context.respond(Status::Error, "Connection terminated");
                    valid = false;
                    dropped = true;
                }
            }
        }

        if valid {
            valid = match self.context.state {
                State::Connect(_) => {
                    self.transaction_handler
                        .validate_connect(validate_context)
                        .await
                }
                State::Helo(_) | State::Ehlo(_) => {
                    self.transaction_handler
                        .validate_ehlo(validate_context)
                        .await
                }
                State::MailFrom(_) => {
                    self.transaction_handler
                        .validate_mail_from(validate_context)
                        .await
                }
                State::RcptTo(_) => {
                    self.transaction_handler
                        .validate_rcpt_to(validate_context)
                        .await
                }
                State::PostDot(_) => {
                    self.transaction_handler
                        .handle_message(validate_context)
                        .await
                }
                _ => return, // No validation needed for other states
            };
        }

        if dropped {
            self.context.state = State::Close(state::Close);
            return;
        }

        // Update session state based on validation result
        if !valid {
            match self.context.state {
                // Only reject on critical failures (Connect, EHLO, RCPT TO)
                // MAIL FROM failures don't reject - they just return error
                State::Connect(_) | State::Ehlo(_) | State::Helo(_) | State::RcptTo(_) => {
                    self.context.state = State::Reject(state::Reject);
                }
                _ => {
                    // For other states, let the response speak for itself
                }
            }
        }
    }
}
