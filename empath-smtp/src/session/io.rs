use std::borrow::Cow;

use base64::Engine;
use empath_common::{
    context, error::SessionError, internal, status::Status, traits::fsm::FiniteStateMachine,
    tracing,
};
use empath_tracing::traced;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    State,
    auth::{self, PENDING_USERNAME_KEY},
    command::{AuthMechanism, Command},
    framer::Frame,
    session_state::SessionState,
    state,
};

use super::{Context, Session};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    /// Receive and process data from the client
    ///
    /// Returns `Ok(true)` if the connection should be closed, `Ok(false)` to continue.
    ///
    /// # Errors
    /// Returns `SessionError` if there's a protocol error or I/O failure.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, ret), timing)]
    pub(super) async fn receive(
        &mut self,
        validate_context: &mut context::Context,
    ) -> Result<bool, SessionError> {
        let mut received_data = [0; 4096];

        match self.connection.receive(&mut received_data).await {
            // Consider any errors received here to be fatal
            Err(err) => {
                internal!("Error: {err}");
                Err(SessionError::Protocol(err.to_string()))
            }
            Ok(0) => {
                // Reading 0 bytes means the other side has closed the
                // connection or is done writing, then so are we.
                Ok(true)
            }
            Ok(bytes_read) => {
                self.framer.push(&received_data[..bytes_read]);

                loop {
                    let frame = self.framer.next_frame().map_err(|err| {
                        internal!("Framing error: {err}");
                        SessionError::Protocol(err.to_string())
                    })?;

                    let Some(frame) = frame else { break };

                    match frame {
                        Frame::Line(line) => {
                            if matches!(self.context.state, State::Reading(_)) {
                                self.handle_data_line(&line, validate_context);
                            } else {
                                self.handle_command_reception(&line, validate_context);
                            }
                        }
                        Frame::Bytes(chunk) => {
                            self.handle_bdat_chunk(chunk, validate_context);
                        }
                    }
                }

                Ok(false)
            }
        }
    }

    /// Handle reception of one line of message data (during DATA state),
    /// undoing dot-stuffing (RFC 5321 Section 4.5.2) and recognising the
    /// lone-dot terminator.
    fn handle_data_line(&mut self, line: &str, validate_context: &mut context::Context) {
        if line == "." {
            self.complete_message(validate_context);
            return;
        }

        let unstuffed = line.strip_prefix('.').unwrap_or(line);

        if self.max_message_size > 0 {
            let total_size = self
                .context
                .message
                .len()
                .saturating_add(unstuffed.len())
                .saturating_add(2);

            if total_size > self.max_message_size {
                validate_context.response = Some((
                    Status::ExceededStorage,
                    Cow::Owned(format!(
                        "Actual message size {total_size} bytes exceeds maximum allowed size {} bytes",
                        self.max_message_size
                    )),
                ));
                self.context.state = State::Close(state::Close);
                self.context.sent = false;
                return;
            }
        }

        self.context.message.extend_from_slice(unstuffed.as_bytes());
        self.context.message.extend_from_slice(b"\r\n");
    }

    /// Handle one `BDAT` chunk's raw bytes, releasing the inflight budget
    /// reserved for it when the `BDAT` command line was parsed.
    fn handle_bdat_chunk(&mut self, chunk: Vec<u8>, validate_context: &mut context::Context) {
        self.backpressure.release_inflight(chunk.len());

        if self.max_message_size > 0 {
            let total_size = self
                .context
                .message
                .len()
                .saturating_add(chunk.len());

            if total_size > self.max_message_size {
                validate_context.response = Some((
                    Status::ExceededStorage,
                    Cow::Owned(format!(
                        "Actual message size {total_size} bytes exceeds maximum allowed size {} bytes",
                        self.max_message_size
                    )),
                ));
                self.context.state = State::Close(state::Close);
                self.context.sent = false;
                return;
            }
        }

        self.context.message.extend_from_slice(&chunk);

        let last = matches!(self.context.state, State::Bdat(state::Bdat { last: true }));
        if last {
            self.complete_message(validate_context);
        } else {
            // Acknowledge this chunk; the session stays in Bdat awaiting the
            // next BDAT command line.
            self.context.sent = false;
        }
    }

    /// Finish the transaction once the end-of-data marker (`.` or a `BDAT
    /// LAST`) has been seen: hand the accumulated body to the validation
    /// layer and move to `PostDot`.
    fn complete_message(&mut self, validate_context: &mut context::Context) {
        self.framer.exit_data_mode();
        let message = std::mem::take(&mut self.context.message);

        self.context = Context {
            state: State::PostDot(state::PostDot),
            message: message.clone(),
            sent: false,
        };

        validate_context.data = Some(message.into());
    }

    /// Handle reception of SMTP commands
    fn handle_command_reception(&mut self, line: &str, validate_context: &mut context::Context) {
        use empath_common::incoming;

        let command = if self.context.state.awaiting_auth_continuation() {
            // A SASL continuation line is a raw base64 blob, not a command
            // the grammar in `Command::try_from` understands.
            Command::AuthContinuation(line.to_string())
        } else {
            Command::try_from(line).unwrap_or_else(|e| e)
        };

        if matches!(command, Command::Auth(..) | Command::AuthContinuation(_)) {
            incoming!("{command}");
            self.handle_auth_command(command, validate_context);
            return;
        }

        let message = command.inner().as_bytes().to_vec();
        let bdat_size = if let Command::Bdat(size, _) = &command {
            Some(*size)
        } else {
            None
        };

        incoming!("{command}");

        // The FSM only ever touches protocol state (client id, ESMTP mode,
        // envelope); bridge it in and out of the business context so
        // transaction handlers keep seeing a single `Context`.
        let mut session_state = SessionState::from_context(validate_context);
        let new_state = self
            .context
            .state
            .clone()
            .transition(command, &mut session_state);
        session_state.sync_to_context(validate_context);

        if let (State::Bdat(_), Some(size)) = (&new_state, bdat_size) {
            if !self.backpressure.try_reserve_inflight(size) {
                validate_context.response = Some((
                    Status::Unavailable,
                    Cow::Borrowed("Insufficient resources to accept this BDAT chunk"),
                ));
                self.context = Context {
                    state: State::Reject(state::Reject),
                    message: Vec::new(),
                    sent: false,
                };
                return;
            }

            if let Err(err) = self.framer.begin_bytes(size) {
                validate_context.response =
                    Some((Status::SyntaxErrorInParameters, Cow::Owned(err.to_string())));
                self.backpressure.release_inflight(size);
                self.context = Context {
                    state: State::Reject(state::Reject),
                    message: Vec::new(),
                    sent: false,
                };
                return;
            }
        }

        self.context = Context {
            state: new_state,
            message,
            sent: false,
        };

        tracing::debug!("Transitioned to {:#?}", self.context);
    }

    /// Handle `AUTH <mechanism> [initial-response]` and its SASL continuation
    /// lines. Kept separate from `handle_command_reception` because the
    /// exchange needs multi-step bookkeeping (pending username, rate-limit
    /// checks) that the rest of the command set doesn't.
    fn handle_auth_command(&mut self, command: Command, validate_context: &mut context::Context) {
        match command {
            Command::Auth(mechanism, initial) => self.begin_auth(mechanism, initial, validate_context),
            Command::AuthContinuation(line) => self.continue_auth(line, validate_context),
            _ => unreachable!("handle_auth_command is only called for Auth/AuthContinuation"),
        }
    }

    fn begin_auth(
        &mut self,
        mechanism: AuthMechanism,
        initial: Option<String>,
        validate_context: &mut context::Context,
    ) {
        if !self.auth_service.enabled() {
            validate_context.response = Some((
                Status::CommandNotImplemented,
                Cow::Borrowed("AUTH not supported"),
            ));
            return;
        }

        let mut session_state = SessionState::from_context(validate_context);
        let authenticating = self.context.state.clone().transition(
            Command::Auth(mechanism, initial.clone()),
            &mut session_state,
        );
        session_state.sync_to_context(validate_context);
        self.context = Context {
            state: authenticating,
            message: Vec::new(),
            sent: false,
        };

        match (mechanism, initial) {
            (AuthMechanism::Plain, Some(response)) => {
                // Initial response supplied: complete in this round-trip,
                // no continuation line needed.
                self.continue_auth(response, validate_context);
            }
            (AuthMechanism::Plain, None) => {
                validate_context.response = Some((Status::AuthContinue, Cow::Borrowed("")));
            }
            (AuthMechanism::Login, _) => {
                let prompt = base64::engine::general_purpose::STANDARD.encode("Username:");
                validate_context.response = Some((Status::AuthContinue, Cow::Owned(prompt)));
            }
        }
    }

    fn continue_auth(&mut self, line: String, validate_context: &mut context::Context) {
        let State::Authenticating(state) = self.context.state.clone() else {
            validate_context.response = Some((
                Status::InvalidCommandSequence,
                Cow::Borrowed("Not awaiting an AUTH continuation"),
            ));
            return;
        };

        if state.mechanism == AuthMechanism::Login && state.step == 0 {
            let Ok(username) = auth::decode_login_field(&line) else {
                self.fail_auth_syntax(validate_context);
                return;
            };
            validate_context
                .metadata
                .insert(PENDING_USERNAME_KEY.to_string(), username);
            self.advance_auth_state(line, validate_context);

            let prompt = base64::engine::general_purpose::STANDARD.encode("Password:");
            validate_context.response = Some((Status::AuthContinue, Cow::Owned(prompt)));
            return;
        }

        let credentials = if state.mechanism == AuthMechanism::Plain {
            auth::decode_plain(&line)
        } else {
            auth::decode_login_field(&line).map(|password| {
                let username = validate_context
                    .metadata
                    .remove(PENDING_USERNAME_KEY)
                    .unwrap_or_default();
                (username, password)
            })
        };

        let Ok((username, password)) = credentials else {
            self.fail_auth_syntax(validate_context);
            return;
        };

        self.advance_auth_state(line, validate_context);
        self.finish_auth(&username, &password, validate_context);
    }

    /// Drive the FSM's `AuthContinuation` transition, which always returns
    /// to `Ehlo`/`Helo` once the last expected step for the mechanism is
    /// reached, regardless of whether the credentials check out.
    fn advance_auth_state(&mut self, line: String, validate_context: &mut context::Context) {
        let mut session_state = SessionState::from_context(validate_context);
        let next = self
            .context
            .state
            .clone()
            .transition(Command::AuthContinuation(line), &mut session_state);
        session_state.sync_to_context(validate_context);
        self.context = Context {
            state: next,
            message: Vec::new(),
            sent: false,
        };
    }

    fn fail_auth_syntax(&mut self, validate_context: &mut context::Context) {
        self.advance_auth_state(String::new(), validate_context);
        validate_context.response = Some((
            Status::SyntaxErrorInParameters,
            Cow::Borrowed("Invalid base64 in AUTH response"),
        ));
    }

    /// Check the rate limiter, verify credentials and record the outcome.
    /// Locked accounts are rejected without consuming a failure credit.
    fn finish_auth(&mut self, username: &str, password: &str, validate_context: &mut context::Context) {
        let peer = self.peer.to_string();
        let now = auth::AuthRateLimiter::now();

        if self.auth_limiter.is_locked(username, &peer, now).is_some() {
            validate_context.response = Some((
                Status::AuthenticationFailed,
                Cow::Borrowed("Authentication credentials invalid"),
            ));
            return;
        }

        if self.auth_service.verify(username, password) {
            self.auth_limiter.record_success(username, &peer);
            validate_context.authenticated = true;
            validate_context.authenticated_username = Some(username.to_string());
            validate_context.response = Some((
                Status::AuthenticationSuccessful,
                Cow::Borrowed("Authentication successful"),
            ));
        } else {
            self.auth_limiter.record_failure(username, &peer, now);
            validate_context.response = Some((
                Status::AuthenticationFailed,
                Cow::Borrowed("Authentication credentials invalid"),
            ));
        }
    }
}
