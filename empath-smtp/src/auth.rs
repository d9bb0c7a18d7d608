//! `AUTH` (RFC 4954) credential decoding and brute-force rate limiting.
//!
//! Lockout state is keyed by `(username, peer address)` rather than just the
//! connection, since a brute-force attempt against one account is usually
//! spread across many short-lived connections from the same attacker.

use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::Engine;
use dashmap::DashMap;
use thiserror::Error;

/// Verifies `AUTH` credentials. Backend-agnostic: a production deployment
/// might back this with a password database, an LDAP bind, or an HTTP call.
pub trait AuthService: Send + Sync + std::fmt::Debug {
    /// Whether `AUTH` is offered to clients at all.
    fn enabled(&self) -> bool;

    /// Whether a session must authenticate before `MAIL FROM` is accepted.
    fn required(&self) -> bool;

    /// Check a decoded username/password pair.
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// In-process `AuthService` backed by a static username/password map, or by a
/// pluggable verifier closure for callers that want to bind to an external
/// store without implementing the trait themselves.
pub struct InProcessAuthService {
    enabled: bool,
    required: bool,
    verifier: Box<dyn Fn(&str, &str) -> bool + Send + Sync>,
}

impl std::fmt::Debug for InProcessAuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessAuthService")
            .field("enabled", &self.enabled)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

impl InProcessAuthService {
    /// An `AuthService` backed by a plaintext username/password map.
    #[must_use]
    pub fn with_credentials(enabled: bool, required: bool, credentials: HashMap<String, String>) -> Self {
        Self {
            enabled,
            required,
            verifier: Box::new(move |username, password| {
                credentials.get(username).is_some_and(|expected| expected == password)
            }),
        }
    }

    /// An `AuthService` backed by a caller-supplied verification closure.
    #[must_use]
    pub fn with_verifier(
        enabled: bool,
        required: bool,
        verifier: impl Fn(&str, &str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            enabled,
            required,
            verifier: Box::new(verifier),
        }
    }
}

impl Default for InProcessAuthService {
    /// `AUTH` disabled, nothing verifies successfully. Callers that want
    /// `AUTH` must opt in with real credentials or a verifier.
    fn default() -> Self {
        Self::with_credentials(false, false, HashMap::new())
    }
}

impl AuthService for InProcessAuthService {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn required(&self) -> bool {
        self.required
    }

    fn verify(&self, username: &str, password: &str) -> bool {
        (self.verifier)(username, password)
    }
}

/// `Context::metadata` key holding the username decoded from an `AUTH LOGIN`
/// first continuation line, stashed until the password arrives on the
/// second.
pub const PENDING_USERNAME_KEY: &str = "auth.pending_username";

/// Consecutive failures allowed before a `(username, peer)` pair is locked out.
const DEFAULT_MAX_FAILURES: u32 = 5;

/// How long a lockout lasts once triggered.
const DEFAULT_LOCKOUT_SECS: u64 = 300;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthDecodeError {
    #[error("invalid base64 in AUTH response")]
    InvalidBase64,
    #[error("invalid PLAIN response: expected authzid\\0authcid\\0passwd")]
    MalformedPlain,
    #[error("invalid UTF-8 in decoded AUTH response")]
    InvalidUtf8,
}

/// Decode a `AUTH PLAIN` response (RFC 4616): base64 of
/// `authzid NUL authcid NUL passwd`. Returns `(authcid, passwd)`; the
/// authorization identity is accepted but not surfaced, since this server
/// doesn't support acting-as-another-identity.
pub fn decode_plain(response: &str) -> Result<(String, String), AuthDecodeError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(response.trim())
        .map_err(|_| AuthDecodeError::InvalidBase64)?;

    let mut parts = raw.split(|&b| b == 0);
    let _authzid = parts.next().ok_or(AuthDecodeError::MalformedPlain)?;
    let authcid = parts.next().ok_or(AuthDecodeError::MalformedPlain)?;
    let passwd = parts.next().ok_or(AuthDecodeError::MalformedPlain)?;
    if parts.next().is_some() {
        return Err(AuthDecodeError::MalformedPlain);
    }

    Ok((
        String::from_utf8(authcid.to_vec()).map_err(|_| AuthDecodeError::InvalidUtf8)?,
        String::from_utf8(passwd.to_vec()).map_err(|_| AuthDecodeError::InvalidUtf8)?,
    ))
}

/// Decode a single base64 `AUTH LOGIN` continuation line (username or password).
pub fn decode_login_field(response: &str) -> Result<String, AuthDecodeError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(response.trim())
        .map_err(|_| AuthDecodeError::InvalidBase64)?;
    String::from_utf8(raw).map_err(|_| AuthDecodeError::InvalidUtf8)
}

#[derive(Debug, Clone, Copy, Default)]
struct Attempt {
    failures: u32,
    locked_until: Option<u64>,
}

/// Tracks consecutive `AUTH` failures per `(username, peer)` and locks the
/// pair out once they cross a threshold.
#[derive(Debug)]
pub struct AuthRateLimiter {
    attempts: DashMap<String, Attempt>,
    max_failures: u32,
    lockout_secs: u64,
}

impl Default for AuthRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FAILURES, DEFAULT_LOCKOUT_SECS)
    }
}

impl AuthRateLimiter {
    #[must_use]
    pub fn new(max_failures: u32, lockout_secs: u64) -> Self {
        Self {
            attempts: DashMap::new(),
            max_failures,
            lockout_secs,
        }
    }

    fn key(username: &str, peer: &str) -> String {
        format!("{}\0{peer}", username.to_lowercase())
    }

    #[must_use]
    pub fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }

    /// Whether `(username, peer)` is currently locked out; returns the unix
    /// timestamp the lockout expires at, if so.
    #[must_use]
    pub fn is_locked(&self, username: &str, peer: &str, now: u64) -> Option<u64> {
        self.attempts
            .get(&Self::key(username, peer))
            .and_then(|entry| entry.locked_until)
            .filter(|&until| until > now)
    }

    /// Record a failed `AUTH` attempt, returning the lockout deadline if this
    /// failure tripped the threshold.
    pub fn record_failure(&self, username: &str, peer: &str, now: u64) -> Option<u64> {
        let mut entry = self.attempts.entry(Self::key(username, peer)).or_default();
        entry.failures += 1;
        if entry.failures >= self.max_failures {
            let until = now + self.lockout_secs;
            entry.locked_until = Some(until);
            Some(until)
        } else {
            None
        }
    }

    /// Clear failure state for `(username, peer)` after a successful `AUTH`.
    pub fn record_success(&self, username: &str, peer: &str) {
        self.attempts.remove(&Self::key(username, peer));
    }

    /// Drop entries that are neither locked nor currently failing, to keep
    /// the map from growing unbounded over the server's lifetime.
    pub fn cleanup(&self, now: u64) {
        self.attempts
            .retain(|_, entry| entry.locked_until.is_some_and(|until| until > now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_plain_response() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"\0alice\0hunter2");
        let (user, pass) = decode_plain(&encoded).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "hunter2");
    }

    #[test]
    fn rejects_a_plain_response_missing_a_field() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"\0alice");
        assert_eq!(decode_plain(&encoded), Err(AuthDecodeError::MalformedPlain));
    }

    #[test]
    fn decodes_a_login_field() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"alice");
        assert_eq!(decode_login_field(&encoded).unwrap(), "alice");
    }

    #[test]
    fn rejects_invalid_base64() {
        assert_eq!(decode_login_field("not valid base64!!"), Err(AuthDecodeError::InvalidBase64));
    }

    #[test]
    fn locks_out_after_the_failure_threshold() {
        let limiter = AuthRateLimiter::new(3, 60);
        assert!(limiter.is_locked("alice", "1.2.3.4", 0).is_none());
        assert!(limiter.record_failure("alice", "1.2.3.4", 0).is_none());
        assert!(limiter.record_failure("alice", "1.2.3.4", 0).is_none());
        let until = limiter.record_failure("alice", "1.2.3.4", 0).unwrap();
        assert_eq!(until, 60);
        assert_eq!(limiter.is_locked("alice", "1.2.3.4", 0), Some(60));
        assert!(limiter.is_locked("alice", "1.2.3.4", 61).is_none());
    }

    #[test]
    fn success_clears_failure_count() {
        let limiter = AuthRateLimiter::new(3, 60);
        limiter.record_failure("alice", "1.2.3.4", 0);
        limiter.record_failure("alice", "1.2.3.4", 0);
        limiter.record_success("alice", "1.2.3.4");
        assert!(limiter.record_failure("alice", "1.2.3.4", 0).is_none());
    }

    #[test]
    fn lockouts_are_scoped_per_peer() {
        let limiter = AuthRateLimiter::new(1, 60);
        limiter.record_failure("alice", "1.2.3.4", 0);
        assert!(limiter.is_locked("alice", "1.2.3.4", 0).is_some());
        assert!(limiter.is_locked("alice", "5.6.7.8", 0).is_none());
    }

    #[test]
    fn cleanup_drops_expired_lockouts() {
        let limiter = AuthRateLimiter::new(1, 60);
        limiter.record_failure("alice", "1.2.3.4", 0);
        limiter.cleanup(61);
        assert!(limiter.attempts.is_empty());
    }

    #[test]
    fn default_auth_service_rejects_everything() {
        let service = InProcessAuthService::default();
        assert!(!service.enabled());
        assert!(!service.verify("alice", "hunter2"));
    }

    #[test]
    fn credential_map_verifies_matching_passwords_only() {
        let mut creds = HashMap::new();
        creds.insert("alice".to_string(), "hunter2".to_string());
        let service = InProcessAuthService::with_credentials(true, false, creds);
        assert!(service.verify("alice", "hunter2"));
        assert!(!service.verify("alice", "wrong"));
        assert!(!service.verify("bob", "hunter2"));
    }

    #[test]
    fn verifier_closure_backend_is_used() {
        let service = InProcessAuthService::with_verifier(true, true, |u, p| u == "svc" && p == "token");
        assert!(service.required());
        assert!(service.verify("svc", "token"));
        assert!(!service.verify("svc", "wrong"));
    }
}
