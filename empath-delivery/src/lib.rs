//! Delivery queue and processor for handling outbound mail from the spool
//!
//! This crate provides the outbound relay pipeline for Empath:
//! - Tracking messages pending delivery in a concurrent [`queue::DeliveryQueue`]
//! - Resolving MX servers and applying per-domain policy via [`policy`]
//! - Executing SMTP transactions and handling retries/failures via [`processor`]
//! - Per-domain rate limiting and circuit breaking to protect remote servers
//! - DSN (bounce) generation for permanently failed messages

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod circuit_breaker;
pub mod dns;
pub mod domain_config;
pub mod dsn;
pub mod error;
pub mod policy;
pub mod processor;
pub mod queue;
pub mod rate_limiter;
pub mod service;
pub mod smtp_transaction;
pub mod trigger;
pub mod types;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use dns::{DnsConfig, DnsError, DnsResolver, HickoryDnsResolver, MailServer, MockDnsResolver};
pub use domain_config::{DomainConfig, DomainConfigRegistry};
pub use dsn::DsnConfig;
pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use processor::DeliveryProcessor;
pub use queue::DeliveryQueue;
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use service::DeliveryQueryService;
pub use smtp_transaction::SmtpTransaction;
pub use trigger::{TriggerCoalescer, TriggerOutcome, TriggerScope};
pub use types::{DeliveryInfo, SmtpTimeouts};
