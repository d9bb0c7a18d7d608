pub mod address;
pub mod address_parser;
pub mod audit;
pub mod config;
pub mod context;
pub mod controller;
pub mod delivery;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod ffi;
pub mod listener;
pub mod logging;
pub mod message;
pub mod mime;
pub mod status;
pub mod traits;

pub use delivery::{DeliveryAttempt, DeliveryContext, DeliveryStatus};
pub use domain::Domain;
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
