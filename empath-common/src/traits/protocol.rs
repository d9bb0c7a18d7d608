use std::{fmt::Debug, net::SocketAddr};

use serde::Deserialize;
use tokio::{net::TcpStream, sync::broadcast::Receiver};

use crate::Signal;

pub trait SessionHandler {
    fn run(
        self,
        shutdown: Receiver<Signal>,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// A protocol binds a wire handler to a `Listener`: given an accepted
/// connection, produce a session the listener can drive to completion.
pub trait Protocol: Default + Send + Sync {
    type Session: SessionHandler + Send + Sync + 'static;
    type Context: Default + Clone + Debug + Send + Sync + for<'a> Deserialize<'a>;
    type ExtraArgs;

    /// A short, stable name used in logs to identify which protocol a
    /// controller/listener pair is running.
    fn ty() -> &'static str;

    fn handle(
        &self,
        stream: TcpStream,
        address: SocketAddr,
        context: Self::Context,
        args: Self::ExtraArgs,
    ) -> Self::Session;
}
