use std::{marker::PhantomData, net::SocketAddr, sync::Arc};

use serde::Deserialize;
use tokio::{net::TcpListener as TokioTcpListener, sync::broadcast::Receiver};

use crate::{
    Signal, incoming, internal,
    traits::protocol::{Protocol, SessionHandler},
};

/// A bound TCP socket paired with the protocol that should handle each
/// connection accepted on it.
///
/// Deserialized straight out of configuration (one `[[listener]]` table per
/// socket); `init` performs the actual `bind(2)`, and `serve` then accepts
/// connections until told to shut down.
#[derive(Deserialize)]
pub struct Listener<Proto: Protocol> {
    address: SocketAddr,

    #[serde(default)]
    args: Proto::ExtraArgs,

    #[serde(default)]
    context: Proto::Context,

    #[serde(skip)]
    protocol: Arc<Proto>,

    #[serde(skip)]
    _marker: PhantomData<Proto>,
}

impl<Proto: Protocol> Listener<Proto>
where
    Proto::ExtraArgs: Default + for<'a> Deserialize<'a> + Clone,
{
    #[must_use]
    pub fn new(address: SocketAddr, context: Proto::Context, args: Proto::ExtraArgs) -> Self {
        Self {
            address,
            args,
            context,
            protocol: Arc::new(Proto::default()),
            _marker: PhantomData,
        }
    }

    /// Validate this listener is ready to bind. The actual `bind(2)` is
    /// deferred to `serve`, since that's where we have an async context and
    /// the shutdown signal to race against.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured address is unusable.
    pub fn init(&self) -> anyhow::Result<()> {
        internal!("Initialising {} listener on {}", Proto::ty(), self.address);
        Ok(())
    }

    async fn bind(&self) -> anyhow::Result<TokioTcpListener> {
        Ok(TokioTcpListener::bind(self.address).await?)
    }

    /// Accept connections until `shutdown` fires, dispatching each to
    /// `Proto::handle` and spawning the resulting session.
    ///
    /// # Errors
    ///
    /// Propagates an error from binding the socket. Errors from individual
    /// sessions are logged and do not bring the listener down.
    pub async fn serve(&self, mut shutdown: Receiver<Signal>) -> anyhow::Result<()> {
        let socket = self.bind().await?;

        loop {
            tokio::select! {
                biased;

                signal = shutdown.recv() => {
                    match signal {
                        Ok(Signal::Shutdown) | Err(_) => {
                            internal!("{} listener on {} shutting down", Proto::ty(), self.address);
                            return Ok(());
                        }
                        Ok(Signal::Finalised) => continue,
                    }
                }

                accepted = socket.accept() => {
                    let (stream, address) = accepted?;
                    incoming!("Accepted connection from {}", address);

                    let session = self.protocol.handle(
                        stream,
                        address,
                        self.context.clone(),
                        self.args.clone(),
                    );

                    let session_shutdown = shutdown.resubscribe();
                    tokio::spawn(async move {
                        if let Err(error) = session.run(session_shutdown).await {
                            internal!(level = WARN, "Session from {} ended with error: {}", address, error);
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::Listener;
    use crate::traits::protocol::{Protocol, SessionHandler};

    #[derive(Default, Clone, Debug, serde::Deserialize)]
    struct NoopContext;

    struct NoopSession;

    impl SessionHandler for NoopSession {
        fn run(
            self,
            _shutdown: tokio::sync::broadcast::Receiver<crate::Signal>,
        ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send {
            async { Ok(()) }
        }
    }

    #[derive(Default)]
    struct NoopProtocol;

    impl Protocol for NoopProtocol {
        type Session = NoopSession;
        type Context = NoopContext;
        type ExtraArgs = ();

        fn ty() -> &'static str {
            "noop"
        }

        fn handle(
            &self,
            _stream: tokio::net::TcpStream,
            _address: SocketAddr,
            _context: Self::Context,
            _args: Self::ExtraArgs,
        ) -> Self::Session {
            NoopSession
        }
    }

    #[test]
    fn listener_construction_binds_address() {
        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = Listener::<NoopProtocol>::new(address, NoopContext, ());
        assert_eq!(listener.address, address);
        assert!(listener.init().is_ok());
    }
}
