//! Plain TCP transport.
//!
//! [`TcpCore`] owns the listener and the stop signal and is shared with the
//! TLS transport, which layers its handshake on top of the same accept loop
//! and dialer.

use crate::conn::stream::{wait_closed, StreamConn};
use crate::conn::{AcceptHandler, Conn, Host};
use crate::error::{NetError, NetResult};
use crate::registry::Registry;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tessera_types::{Address, ConnType, NetworkConfig, ServerIdentity};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Resolve an address to the first socket address it names.
pub async fn resolve(address: &Address) -> NetResult<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(address.network_address())
        .await
        .map_err(|e| {
            debug!(addr = %address, error = %e, "Address lookup failed");
            NetError::Unreachable(address.clone())
        })?;
    addrs
        .next()
        .ok_or_else(|| NetError::Unreachable(address.clone()))
}

/// Listener, dialer and stop signal shared by the stream transports.
pub(crate) struct TcpCore {
    address: Address,
    listener: Mutex<Option<TcpListener>>,
    listening: AtomicBool,
    stopped: watch::Sender<bool>,
    config: NetworkConfig,
}

impl TcpCore {
    /// Bind `listen_on` and advertise `public`.
    ///
    /// A public port of 0 is replaced by the port actually bound.
    pub(crate) async fn bind(
        public: Address,
        listen_on: &str,
        expected: ConnType,
        config: NetworkConfig,
    ) -> NetResult<Self> {
        if public.conn_type() != expected {
            return Err(NetError::WrongTransport(public));
        }
        let listener = TcpListener::bind(listen_on)
            .await
            .map_err(|e| NetError::Unknown(format!("bind {listen_on}: {e}")))?;
        let bound = listener.local_addr()?;
        let address = if public.port() == 0 {
            public.with_port(bound.port())
        } else {
            public
        };
        debug!(addr = %address, bound = %bound, "Bound listener");

        let (stopped, _) = watch::channel(false);
        Ok(Self {
            address,
            listener: Mutex::new(Some(listener)),
            listening: AtomicBool::new(false),
            stopped,
            config,
        })
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stopped.subscribe()
    }

    /// Accept streams until [`stop`](Self::stop) is called.
    ///
    /// Accept errors are logged and retried after the configured backoff.
    pub(crate) async fn accept_loop<F>(&self, mut on_stream: F) -> NetResult<()>
    where
        F: FnMut(TcpStream, SocketAddr) + Send,
    {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| NetError::Unknown("listener already started or stopped".into()))?;

        let mut stopped = self.stopped.subscribe();
        let already_stopped = *stopped.borrow();
        if already_stopped {
            return Ok(());
        }
        self.listening.store(true, Ordering::SeqCst);
        info!(addr = %self.address, "Listening");

        loop {
            tokio::select! {
                _ = wait_closed(&mut stopped) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(addr = %self.address, peer = %peer, "Accepted connection");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        on_stream(stream, peer);
                    }
                    Err(e) => {
                        error!(addr = %self.address, error = %e, "Accept error");
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.accept_backoff()) => {}
                            _ = wait_closed(&mut stopped) => break,
                        }
                    }
                },
            }
        }

        self.listening.store(false, Ordering::SeqCst);
        info!(addr = %self.address, "Stopped listening");
        Ok(())
    }

    /// Open a TCP stream to `address` under the dial deadline.
    pub(crate) async fn dial(&self, address: &Address) -> NetResult<TcpStream> {
        let target = resolve(address).await?;
        match tokio::time::timeout(self.config.dial_timeout(), TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %address, error = %e, "Failed to set TCP_NODELAY");
                }
                Ok(stream)
            }
            Ok(Err(e)) => {
                debug!(peer = %address, error = %e, "Dial failed");
                Err(NetError::Unreachable(address.clone()))
            }
            Err(_) => {
                debug!(peer = %address, "Dial timed out");
                Err(NetError::Unreachable(address.clone()))
            }
        }
    }

    /// Signal the accept loop and release an unused listener.
    pub(crate) fn stop(&self) {
        self.stopped.send_replace(true);
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

/// Host for the `tcp://` transport.
pub struct TcpHost {
    core: TcpCore,
    registry: Registry,
}

impl TcpHost {
    /// Bind on the address's own `host:port`.
    pub async fn bind(
        address: Address,
        registry: Registry,
        config: NetworkConfig,
    ) -> NetResult<Self> {
        let listen_on = address.network_address().to_string();
        Self::bind_with_listen_addr(address, &listen_on, registry, config).await
    }

    /// Bind on `listen_on` while advertising `public`, for nodes behind a
    /// port mapping.
    pub async fn bind_with_listen_addr(
        public: Address,
        listen_on: &str,
        registry: Registry,
        config: NetworkConfig,
    ) -> NetResult<Self> {
        let core = TcpCore::bind(public, listen_on, ConnType::Plain, config).await?;
        Ok(Self { core, registry })
    }

    fn wrap(
        &self,
        stream: TcpStream,
        local: Address,
        remote: Address,
    ) -> NetResult<Arc<dyn Conn>> {
        let (stream, peek_socket) = split_hangup_socket(stream)?;
        let conn = StreamConn::new(
            stream,
            local,
            remote,
            self.registry.clone(),
            self.core.config(),
        );
        Ok(Arc::new(conn.with_hangup_check(peek_socket)))
    }
}

/// Duplicate the socket so sends can peek for a peer hangup without
/// disturbing the reader.
fn split_hangup_socket(stream: TcpStream) -> NetResult<(TcpStream, std::net::TcpStream)> {
    let stream = stream.into_std()?;
    let peek_socket = stream.try_clone()?;
    peek_socket.set_nonblocking(true)?;
    Ok((TcpStream::from_std(stream)?, peek_socket))
}

#[async_trait]
impl Host for TcpHost {
    async fn listen(&self, on_accept: AcceptHandler) -> NetResult<()> {
        self.core
            .accept_loop(|stream, peer| {
                let remote = Address::from_socket_addr(ConnType::Plain, peer);
                match self.wrap(stream, self.core.address().clone(), remote) {
                    Ok(conn) => on_accept(conn),
                    Err(e) => warn!(peer = %peer, error = %e, "Dropping accepted connection"),
                }
            })
            .await
    }

    async fn connect(&self, peer: &ServerIdentity) -> NetResult<Arc<dyn Conn>> {
        let address = peer.address();
        if address.conn_type() != ConnType::Plain {
            return Err(NetError::WrongTransport(address.clone()));
        }
        let stream = self.core.dial(address).await?;
        let local = match stream.local_addr() {
            Ok(addr) => Address::from_socket_addr(ConnType::Plain, addr),
            Err(_) => self.core.address().clone(),
        };
        self.wrap(stream, local, address.clone())
    }

    async fn stop(&self) -> NetResult<()> {
        self.core.stop();
        Ok(())
    }

    fn address(&self) -> &Address {
        self.core.address()
    }

    fn listening(&self) -> bool {
        self.core.listening()
    }
}
