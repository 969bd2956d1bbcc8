//! In-process transport.
//!
//! A [`LocalNetwork`] is an explicit, cloneable switchboard mapping
//! `local://` addresses to listening [`LocalHost`]s. Frames travel over
//! unbounded channels but are still marshalled through the registry, so the
//! encode/decode path matches the network transports.

use crate::conn::stream::{bounded, wait_closed};
use crate::conn::{AcceptHandler, Conn, Host, Traffic, TrafficSnapshot};
use crate::error::{NetError, NetResult};
use crate::frame::FRAME_HEADER_SIZE;
use crate::message::{Message, Packet};
use crate::registry::Registry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tessera_types::{Address, ConnType, NetworkConfig, ServerIdentity};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

struct Listener {
    accept: mpsc::UnboundedSender<Arc<dyn Conn>>,
    registry: Registry,
    config: NetworkConfig,
}

/// Shared table of in-process listeners.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    listeners: Arc<Mutex<HashMap<Address, Listener>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a host for a `local://` address on this network.
    pub fn host(
        &self,
        address: Address,
        registry: Registry,
        config: NetworkConfig,
    ) -> NetResult<LocalHost> {
        if address.conn_type() != ConnType::Local {
            return Err(NetError::WrongTransport(address));
        }
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (stopped, _) = watch::channel(false);
        Ok(LocalHost {
            network: self.clone(),
            address,
            registry,
            config,
            accept_tx,
            accept_rx: Mutex::new(Some(accept_rx)),
            listening: AtomicBool::new(false),
            stopped,
        })
    }

    pub fn is_listening(&self, address: &Address) -> bool {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.contains_key(address)
    }

    /// Open a connection from `from` to the host listening on `to`.
    pub fn dial(
        &self,
        from: &Address,
        to: &Address,
        registry: Registry,
        config: &NetworkConfig,
    ) -> NetResult<Arc<dyn Conn>> {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let listener = listeners
            .get(to)
            .ok_or_else(|| NetError::Unreachable(to.clone()))?;

        let (near_tx, far_rx) = mpsc::unbounded_channel();
        let (far_tx, near_rx) = mpsc::unbounded_channel();
        let near = LocalConn::new(from.clone(), to.clone(), near_tx, near_rx, registry, config);
        let far = LocalConn::new(
            to.clone(),
            from.clone(),
            far_tx,
            far_rx,
            listener.registry.clone(),
            &listener.config,
        );
        listener
            .accept
            .send(Arc::new(far))
            .map_err(|_| NetError::Unreachable(to.clone()))?;
        debug!(from = %from, to = %to, "Local connection opened");
        Ok(Arc::new(near))
    }

    fn register(&self, address: Address, listener: Listener) -> NetResult<()> {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if listeners.contains_key(&address) {
            return Err(NetError::Unknown(format!("{address} is already in use")));
        }
        listeners.insert(address, listener);
        Ok(())
    }

    /// Remove the listener at `address` if it is the one fed by `accept`.
    fn unregister(&self, address: &Address, accept: &mpsc::UnboundedSender<Arc<dyn Conn>>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if listeners
            .get(address)
            .is_some_and(|l| l.accept.same_channel(accept))
        {
            listeners.remove(address);
        }
    }
}

/// One end of an in-process connection.
pub struct LocalConn {
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    local: Address,
    remote: Address,
    registry: Registry,
    traffic: Traffic,
    closed: watch::Sender<bool>,
    close_called: AtomicBool,
    io_timeout: Duration,
    max_frame_size: u32,
}

impl LocalConn {
    fn new(
        local: Address,
        remote: Address,
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
        registry: Registry,
        config: &NetworkConfig,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            outgoing: Mutex::new(Some(outgoing)),
            incoming: tokio::sync::Mutex::new(incoming),
            local,
            remote,
            registry,
            traffic: Traffic::default(),
            closed,
            close_called: AtomicBool::new(false),
            io_timeout: config.io_timeout(),
            max_frame_size: config.max_frame_size,
        }
    }
}

#[async_trait]
impl Conn for LocalConn {
    async fn send(&self, msg: &dyn Message) -> NetResult<u64> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let body = self.registry.marshal(msg)?;
        let size = (FRAME_HEADER_SIZE + body.len()) as u64;
        let outgoing = self
            .outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(NetError::Closed)?;
        outgoing.send(body).map_err(|_| NetError::Closed)?;
        self.traffic.record_tx(size);
        Ok(size)
    }

    async fn receive(&self) -> NetResult<Packet> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let mut closed = self.closed.subscribe();
        let mut incoming = tokio::select! {
            guard = self.incoming.lock() => guard,
            _ = wait_closed(&mut closed) => return Err(NetError::Closed),
        };
        let body = bounded(
            async { incoming.recv().await.ok_or(NetError::Eof) },
            self.io_timeout,
            &mut closed,
        )
        .await?;
        drop(incoming);

        let len = u32::try_from(body.len()).unwrap_or(u32::MAX);
        if len > self.max_frame_size {
            return Err(NetError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        let size = (FRAME_HEADER_SIZE + body.len()) as u64;
        self.traffic.record_rx(size);
        let (msg_type, msg) = self.registry.unmarshal(&body)?;
        Ok(Packet {
            msg_type,
            msg,
            size,
        })
    }

    async fn close(&self) -> NetResult<()> {
        if self.close_called.swap(true, Ordering::SeqCst) {
            return Err(NetError::Closed);
        }
        self.closed.send_replace(true);

        // Peer's receive drains what was sent, then sees Eof.
        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        // Peer's send fails from now on.
        if let Ok(mut incoming) =
            tokio::time::timeout(self.io_timeout, self.incoming.lock()).await
        {
            incoming.close();
        }
        Ok(())
    }

    fn local(&self) -> &Address {
        &self.local
    }

    fn remote(&self) -> &Address {
        &self.remote
    }

    fn conn_type(&self) -> ConnType {
        ConnType::Local
    }

    fn traffic(&self) -> TrafficSnapshot {
        self.traffic.snapshot()
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Host for the `local://` transport.
pub struct LocalHost {
    network: LocalNetwork,
    address: Address,
    registry: Registry,
    config: NetworkConfig,
    accept_tx: mpsc::UnboundedSender<Arc<dyn Conn>>,
    accept_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn Conn>>>>,
    listening: AtomicBool,
    stopped: watch::Sender<bool>,
}

#[async_trait]
impl Host for LocalHost {
    async fn listen(&self, on_accept: AcceptHandler) -> NetResult<()> {
        let mut accepted = self
            .accept_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| NetError::Unknown("listener already started or stopped".into()))?;

        let mut stopped = self.stopped.subscribe();
        let already_stopped = *stopped.borrow();
        if already_stopped {
            return Ok(());
        }
        self.network.register(
            self.address.clone(),
            Listener {
                accept: self.accept_tx.clone(),
                registry: self.registry.clone(),
                config: self.config.clone(),
            },
        )?;
        self.listening.store(true, Ordering::SeqCst);
        info!(addr = %self.address, "Listening");

        loop {
            tokio::select! {
                _ = wait_closed(&mut stopped) => break,
                conn = accepted.recv() => match conn {
                    Some(conn) => on_accept(conn),
                    None => break,
                },
            }
        }

        self.network.unregister(&self.address, &self.accept_tx);
        self.listening.store(false, Ordering::SeqCst);
        info!(addr = %self.address, "Stopped listening");
        Ok(())
    }

    async fn connect(&self, peer: &ServerIdentity) -> NetResult<Arc<dyn Conn>> {
        let address = peer.address();
        if address.conn_type() != ConnType::Local {
            return Err(NetError::WrongTransport(address.clone()));
        }
        self.network
            .dial(&self.address, address, self.registry.clone(), &self.config)
    }

    async fn stop(&self) -> NetResult<()> {
        self.stopped.send_replace(true);
        self.network.unregister(&self.address, &self.accept_tx);
        Ok(())
    }

    fn address(&self) -> &Address {
        &self.address
    }

    fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}
