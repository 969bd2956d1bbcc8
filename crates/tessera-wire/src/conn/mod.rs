//! Transport-agnostic connections and the hosts that create them.
//!
//! A [`Conn`] moves framed messages in both directions over one transport.
//! A [`Host`] listens for inbound connections and dials outbound ones for a
//! single transport family:
//!
//! - [`TcpHost`]: plain TCP
//! - [`TlsHost`]: mutual TLS with certificates bound to node keys
//! - [`LocalHost`]: in-memory channels within one process, for tests

pub mod fault;
pub mod local;
pub mod stream;
pub mod tcp;
pub mod tls;

pub use fault::{FaultInjector, FaultyConn, PauseGate};
pub use local::{LocalConn, LocalHost, LocalNetwork};
pub use stream::StreamConn;
pub use tcp::{resolve, TcpHost};
pub use tls::{TlsContext, TlsHost};

use crate::error::NetResult;
use crate::message::{Message, Packet};
use async_trait::async_trait;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_types::{Address, ConnType, PublicKey, ServerIdentity};

/// Byte and message counters of one connection.
#[derive(Debug, Default)]
pub struct Traffic {
    tx: AtomicU64,
    rx: AtomicU64,
    msgs_tx: AtomicU64,
    msgs_rx: AtomicU64,
}

impl Traffic {
    pub fn record_tx(&self, bytes: u64) {
        self.tx.fetch_add(bytes, Ordering::Relaxed);
        self.msgs_tx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rx(&self, bytes: u64) {
        self.rx.fetch_add(bytes, Ordering::Relaxed);
        self.msgs_rx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            tx: self.tx.load(Ordering::Relaxed),
            rx: self.rx.load(Ordering::Relaxed),
            msgs_tx: self.msgs_tx.load(Ordering::Relaxed),
            msgs_rx: self.msgs_rx.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Traffic`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub tx: u64,
    pub rx: u64,
    pub msgs_tx: u64,
    pub msgs_rx: u64,
}

impl AddAssign for TrafficSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.tx += other.tx;
        self.rx += other.rx;
        self.msgs_tx += other.msgs_tx;
        self.msgs_rx += other.msgs_rx;
    }
}

/// A bidirectional message channel to one peer.
///
/// `send` and `receive` may run concurrently; concurrent sends are
/// serialized so frames never interleave. Every error is a classified
/// [`NetError`](crate::NetError), never a raw I/O error.
#[async_trait]
pub trait Conn: Send + Sync + 'static {
    /// Write one message. Returns the bytes written, length prefix included.
    async fn send(&self, msg: &dyn Message) -> NetResult<u64>;

    /// Wait for the next message.
    async fn receive(&self) -> NetResult<Packet>;

    /// Close the connection. The first call returns `Ok`, later calls
    /// `Err(NetError::Closed)`.
    async fn close(&self) -> NetResult<()>;

    fn local(&self) -> &Address;

    fn remote(&self) -> &Address;

    fn conn_type(&self) -> ConnType;

    fn traffic(&self) -> TrafficSnapshot;

    fn is_closed(&self) -> bool;

    /// Key from the peer's TLS certificate. `None` on other transports.
    fn peer_certificate_key(&self) -> Option<PublicKey> {
        None
    }
}

/// Callback a [`Host`] invokes for each accepted connection.
///
/// It must not block: long work belongs on a spawned task.
pub type AcceptHandler = Arc<dyn Fn(Arc<dyn Conn>) + Send + Sync>;

/// Listener and dialer for one transport.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// Accept connections until [`stop`](Self::stop) is called.
    async fn listen(&self, on_accept: AcceptHandler) -> NetResult<()>;

    /// Open a raw connection to `peer`. No handshake is run.
    async fn connect(&self, peer: &ServerIdentity) -> NetResult<Arc<dyn Conn>>;

    /// Stop listening. Idempotent.
    async fn stop(&self) -> NetResult<()>;

    /// Public address of this host.
    fn address(&self) -> &Address;

    fn listening(&self) -> bool;
}
