//! Fault injection for testing failure scenarios.
//!
//! A [`FaultInjector`] attached to a router wraps every connection it
//! registers in a [`FaultyConn`], which consults the injector around each
//! receive. [`PauseGate`] is the stock injector: while paused, receives block
//! before reading their next frame, and a frame that arrives anyway is held
//! back and discarded. Unpausing releases them with [`NetError::Canceled`].

use crate::conn::stream::wait_closed;
use crate::conn::{Conn, TrafficSnapshot};
use crate::error::{NetError, NetResult};
use crate::message::{Message, Packet};
use async_trait::async_trait;
use std::sync::Arc;
use tessera_types::{Address, ConnType, PublicKey};
use tokio::sync::watch;

/// Hooks consulted by [`FaultyConn`] around each receive.
#[async_trait]
pub trait FaultInjector: Send + Sync + 'static {
    /// An error here is returned from `receive` instead of reading a frame.
    async fn before_receive(&self) -> NetResult<()>;

    /// Runs once a frame has been read. An error drops that frame.
    async fn after_receive(&self) -> NetResult<()> {
        Ok(())
    }
}

/// Blocks receives while paused.
#[derive(Clone)]
pub struct PauseGate {
    paused: Arc<watch::Sender<bool>>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused: Arc::new(paused),
        }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Release every blocked receive with `Canceled`.
    pub fn unpause(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    /// Pass straight through when open; otherwise wait for unpause and
    /// report `Canceled`.
    async fn hold(&self) -> NetResult<()> {
        let mut rx = self.paused.subscribe();
        let paused = *rx.borrow_and_update();
        if !paused {
            return Ok(());
        }
        let _ = rx.wait_for(|paused| !*paused).await;
        Err(NetError::Canceled)
    }
}

#[async_trait]
impl FaultInjector for PauseGate {
    async fn before_receive(&self) -> NetResult<()> {
        self.hold().await
    }

    async fn after_receive(&self) -> NetResult<()> {
        self.hold().await
    }
}

/// A [`Conn`] decorated with a [`FaultInjector`].
pub struct FaultyConn {
    inner: Arc<dyn Conn>,
    faults: Arc<dyn FaultInjector>,
    closed: watch::Sender<bool>,
}

impl FaultyConn {
    pub fn new(inner: Arc<dyn Conn>, faults: Arc<dyn FaultInjector>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner,
            faults,
            closed,
        }
    }
}

#[async_trait]
impl Conn for FaultyConn {
    async fn send(&self, msg: &dyn Message) -> NetResult<u64> {
        self.inner.send(msg).await
    }

    async fn receive(&self) -> NetResult<Packet> {
        let mut closed = self.closed.subscribe();
        tokio::select! {
            gate = self.faults.before_receive() => gate?,
            _ = wait_closed(&mut closed) => return Err(NetError::Closed),
        }
        let packet = self.inner.receive().await?;
        tokio::select! {
            gate = self.faults.after_receive() => gate?,
            _ = wait_closed(&mut closed) => return Err(NetError::Closed),
        }
        Ok(packet)
    }

    async fn close(&self) -> NetResult<()> {
        self.closed.send_replace(true);
        self.inner.close().await
    }

    fn local(&self) -> &Address {
        self.inner.local()
    }

    fn remote(&self) -> &Address {
        self.inner.remote()
    }

    fn conn_type(&self) -> ConnType {
        self.inner.conn_type()
    }

    fn traffic(&self) -> TrafficSnapshot {
        self.inner.traffic()
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.inner.is_closed()
    }

    fn peer_certificate_key(&self) -> Option<PublicKey> {
        self.inner.peer_certificate_key()
    }
}
