//! Router: owns the live connections of one node.
//!
//! The [`Router`] accepts connections through its [`Host`], runs the identity
//! handshake, keeps every established connection in a table keyed by peer
//! identity, and drives one receive loop per connection that hands decoded
//! envelopes to the [`Dispatcher`]. Outbound, [`Router::send`] reuses a live
//! connection or dials a fresh one, retrying once on a broken connection.
//!
//! One mutex guards the connection table, the closed flag, the counters of
//! removed connections and the worker set. No I/O happens while it is held.

use crate::conn::stream::wait_closed;
use crate::conn::{AcceptHandler, Conn, FaultInjector, FaultyConn, Host, TrafficSnapshot};
use crate::dispatch::Dispatcher;
use crate::error::{HandshakeError, NetError, NetResult, SendError, SendToAllError};
use crate::handshake;
use crate::message::{Envelope, Message};
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tessera_types::{Address, IdentityId, NetworkConfig, ServerIdentity};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Callback run when a connection to a peer is lost.
pub type ErrorHandler = Arc<dyn Fn(&ServerIdentity) + Send + Sync>;

/// Snapshot of one connected peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub identity: ServerIdentity,
    /// Live connections to this peer.
    pub connections: usize,
    /// When the oldest live connection was established.
    pub connected_at: DateTime<Utc>,
}

struct TrackedConn {
    conn: Arc<dyn Conn>,
    remote: ServerIdentity,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct RouterState {
    connections: HashMap<IdentityId, Vec<TrackedConn>>,
    closed: bool,
    /// Traffic of connections already removed from the table.
    retired: TrafficSnapshot,
    workers: JoinSet<()>,
}

/// Keeps the active worker count accurate however a worker ends.
struct WorkerGuard(Arc<AtomicUsize>);

impl WorkerGuard {
    fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Compare connections by allocation, ignoring vtables.
fn same_conn(a: &Arc<dyn Conn>, b: &Arc<dyn Conn>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn log_join_error(e: JoinError) {
    if e.is_panic() {
        error!(error = %e, "Router worker panicked");
    }
}

/// Whether losing a connection for `reason` is reported to error handlers.
fn reportable(reason: &NetError) -> bool {
    matches!(
        reason,
        NetError::Timeout
            | NetError::Closed
            | NetError::Eof
            | NetError::Unknown(_)
            | NetError::FrameTooLarge { .. }
    )
}

/// Connection pool and message pump of one node.
pub struct Router {
    identity: ServerIdentity,
    host: Arc<dyn Host>,
    registry: Registry,
    dispatcher: Arc<dyn Dispatcher>,
    config: NetworkConfig,
    faults: Option<Arc<dyn FaultInjector>>,
    shutdown: watch::Sender<bool>,
    state: Mutex<RouterState>,
    error_handlers: RwLock<Vec<ErrorHandler>>,
    active_workers: Arc<AtomicUsize>,
}

impl Router {
    /// Create a router. It does not listen until [`start`](Self::start).
    pub fn new(
        identity: ServerIdentity,
        host: Arc<dyn Host>,
        registry: Registry,
        dispatcher: Arc<dyn Dispatcher>,
        config: NetworkConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            identity,
            host,
            registry,
            dispatcher,
            config,
            faults: None,
            shutdown,
            state: Mutex::new(RouterState::default()),
            error_handlers: RwLock::new(Vec::new()),
            active_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wrap every registered connection with `faults`.
    pub fn with_fault_injector(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = Some(faults);
        self
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn address(&self) -> &Address {
        self.host.address()
    }

    pub fn listening(&self) -> bool {
        self.host.listening()
    }

    /// Poll until the host listens or `timeout` passes.
    pub async fn wait_listening(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.host.listening() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Register a callback for lost connections.
    ///
    /// Runs when a connection is dropped for a timeout, a close or reset, an
    /// end of stream, an unclassified transport error or an oversized frame.
    /// Never runs for connections closed by [`stop`](Self::stop) or released
    /// by a fault injector.
    pub fn add_error_handler<F>(&self, handler: F)
    where
        F: Fn(&ServerIdentity) + Send + Sync + 'static,
    {
        self.error_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(handler));
    }

    /// Listen and serve until [`stop`](Self::stop) is called.
    pub async fn start(self: &Arc<Self>) -> NetResult<()> {
        if self.is_closed() {
            return Err(NetError::RouterClosed);
        }
        info!(addr = %self.host.address(), id = %self.identity.id(), "Router starting");

        let weak = Arc::downgrade(self);
        let on_accept: AcceptHandler = Arc::new(move |conn: Arc<dyn Conn>| {
            let spawned = match weak.upgrade() {
                Some(router) => {
                    let worker = Arc::clone(&router);
                    let accepted = Arc::clone(&conn);
                    router.spawn_worker(async move { worker.handle_accepted(accepted).await })
                }
                None => false,
            };
            if !spawned {
                tokio::spawn(async move {
                    let _ = conn.close().await;
                });
            }
        });

        let result = self.host.listen(on_accept).await;
        info!(addr = %self.host.address(), "Router no longer listening");
        result
    }

    /// Stop listening, close every connection and wait for every worker.
    ///
    /// Later calls return `Ok` without doing anything.
    pub async fn stop(&self) -> NetResult<()> {
        let (conns, mut workers) = {
            let mut state = self.state();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            let conns: Vec<TrackedConn> =
                state.connections.drain().flat_map(|(_, list)| list).collect();
            (conns, std::mem::take(&mut state.workers))
        };

        self.shutdown.send_replace(true);
        if let Err(e) = self.host.stop().await {
            warn!(addr = %self.host.address(), error = %e, "Host stop failed");
        }

        join_all(conns.iter().map(|tracked| tracked.conn.close())).await;
        {
            let mut state = self.state();
            for tracked in &conns {
                state.retired += tracked.conn.traffic();
            }
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                log_join_error(e);
            }
        }
        info!(addr = %self.host.address(), closed = conns.len(), "Router stopped");
        Ok(())
    }

    /// Run `worker` in the router's task set. Refused once the router is
    /// closed.
    fn spawn_worker<F>(&self, worker: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state();
        if state.closed {
            return false;
        }
        while let Some(result) = state.workers.try_join_next() {
            if let Err(e) = result {
                log_join_error(e);
            }
        }
        let guard = WorkerGuard::new(Arc::clone(&self.active_workers));
        state.workers.spawn(async move {
            let _guard = guard;
            worker.await;
        });
        true
    }

    /// Add an established connection to the table.
    ///
    /// Hands the connection back if the router closed in the meantime.
    fn register(
        &self,
        conn: Arc<dyn Conn>,
        remote: &ServerIdentity,
    ) -> Result<Arc<dyn Conn>, Arc<dyn Conn>> {
        let conn: Arc<dyn Conn> = match &self.faults {
            Some(faults) => Arc::new(FaultyConn::new(conn, Arc::clone(faults))),
            None => conn,
        };
        let mut state = self.state();
        if state.closed {
            return Err(conn);
        }
        state
            .connections
            .entry(remote.id())
            .or_default()
            .push(TrackedConn {
                conn: Arc::clone(&conn),
                remote: remote.clone(),
                connected_at: Utc::now(),
            });
        Ok(conn)
    }

    /// Handshake an inbound connection, then serve it.
    async fn handle_accepted(self: Arc<Self>, conn: Arc<dyn Conn>) {
        let mut shutdown = self.shutdown.subscribe();
        let result = tokio::select! {
            result = tokio::time::timeout(
                self.config.handshake_timeout(),
                handshake::accept(conn.as_ref()),
            ) => result.unwrap_or(Err(NetError::Timeout)),
            _ = wait_closed(&mut shutdown) => Err(NetError::Canceled),
        };

        let remote = match result {
            Ok(remote) => remote,
            Err(e) => {
                match &e {
                    NetError::Handshake(HandshakeError::IdentityMismatch { .. }) => {
                        error!(addr = %conn.remote(), error = %e, "Rejected connection: identity mismatch")
                    }
                    NetError::Canceled => {
                        debug!(addr = %conn.remote(), "Handshake abandoned on shutdown")
                    }
                    _ => warn!(addr = %conn.remote(), error = %e, "Rejected inbound connection"),
                }
                let _ = conn.close().await;
                return;
            }
        };

        let conn = match self.register(conn, &remote) {
            Ok(conn) => conn,
            Err(conn) => {
                let _ = conn.close().await;
                return;
            }
        };
        info!(peer = %remote.id(), addr = %conn.remote(), "Inbound connection established");
        self.receive_loop(conn, remote).await;
    }

    /// Dial `dst`, handshake, register the connection and start its receive
    /// loop.
    async fn connect(self: &Arc<Self>, dst: &ServerIdentity) -> NetResult<Arc<dyn Conn>> {
        if self.is_closed() {
            return Err(NetError::RouterClosed);
        }
        let conn = self.host.connect(dst).await?;
        let handshake = tokio::time::timeout(
            self.config.handshake_timeout(),
            handshake::dial(conn.as_ref(), &self.identity, dst),
        )
        .await
        .unwrap_or(Err(NetError::Timeout));

        if let Err(e) = handshake {
            if matches!(
                e,
                NetError::Handshake(HandshakeError::IdentityMismatch { .. })
            ) {
                error!(peer = %dst.id(), addr = %dst.address(), error = %e, "Refusing peer: identity mismatch");
            } else {
                debug!(peer = %dst.id(), error = %e, "Outbound handshake failed");
            }
            let _ = conn.close().await;
            return Err(e);
        }

        let conn = match self.register(conn, dst) {
            Ok(conn) => conn,
            Err(conn) => {
                let _ = conn.close().await;
                return Err(NetError::RouterClosed);
            }
        };

        let worker = Arc::clone(self);
        let worker_conn = Arc::clone(&conn);
        let remote = dst.clone();
        // A refused spawn means stop is underway and will close this conn.
        self.spawn_worker(async move { worker.receive_loop(worker_conn, remote).await });
        info!(peer = %dst.id(), addr = %dst.address(), "Outbound connection established");
        Ok(conn)
    }

    /// Deliver every frame from `conn` until it fails, then drop it.
    async fn receive_loop(self: Arc<Self>, conn: Arc<dyn Conn>, remote: ServerIdentity) {
        let reason = loop {
            match conn.receive().await {
                Ok(packet) => {
                    let envelope = Envelope::from_packet(remote.clone(), packet);
                    let msg_type = envelope.msg_type;
                    if let Err(e) = self.dispatcher.dispatch(envelope).await {
                        warn!(peer = %remote.id(), msg_type = %msg_type, error = %e, "Dispatch failed");
                    }
                }
                Err(e @ (NetError::UnregisteredType(_) | NetError::Decode(_))) => {
                    warn!(peer = %remote.id(), error = %e, "Skipping undecodable message");
                }
                Err(e) => break e,
            }
        };
        self.drop_conn(&conn, &remote, reason).await;
    }

    /// Close `conn`, remove it from the table and fold its counters.
    ///
    /// Error handlers run only if this call removed the connection, the
    /// router is not stopping, and the reason is reportable.
    async fn drop_conn(&self, conn: &Arc<dyn Conn>, remote: &ServerIdentity, reason: NetError) {
        let _ = conn.close().await;

        let (removed, stopping) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let mut removed = false;
            if let Some(list) = state.connections.get_mut(&remote.id()) {
                if let Some(pos) = list.iter().position(|t| same_conn(&t.conn, conn)) {
                    let tracked = list.remove(pos);
                    state.retired += tracked.conn.traffic();
                    removed = true;
                }
                if list.is_empty() {
                    state.connections.remove(&remote.id());
                }
            }
            (removed, state.closed)
        };
        if !removed {
            return;
        }

        match &reason {
            NetError::Unknown(_) => {
                error!(peer = %remote.id(), error = %reason, "Connection failed")
            }
            _ => debug!(peer = %remote.id(), reason = %reason, "Connection dropped"),
        }

        if stopping || !reportable(&reason) {
            return;
        }
        let handlers = self
            .error_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            handler(remote);
        }
    }

    /// A live connection to `dst`, newest first.
    fn existing_conn(&self, dst: &ServerIdentity) -> Option<Arc<dyn Conn>> {
        let state = self.state();
        state.connections.get(&dst.id()).and_then(|list| {
            list.iter()
                .rev()
                .find(|t| !t.conn.is_closed())
                .map(|t| Arc::clone(&t.conn))
        })
    }

    /// Send `msgs` to `dst` in order over one connection.
    ///
    /// Messages to this node's own identity are dispatched locally without
    /// touching the network, so this works before [`start`](Self::start).
    /// If a write fails with a network error the connection is dropped and
    /// the failed message and the rest are retried once on a fresh
    /// connection. Returns the bytes written.
    pub async fn send(
        self: &Arc<Self>,
        dst: &ServerIdentity,
        msgs: &[&dyn Message],
    ) -> Result<u64, SendError> {
        let mut bytes_sent = 0u64;
        if self.is_closed() {
            return Err(SendError {
                bytes_sent,
                error: NetError::RouterClosed,
            });
        }

        if dst.id() == self.identity.id() {
            for msg in msgs {
                let msg_type = self.registry.message_type(*msg).ok_or_else(|| SendError {
                    bytes_sent,
                    error: NetError::UnregisteredType(format!("{msg:?}")),
                })?;
                let envelope = Envelope {
                    sender: self.identity.clone(),
                    msg_type,
                    msg: (**msg).clone_message(),
                    size: 0,
                };
                if let Err(e) = self.dispatcher.dispatch(envelope).await {
                    warn!(msg_type = %msg_type, error = %e, "Local dispatch failed");
                }
            }
            return Ok(0);
        }

        let mut conn = match self.existing_conn(dst) {
            Some(conn) => conn,
            None => self
                .connect(dst)
                .await
                .map_err(|error| SendError { bytes_sent, error })?,
        };

        let mut retried = false;
        let mut next = 0;
        while let Some(msg) = msgs.get(next) {
            match conn.send(*msg).await {
                Ok(written) => {
                    bytes_sent += written;
                    next += 1;
                }
                Err(error) if error.is_network() && !retried => {
                    retried = true;
                    debug!(peer = %dst.id(), error = %error, "Send failed, retrying on a fresh connection");
                    self.drop_conn(&conn, dst, error).await;
                    conn = self
                        .connect(dst)
                        .await
                        .map_err(|error| SendError { bytes_sent, error })?;
                }
                Err(error) => return Err(SendError { bytes_sent, error }),
            }
        }
        Ok(bytes_sent)
    }

    /// Send `msg` to every peer in `dsts` concurrently.
    ///
    /// Every destination is attempted; all failures are reported together.
    pub async fn send_to_all(
        self: &Arc<Self>,
        dsts: &[ServerIdentity],
        msg: &dyn Message,
    ) -> Result<u64, SendToAllError> {
        let results = join_all(
            dsts.iter()
                .map(|dst| async move { (dst, self.send(dst, &[msg]).await) }),
        )
        .await;

        let mut bytes_sent = 0;
        let mut failures = Vec::new();
        for (dst, result) in results {
            match result {
                Ok(written) => bytes_sent += written,
                Err(e) => {
                    bytes_sent += e.bytes_sent;
                    failures.push((dst.clone(), e.error));
                }
            }
        }
        if failures.is_empty() {
            Ok(bytes_sent)
        } else {
            Err(SendToAllError {
                bytes_sent,
                failures,
            })
        }
    }

    /// Close every connection to `peer` without notifying error handlers.
    ///
    /// Returns how many were closed.
    pub async fn close_connections(&self, peer: &ServerIdentity) -> usize {
        let conns = {
            let mut state = self.state();
            state.connections.remove(&peer.id()).unwrap_or_default()
        };
        join_all(conns.iter().map(|tracked| tracked.conn.close())).await;
        {
            let mut state = self.state();
            for tracked in &conns {
                state.retired += tracked.conn.traffic();
            }
        }
        conns.len()
    }

    /// Number of live connections to `peer`.
    pub fn connection_count(&self, peer: &ServerIdentity) -> usize {
        self.state()
            .connections
            .get(&peer.id())
            .map_or(0, |list| list.len())
    }

    /// Snapshot of every connected peer.
    pub fn peers(&self) -> Vec<PeerEntry> {
        let state = self.state();
        state
            .connections
            .values()
            .filter_map(|list| {
                let first = list.first()?;
                let connected_at = list
                    .iter()
                    .map(|t| t.connected_at)
                    .min()
                    .unwrap_or(first.connected_at);
                Some(PeerEntry {
                    identity: first.remote.clone(),
                    connections: list.len(),
                    connected_at,
                })
            })
            .collect()
    }

    /// Receive and handshake tasks still running.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Traffic of live and removed connections combined.
    pub fn traffic(&self) -> TrafficSnapshot {
        let state = self.state();
        let mut total = state.retired;
        for tracked in state.connections.values().flatten() {
            total += tracked.conn.traffic();
        }
        total
    }

    /// Bytes sent, handshakes included.
    pub fn tx(&self) -> u64 {
        self.traffic().tx
    }

    /// Bytes received, handshakes included.
    pub fn rx(&self) -> u64 {
        self.traffic().rx
    }

    pub fn msgs_tx(&self) -> u64 {
        self.traffic().msgs_tx
    }

    pub fn msgs_rx(&self) -> u64 {
        self.traffic().msgs_rx
    }
}
