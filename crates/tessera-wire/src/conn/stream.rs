//! Framed connection over any byte stream (TCP, TLS, in-memory duplex).

use crate::conn::{Conn, Traffic, TrafficSnapshot};
use crate::error::{NetError, NetResult};
use crate::frame::{read_frame, write_frame, FRAME_HEADER_SIZE};
use crate::message::{Message, Packet};
use crate::registry::Registry;
use async_trait::async_trait;
use std::future::Future;
use std::io::ErrorKind;
use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tessera_types::{Address, ConnType, NetworkConfig, PublicKey};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Resolve once the watched flag becomes true (or its sender is gone).
pub(crate) async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Run `fut` under `deadline`, giving up early if `closed` fires.
pub(crate) async fn bounded<T, F>(
    fut: F,
    deadline: Duration,
    closed: &mut watch::Receiver<bool>,
) -> NetResult<T>
where
    F: Future<Output = NetResult<T>>,
{
    tokio::select! {
        result = tokio::time::timeout(deadline, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(NetError::Timeout),
        },
        _ = wait_closed(closed) => Err(NetError::Closed),
    }
}

/// A length-framed [`Conn`] over a split byte stream.
///
/// Each send and receive runs under the I/O deadline and is abandoned as
/// soon as the connection is closed. A read that ends in `Eof` or `Closed`
/// marks the connection closed, so it is never handed out again.
pub struct StreamConn<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    local: Address,
    remote: Address,
    conn_type: ConnType,
    registry: Registry,
    traffic: Traffic,
    closed: watch::Sender<bool>,
    close_called: AtomicBool,
    peer_key: Option<PublicKey>,
    hangup_socket: Option<StdTcpStream>,
    io_timeout: Duration,
    max_frame_size: u32,
}

impl<S> StreamConn<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        stream: S,
        local: Address,
        remote: Address,
        registry: Registry,
        config: &NetworkConfig,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            conn_type: remote.conn_type(),
            local,
            remote,
            registry,
            traffic: Traffic::default(),
            closed,
            close_called: AtomicBool::new(false),
            peer_key: None,
            hangup_socket: None,
            io_timeout: config.io_timeout(),
            max_frame_size: config.max_frame_size,
        }
    }

    /// Attach the key read from the peer's TLS certificate.
    pub fn with_peer_key(mut self, key: PublicKey) -> Self {
        self.peer_key = Some(key);
        self
    }

    /// Check a duplicate of the socket for a peer hangup before each send.
    ///
    /// The socket must be non-blocking. It only peeks, so the reader keeps
    /// every byte.
    pub fn with_hangup_check(mut self, peek_socket: StdTcpStream) -> Self {
        self.hangup_socket = Some(peek_socket);
        self
    }

    /// True once the peer has shut down and nothing is left unread.
    fn peer_hung_up(&self) -> bool {
        let Some(peek_socket) = &self.hangup_socket else {
            return false;
        };
        let mut byte = [0u8; 1];
        match peek_socket.peek(&mut byte) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted),
        }
    }

    /// Mark the stream unusable: the peer is gone or a partial frame was
    /// written.
    fn mark_broken(&self) {
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl<S> Conn for StreamConn<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, msg: &dyn Message) -> NetResult<u64> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        if self.peer_hung_up() {
            debug!(remote = %self.remote, "Peer hung up, not writing");
            self.mark_broken();
            return Err(NetError::Closed);
        }
        let body = self.registry.marshal(msg)?;
        let mut closed = self.closed.subscribe();

        let mut writer = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = wait_closed(&mut closed) => return Err(NetError::Closed),
        };
        let result = bounded(
            write_frame(&mut *writer, &body, self.max_frame_size),
            self.io_timeout,
            &mut closed,
        )
        .await;
        drop(writer);

        match result {
            Ok(written) => {
                self.traffic.record_tx(written);
                Ok(written)
            }
            Err(e) => {
                if e.is_network() {
                    self.mark_broken();
                }
                Err(e)
            }
        }
    }

    async fn receive(&self) -> NetResult<Packet> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let mut closed = self.closed.subscribe();

        let mut reader = tokio::select! {
            guard = self.reader.lock() => guard,
            _ = wait_closed(&mut closed) => return Err(NetError::Closed),
        };
        let result = bounded(
            read_frame(&mut *reader, self.max_frame_size),
            self.io_timeout,
            &mut closed,
        )
        .await;
        drop(reader);

        let body = match result {
            Ok(body) => body,
            Err(e) => {
                if matches!(e, NetError::Eof | NetError::Closed) {
                    self.mark_broken();
                }
                return Err(e);
            }
        };

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

        // In-flight sends see the signal and release the writer.
        if let Ok(mut writer) = tokio::time::timeout(self.io_timeout, self.writer.lock()).await {
            if let Err(e) = tokio::time::timeout(self.io_timeout, writer.shutdown()).await {
                debug!(remote = %self.remote, error = %e, "Shutdown timed out");
            }
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
        self.conn_type
    }

    fn traffic(&self) -> TrafficSnapshot {
        self.traffic.snapshot()
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn peer_certificate_key(&self) -> Option<PublicKey> {
        self.peer_key
    }
}
