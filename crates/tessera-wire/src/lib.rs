//! Tessera wire layer: framed, identity-checked connections between nodes.
//!
//! Moves typed messages between nodes over TCP, mutual TLS, or in-process
//! channels, using a length-prefixed MessagePack frame format.
//!
//! ## Architecture
//!
//! - **Registry**: Maps message types to stable wire ids and (de)serializers
//! - **Conn / Host**: One connection and the listener/dialer that makes it
//! - **Handshake**: Identity exchange, checked against TLS certificates
//! - **Router**: Connection pool, receive loops, and retrying send
//! - **Dispatcher**: Where the router hands every decoded envelope

pub mod conn;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod registry;
pub mod router;

pub use conn::{
    AcceptHandler, Conn, FaultInjector, FaultyConn, Host, LocalConn, LocalHost, LocalNetwork,
    PauseGate, StreamConn, TcpHost, TlsContext, TlsHost, Traffic, TrafficSnapshot,
};
pub use dispatch::{Dispatcher, NoopDispatcher, Processor, TypedDispatcher};
pub use error::{
    classify_io, DispatchError, HandshakeError, NetError, NetResult, SendError, SendToAllError,
};
pub use message::{Envelope, Message, MessageTypeId, Packet};
pub use registry::{Registry, SERVER_IDENTITY_NAME};
pub use router::{ErrorHandler, PeerEntry, Router};
