//! Integration tests for the Router send/receive pipeline.
//!
//! Each test wires real routers together over the in-process transport (or
//! loopback TCP) with a dispatcher that forwards every envelope into a
//! channel, then checks what arrives on the other side.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tessera_types::{Address, IdentityId, LocalIdentity, NetworkConfig, ServerIdentity};
use tessera_wire::{
    DispatchError, Dispatcher, Envelope, FaultInjector, Host, LocalNetwork, Message, NetError,
    PauseGate, Registry, Router, TcpHost,
};
use tessera_wire::frame::write_frame;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::EnvFilter;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    seq: u64,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn registry() -> Registry {
    let registry = Registry::new();
    registry.register::<Ping>("test.Ping");
    registry
}

// ---------------------------------------------------------------------------
// Inbox dispatcher, forwards every envelope to the test
// ---------------------------------------------------------------------------

struct Inbox(mpsc::UnboundedSender<Envelope>);

#[async_trait]
impl Dispatcher for Inbox {
    async fn dispatch(&self, envelope: Envelope) -> Result<(), DispatchError> {
        self.0
            .send(envelope)
            .map_err(|e| DispatchError::Processor(e.to_string()))
    }
}

struct Node {
    router: Arc<Router>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    listener: Option<JoinHandle<()>>,
}

impl Node {
    fn id(&self) -> &ServerIdentity {
        self.router.identity()
    }

    async fn start(&mut self) {
        let runner = Arc::clone(&self.router);
        self.listener = Some(tokio::spawn(async move {
            let _ = runner.start().await;
        }));
        assert!(self.router.wait_listening(WAIT).await, "router never listened");
    }

    async fn next(&mut self) -> Envelope {
        tokio::time::timeout(WAIT, self.inbox.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("inbox closed")
    }

    async fn next_seq(&mut self) -> u64 {
        let envelope = self.next().await;
        envelope.message::<Ping>().expect("not a Ping").seq
    }

    async fn shutdown(self) {
        assert_ok!(self.router.stop().await);
        if let Some(listener) = self.listener {
            assert_ok!(tokio::time::timeout(WAIT, listener).await);
        }
    }
}

fn build_node(
    host: Arc<dyn Host>,
    identity: ServerIdentity,
    registry: Registry,
    faults: Option<Arc<dyn FaultInjector>>,
) -> Node {
    let (tx, inbox) = mpsc::unbounded_channel();
    let mut router = Router::new(
        identity,
        host,
        registry,
        Arc::new(Inbox(tx)),
        NetworkConfig::default(),
    );
    if let Some(faults) = faults {
        router = router.with_fault_injector(faults);
    }
    Node {
        router: Arc::new(router),
        inbox,
        listener: None,
    }
}

fn local_node(network: &LocalNetwork, name: &str) -> Node {
    local_node_with_faults(network, name, None)
}

fn local_node_with_faults(
    network: &LocalNetwork,
    name: &str,
    faults: Option<Arc<dyn FaultInjector>>,
) -> Node {
    let registry = registry();
    let address = Address::parse(&format!("local://{name}:2000")).unwrap();
    let identity = LocalIdentity::generate(address.clone());
    let host = network
        .host(address, registry.clone(), NetworkConfig::default())
        .unwrap();
    build_node(Arc::new(host), identity.identity().clone(), registry, faults)
}

async fn tcp_node() -> Node {
    let registry = registry();
    let host = TcpHost::bind(
        Address::parse("tcp://127.0.0.1:0").unwrap(),
        registry.clone(),
        NetworkConfig::default(),
    )
    .await
    .unwrap();
    let identity = LocalIdentity::generate(host.address().clone());
    build_node(Arc::new(host), identity.identity().clone(), registry, None)
}

async fn wait_disconnected(router: &Router, peer: &ServerIdentity) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while router.connection_count(peer) > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "connection to {} never dropped",
            peer.id()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_self_send_before_start() {
    init_tracing();
    let network = LocalNetwork::new();
    let mut node = local_node(&network, "solo");
    let me = node.id().clone();

    let sent = assert_ok!(node.router.send(&me, &[&Ping { seq: 7 }]).await);
    assert_eq!(sent, 0);

    let envelope = node.next().await;
    assert_eq!(envelope.sender, me);
    assert_eq!(envelope.size, 0);
    assert_eq!(envelope.message::<Ping>(), Some(&Ping { seq: 7 }));
    assert_eq!(node.router.connection_count(&me), 0);
    assert_eq!(node.router.tx(), 0);
}

#[tokio::test]
async fn test_messages_arrive_in_call_order() {
    init_tracing();
    let network = LocalNetwork::new();
    let a = local_node(&network, "a");
    let mut b = local_node(&network, "b");
    b.start().await;

    let pings: Vec<Ping> = (0..100).map(|seq| Ping { seq }).collect();
    let msgs: Vec<&dyn Message> = pings.iter().map(|p| p as &dyn Message).collect();
    let sent = assert_ok!(a.router.send(b.id(), &msgs).await);
    assert!(sent > 0);

    for expected in 0..100 {
        let envelope = b.next().await;
        assert_eq!(&envelope.sender, a.id());
        assert!(envelope.size > 0);
        assert_eq!(envelope.message::<Ping>(), Some(&Ping { seq: expected }));
    }
    assert_eq!(a.router.connection_count(b.id()), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_send_to_all_reports_each_failure() {
    init_tracing();
    let network = LocalNetwork::new();
    let a = local_node(&network, "a");
    let mut b = local_node(&network, "b");
    let mut c = local_node(&network, "c");
    b.start().await;
    c.start().await;
    let ghost = LocalIdentity::generate(Address::parse("local://ghost:2000").unwrap());

    let dsts = vec![b.id().clone(), ghost.identity().clone(), c.id().clone()];
    let err = assert_err!(a.router.send_to_all(&dsts, &Ping { seq: 1 }).await);
    assert!(err.bytes_sent > 0);
    assert_eq!(err.failures.len(), 1);
    let (failed, reason) = &err.failures[0];
    assert_eq!(failed, ghost.identity());
    assert!(matches!(reason, NetError::Unreachable(_)));

    assert_eq!(b.next_seq().await, 1);
    assert_eq!(c.next_seq().await, 1);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

// ---------------------------------------------------------------------------
// Connection loss
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_send_retries_after_peer_drop() {
    init_tracing();
    let network = LocalNetwork::new();
    let a = local_node(&network, "a");
    let mut b = local_node(&network, "b");
    b.start().await;

    assert_ok!(a.router.send(b.id(), &[&Ping { seq: 1 }]).await);
    assert_eq!(b.next_seq().await, 1);

    // The peer hangs up; whether or not we have noticed yet, the next send
    // must land on a fresh connection.
    assert_eq!(b.router.close_connections(a.id()).await, 1);
    assert_ok!(a.router.send(b.id(), &[&Ping { seq: 2 }]).await);
    assert_eq!(b.next_seq().await, 2);
    assert_eq!(b.router.connection_count(a.id()), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tcp_reconnects_after_peer_drop() {
    init_tracing();
    let a = tcp_node().await;
    let mut b = tcp_node().await;
    b.start().await;

    assert_ok!(a.router.send(b.id(), &[&Ping { seq: 1 }]).await);
    assert_eq!(b.next_seq().await, 1);

    // Send straight away: a must not trust the connection b hung up on.
    b.router.close_connections(a.id()).await;
    assert_ok!(a.router.send(b.id(), &[&Ping { seq: 2 }]).await);
    assert_eq!(b.next_seq().await, 2);
    assert_eq!(a.router.connection_count(b.id()), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_error_handler_runs_on_lost_connection() {
    init_tracing();
    let network = LocalNetwork::new();
    let a = local_node(&network, "a");
    let mut b = local_node(&network, "b");
    b.start().await;

    let (lost_tx, mut lost) = mpsc::unbounded_channel::<IdentityId>();
    b.router.add_error_handler(move |peer| {
        let _ = lost_tx.send(peer.id());
    });
    let (a_lost_tx, mut a_lost) = mpsc::unbounded_channel::<IdentityId>();
    a.router.add_error_handler(move |peer| {
        let _ = a_lost_tx.send(peer.id());
    });

    assert_ok!(a.router.send(b.id(), &[&Ping { seq: 1 }]).await);
    assert_eq!(b.next_seq().await, 1);

    // Closing on purpose is silent; the far side sees end of stream.
    a.router.close_connections(b.id()).await;
    let reported = tokio::time::timeout(WAIT, lost.recv()).await.unwrap();
    assert_eq!(reported, Some(a.id().id()));
    assert!(a_lost.try_recv().is_err());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_oversized_frame_drops_connection() {
    init_tracing();
    let mut b = tcp_node().await;
    b.start().await;
    let (lost_tx, mut lost) = mpsc::unbounded_channel::<IdentityId>();
    b.router.add_error_handler(move |peer| {
        let _ = lost_tx.send(peer.id());
    });

    // A raw peer: valid identity frame, then a length prefix far above the limit.
    let rogue = LocalIdentity::generate(Address::parse("tcp://127.0.0.1:1").unwrap());
    let mut stream = TcpStream::connect(b.router.address().network_address())
        .await
        .unwrap();
    let body = registry().marshal(rogue.identity()).unwrap();
    assert_ok!(write_frame(&mut stream, &body, u32::MAX).await);
    stream.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    let reported = tokio::time::timeout(WAIT, lost.recv()).await.unwrap();
    assert_eq!(reported, Some(rogue.identity().id()));
    assert_eq!(b.router.connection_count(rogue.identity()), 0);
    assert!(b.inbox.try_recv().is_err());

    b.shutdown().await;
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stop_under_concurrent_senders() {
    init_tracing();
    let network = LocalNetwork::new();
    let a = local_node(&network, "a");
    let mut b = local_node(&network, "b");
    b.start().await;

    let mut senders = Vec::new();
    for worker in 0..8u64 {
        let router = Arc::clone(&a.router);
        let dst = b.id().clone();
        senders.push(tokio::spawn(async move {
            for i in 0..200u64 {
                let ping = Ping {
                    seq: worker * 1000 + i,
                };
                if let Err(e) = router.send(&dst, &[&ping]).await {
                    if matches!(e.error, NetError::RouterClosed) {
                        break;
                    }
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    // Let some traffic through before pulling the plug.
    b.next().await;
    let a_router = Arc::clone(&a.router);
    let b_router = Arc::clone(&b.router);
    let (stop_a, stop_b) = tokio::join!(
        tokio::time::timeout(WAIT, a_router.stop()),
        tokio::time::timeout(WAIT, b_router.stop()),
    );
    assert_ok!(assert_ok!(stop_a));
    assert_ok!(assert_ok!(stop_b));

    for sender in senders {
        assert_ok!(tokio::time::timeout(WAIT, sender).await.unwrap());
    }

    assert_eq!(a.router.active_workers(), 0);
    assert_eq!(b.router.active_workers(), 0);
    assert!(a.router.peers().is_empty());
    assert!(b.router.peers().is_empty());

    let err = assert_err!(a.router.send(b.id(), &[&Ping { seq: 0 }]).await);
    assert!(matches!(err.error, NetError::RouterClosed));
}

#[tokio::test]
async fn test_paused_receiver_drops_connections_on_unpause() {
    init_tracing();
    let network = LocalNetwork::new();
    let gate = PauseGate::new();
    let a = local_node(&network, "a");
    let mut b = local_node_with_faults(&network, "b", Some(Arc::new(gate.clone())));
    b.start().await;

    let (lost_tx, mut lost) = mpsc::unbounded_channel::<IdentityId>();
    b.router.add_error_handler(move |peer| {
        let _ = lost_tx.send(peer.id());
    });

    gate.pause();
    assert_ok!(a.router.send(b.id(), &[&Ping { seq: 1 }]).await);
    let wait = tokio::time::timeout(Duration::from_millis(200), b.inbox.recv()).await;
    assert!(wait.is_err(), "paused router delivered a message");

    gate.unpause();
    wait_disconnected(&b.router, a.id()).await;
    assert!(lost.try_recv().is_err());

    // The gate is open again: a new connection delivers normally.
    wait_disconnected(&a.router, b.id()).await;
    assert_ok!(a.router.send(b.id(), &[&Ping { seq: 2 }]).await);
    assert_eq!(b.next_seq().await, 2);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_pause_freezes_established_connection() {
    init_tracing();
    let network = LocalNetwork::new();
    let gate = PauseGate::new();
    let a = local_node(&network, "a");
    let mut b = local_node_with_faults(&network, "b", Some(Arc::new(gate.clone())));
    b.start().await;

    let (lost_tx, mut lost) = mpsc::unbounded_channel::<IdentityId>();
    b.router.add_error_handler(move |peer| {
        let _ = lost_tx.send(peer.id());
    });

    assert_ok!(a.router.send(b.id(), &[&Ping { seq: 1 }]).await);
    assert_eq!(b.next_seq().await, 1);

    // b's receive loop is already waiting on this connection.
    gate.pause();
    assert_ok!(a.router.send(b.id(), &[&Ping { seq: 2 }]).await);
    let wait = tokio::time::timeout(Duration::from_millis(200), b.inbox.recv()).await;
    assert!(wait.is_err(), "paused router delivered a message");

    gate.unpause();
    wait_disconnected(&b.router, a.id()).await;
    assert!(lost.try_recv().is_err());
    assert!(b.inbox.try_recv().is_err());

    wait_disconnected(&a.router, b.id()).await;
    assert_ok!(a.router.send(b.id(), &[&Ping { seq: 3 }]).await);
    assert_eq!(b.next_seq().await, 3);

    a.shutdown().await;
    b.shutdown().await;
}

// ---------------------------------------------------------------------------
// Accounting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_traffic_survives_disconnect() {
    init_tracing();
    let network = LocalNetwork::new();
    let a = local_node(&network, "a");
    let mut b = local_node(&network, "b");
    b.start().await;

    let sent = assert_ok!(
        a.router
            .send(b.id(), &[&Ping { seq: 1 }, &Ping { seq: 2 }, &Ping { seq: 3 }])
            .await
    );
    for _ in 0..3 {
        b.next().await;
    }

    // Identity frame plus three pings.
    assert_eq!(a.router.msgs_tx(), 4);
    assert!(a.router.tx() > sent);
    let before = a.router.traffic();

    a.router.close_connections(b.id()).await;
    wait_disconnected(&b.router, a.id()).await;

    assert_eq!(a.router.traffic(), before);
    assert_eq!(b.router.msgs_rx(), 4);
    assert_eq!(b.router.rx(), a.router.tx());

    let peers = b.router.peers();
    assert!(peers.is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_peers_snapshot() {
    init_tracing();
    let network = LocalNetwork::new();
    let a = local_node(&network, "a");
    let mut b = local_node(&network, "b");
    b.start().await;

    assert_ok!(a.router.send(b.id(), &[&Ping { seq: 1 }]).await);
    b.next().await;

    let peers = a.router.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(&peers[0].identity, b.id());
    assert_eq!(peers[0].connections, 1);

    let inbound = b.router.peers();
    assert_eq!(inbound.len(), 1);
    assert_eq!(&inbound[0].identity, a.id());

    a.shutdown().await;
    b.shutdown().await;
}
