//! TLS transport tests: key-bound certificates and identity mismatches.
//!
//! Nodes talk over loopback TLS. A "rogue" is a bare TLS host whose
//! certificate key differs from the identity it claims or answers for.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tessera_types::{Address, LocalIdentity, NetworkConfig, ServerIdentity};
use tessera_wire::{
    handshake, Conn, DispatchError, Dispatcher, Envelope, HandshakeError, Host, NetError,
    Registry, Router, TlsHost,
};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::EnvFilter;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Greeting {
    text: String,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn registry() -> Registry {
    let registry = Registry::new();
    registry.register::<Greeting>("test.Greeting");
    registry
}

struct Inbox(mpsc::UnboundedSender<Envelope>);

#[async_trait]
impl Dispatcher for Inbox {
    async fn dispatch(&self, envelope: Envelope) -> Result<(), DispatchError> {
        self.0
            .send(envelope)
            .map_err(|e| DispatchError::Processor(e.to_string()))
    }
}

/// Bind a TLS host on an ephemeral loopback port for a fresh key.
async fn tls_host() -> (TlsHost, LocalIdentity) {
    let unbound = LocalIdentity::generate(Address::parse("tls://127.0.0.1:0").unwrap());
    let host = TlsHost::bind(
        unbound.identity().address().clone(),
        unbound.signing_key(),
        registry(),
        NetworkConfig::default(),
    )
    .await
    .unwrap();
    let identity = unbound.with_address(host.address().clone());
    (host, identity)
}

async fn tls_router() -> (Arc<Router>, mpsc::UnboundedReceiver<Envelope>) {
    let (host, identity) = tls_host().await;
    let (tx, inbox) = mpsc::unbounded_channel();
    let router = Arc::new(Router::new(
        identity.identity().clone(),
        Arc::new(host),
        registry(),
        Arc::new(Inbox(tx)),
        NetworkConfig::default(),
    ));
    let runner = Arc::clone(&router);
    tokio::spawn(async move {
        let _ = runner.start().await;
    });
    assert!(router.wait_listening(WAIT).await);
    (router, inbox)
}

#[tokio::test]
async fn test_tls_routers_exchange_messages() {
    init_tracing();
    let (a, mut a_inbox) = tls_router().await;
    let (b, mut b_inbox) = tls_router().await;

    let hello = Greeting {
        text: "hello over tls".into(),
    };
    assert_ok!(a.send(b.identity(), &[&hello]).await);
    let got = tokio::time::timeout(WAIT, b_inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&got.sender, a.identity());
    assert_eq!(got.message::<Greeting>(), Some(&hello));

    // The reply reuses nothing: b dials a on its own.
    let reply = Greeting {
        text: "and back".into(),
    };
    assert_ok!(b.send(a.identity(), &[&reply]).await);
    let got = tokio::time::timeout(WAIT, a_inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.message::<Greeting>(), Some(&reply));

    assert_ok!(a.stop().await);
    assert_ok!(b.stop().await);
    assert_eq!(a.active_workers(), 0);
    assert_eq!(b.active_workers(), 0);
}

#[tokio::test]
async fn test_acceptor_rejects_forged_identity() {
    init_tracing();
    let (victim, mut victim_inbox) = tls_router().await;

    // The rogue presents its own certificate but claims someone else.
    let (rogue_host, _rogue) = tls_host().await;
    let impersonated = LocalIdentity::generate(rogue_host.address().clone());

    let conn = assert_ok!(rogue_host.connect(victim.identity()).await);
    assert_ok!(handshake::dial(conn.as_ref(), impersonated.identity(), victim.identity()).await);

    // The victim hangs up instead of registering the forged identity.
    let read = tokio::time::timeout(WAIT, conn.receive()).await.unwrap();
    assert!(read.is_err());
    assert_eq!(victim.connection_count(impersonated.identity()), 0);
    assert!(victim.peers().is_empty());
    assert!(victim_inbox.try_recv().is_err());

    let _ = conn.close().await;
    assert_ok!(victim.stop().await);
}

#[tokio::test]
async fn test_dialer_rejects_wrong_certificate() {
    init_tracing();
    let (dialer, _inbox) = tls_router().await;

    // Something answers at the address, but with a key other than the one
    // the dialer expects there.
    let (rogue_host, _rogue) = tls_host().await;
    let rogue_host = Arc::new(rogue_host);
    let listener = Arc::clone(&rogue_host);
    tokio::spawn(async move {
        let _ = listener.listen(Arc::new(|_conn: Arc<dyn Conn>| {})).await;
    });
    let expected = LocalIdentity::generate(rogue_host.address().clone());
    let deadline = tokio::time::Instant::now() + WAIT;
    while !rogue_host.listening() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let msg = Greeting { text: "hi".into() };
    let err = assert_err!(dialer.send(expected.identity(), &[&msg]).await);
    assert_eq!(err.bytes_sent, 0);
    assert!(matches!(
        err.error,
        NetError::Handshake(HandshakeError::IdentityMismatch { .. })
    ));
    assert_eq!(dialer.connection_count(expected.identity()), 0);

    assert_ok!(dialer.stop().await);
    assert_ok!(rogue_host.stop().await);
}

#[tokio::test]
async fn test_tls_host_refuses_other_transports() {
    let (host, _identity) = tls_host().await;
    let local_peer: ServerIdentity =
        LocalIdentity::generate(Address::parse("local://elsewhere:1").unwrap())
            .identity()
            .clone();
    let result = host.connect(&local_peer).await;
    assert!(matches!(result, Err(NetError::WrongTransport(_))));
}
