//! Identity handshake run on every fresh connection.
//!
//! The dialer's first frame is its [`ServerIdentity`]; the acceptor refuses
//! anything else. On TLS connections each side also checks that the key in
//! the peer's certificate is the key of the identity it is talking to, which
//! is what makes a certificate-bound identity unforgeable.

use crate::conn::Conn;
use crate::error::{HandshakeError, NetError, NetResult};
use tessera_types::{ConnType, ServerIdentity};
use tracing::debug;

/// Compare the certificate key of a TLS connection with `claimed`.
fn verify_certificate(conn: &dyn Conn, claimed: &ServerIdentity) -> NetResult<()> {
    if conn.conn_type() != ConnType::Tls {
        return Ok(());
    }
    let certified = conn
        .peer_certificate_key()
        .ok_or(HandshakeError::MissingCertificate)?;
    if &certified != claimed.public() {
        return Err(HandshakeError::IdentityMismatch {
            claimed: claimed.id(),
            certified: certified.to_hex(),
        }
        .into());
    }
    Ok(())
}

/// Dialer side: check who answered, then announce ourselves.
///
/// Returns the bytes sent.
pub async fn dial(
    conn: &dyn Conn,
    local: &ServerIdentity,
    expected: &ServerIdentity,
) -> NetResult<u64> {
    verify_certificate(conn, expected)?;
    let sent = conn.send(local).await?;
    debug!(peer = %expected.id(), addr = %conn.remote(), "Sent identity");
    Ok(sent)
}

/// Acceptor side: read the peer's identity and check it against its
/// certificate.
///
/// A first frame of an unknown type, or one that fails to decode, counts as
/// a wrong first message.
pub async fn accept(conn: &dyn Conn) -> NetResult<ServerIdentity> {
    let packet = conn.receive().await.map_err(|e| match e {
        NetError::UnregisteredType(what) | NetError::Decode(what) => {
            HandshakeError::WrongFirstMessage(what).into()
        }
        other => other,
    })?;
    let identity = packet
        .msg
        .downcast_ref::<ServerIdentity>()
        .cloned()
        .ok_or_else(|| {
            NetError::from(HandshakeError::WrongFirstMessage(
                packet.msg_type.to_string(),
            ))
        })?;
    verify_certificate(conn, &identity)?;
    debug!(peer = %identity.id(), addr = %conn.remote(), "Received identity");
    Ok(identity)
}
