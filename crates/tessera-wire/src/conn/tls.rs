//! TLS transport with certificates bound to node keys.
//!
//! Every node self-signs a certificate with its own Ed25519 key, so the
//! certificate's subject public key *is* the node key. Both sides present a
//! certificate. Chain and name validation are replaced by a key check done
//! after the TLS handshake (see [`crate::handshake`]); handshake signatures are
//! still verified normally, which proves the peer holds the certified key.

use crate::conn::stream::StreamConn;
use crate::conn::tcp::TcpCore;
use crate::conn::{AcceptHandler, Conn, Host};
use crate::error::{NetError, NetResult};
use crate::registry::Registry;
use async_trait::async_trait;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::sync::Arc;
use tessera_types::{Address, ConnType, NetworkConfig, PublicKey, ServerIdentity};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, warn};

/// Name put in every certificate and sent as SNI. Never validated.
pub const TLS_SERVER_NAME: &str = "tessera.node";

/// Self-sign a certificate for `signing_key`.
pub fn self_signed_certificate(signing_key: &SigningKey) -> NetResult<CertificateDer<'static>> {
    let (certificate, _) = certificate_and_key(signing_key)?;
    Ok(certificate)
}

fn certificate_and_key(
    signing_key: &SigningKey,
) -> NetResult<(CertificateDer<'static>, PrivatePkcs8KeyDer<'static>)> {
    let document = signing_key
        .to_pkcs8_der()
        .map_err(|e| NetError::Tls(format!("failed to encode node key: {e}")))?;
    let pkcs8 = PrivatePkcs8KeyDer::from(document.as_bytes().to_vec());

    let key_pair = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, &rcgen::PKCS_ED25519)
        .map_err(|e| NetError::Tls(format!("failed to load node key: {e}")))?;
    let params = rcgen::CertificateParams::new(vec![TLS_SERVER_NAME.to_string()])
        .map_err(|e| NetError::Tls(format!("invalid certificate params: {e}")))?;
    let certificate = params
        .self_signed(&key_pair)
        .map_err(|e| NetError::Tls(format!("failed to generate self-signed cert: {e}")))?;

    Ok((certificate.der().clone(), pkcs8))
}

/// Read the Ed25519 subject key out of a DER certificate.
pub fn certificate_key(certificate: &CertificateDer<'_>) -> NetResult<PublicKey> {
    let (_, parsed) = x509_parser::parse_x509_certificate(certificate.as_ref())
        .map_err(|e| NetError::Tls(format!("unparseable certificate: {e}")))?;
    let key = parsed.public_key().subject_public_key.data.as_ref();
    PublicKey::from_bytes(key).map_err(|e| NetError::Tls(e.to_string()))
}

/// Accepts any certificate carrying a valid Ed25519 key and checks handshake
/// signatures against it. Which key is acceptable is decided later, by the
/// identity handshake.
#[derive(Debug)]
struct KeyBoundVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl KeyBoundVerifier {
    fn check(&self, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        certificate_key(end_entity)
            .map(|_| ())
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))
    }
}

impl ServerCertVerifier for KeyBoundVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for KeyBoundVerifier {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Acceptor and connector built from one node key.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    public: PublicKey,
}

impl TlsContext {
    pub fn new(signing_key: &SigningKey) -> NetResult<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(KeyBoundVerifier {
            algorithms: provider.signature_verification_algorithms,
        });
        let (certificate, key) = certificate_and_key(signing_key)?;

        let server = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| NetError::Tls(e.to_string()))?
            .with_client_cert_verifier(verifier.clone())
            .with_single_cert(vec![certificate.clone()], PrivateKeyDer::Pkcs8(key.clone_key()))
            .map_err(|e| NetError::Tls(e.to_string()))?;

        let client = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| NetError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(vec![certificate], PrivateKeyDer::Pkcs8(key))
            .map_err(|e| NetError::Tls(e.to_string()))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
            public: PublicKey::from(&signing_key.verifying_key()),
        })
    }

    /// Key this context's certificate is bound to.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }
}

/// Host for the `tls://` transport.
pub struct TlsHost {
    core: TcpCore,
    registry: Registry,
    tls: TlsContext,
}

impl TlsHost {
    pub async fn bind(
        address: Address,
        signing_key: &SigningKey,
        registry: Registry,
        config: NetworkConfig,
    ) -> NetResult<Self> {
        let listen_on = address.network_address().to_string();
        Self::bind_with_listen_addr(address, &listen_on, signing_key, registry, config).await
    }

    /// Bind on `listen_on` while advertising `public`.
    pub async fn bind_with_listen_addr(
        public: Address,
        listen_on: &str,
        signing_key: &SigningKey,
        registry: Registry,
        config: NetworkConfig,
    ) -> NetResult<Self> {
        let tls = TlsContext::new(signing_key)?;
        let core = TcpCore::bind(public, listen_on, ConnType::Tls, config).await?;
        Ok(Self {
            core,
            registry,
            tls,
        })
    }

    fn wrap(
        &self,
        stream: TlsStream<TcpStream>,
        peer_key: Option<PublicKey>,
        local: Address,
        remote: Address,
    ) -> Arc<dyn Conn> {
        wrap_tls(
            stream,
            peer_key,
            local,
            remote,
            self.registry.clone(),
            self.core.config(),
        )
    }
}

fn wrap_tls(
    stream: TlsStream<TcpStream>,
    peer_key: Option<PublicKey>,
    local: Address,
    remote: Address,
    registry: Registry,
    config: &NetworkConfig,
) -> Arc<dyn Conn> {
    let conn = StreamConn::new(stream, local, remote, registry, config);
    match peer_key {
        Some(key) => Arc::new(conn.with_peer_key(key)),
        None => Arc::new(conn),
    }
}

fn first_certificate_key(certificates: Option<&[CertificateDer<'static>]>) -> Option<PublicKey> {
    certificates
        .and_then(|certs| certs.first())
        .and_then(|cert| certificate_key(cert).ok())
}

#[async_trait]
impl Host for TlsHost {
    async fn listen(&self, on_accept: AcceptHandler) -> NetResult<()> {
        let mut handshakes: JoinSet<()> = JoinSet::new();
        let deadline = self.core.config().handshake_timeout();
        let local = self.core.address().clone();

        let result = self
            .core
            .accept_loop(|stream, peer| {
                while handshakes.try_join_next().is_some() {}

                let acceptor = self.tls.acceptor.clone();
                let on_accept = Arc::clone(&on_accept);
                let registry = self.registry.clone();
                let config = self.core.config().clone();
                let local = local.clone();
                let mut stopped = self.core.stop_signal();
                handshakes.spawn(async move {
                    let accepted = tokio::select! {
                        result = tokio::time::timeout(deadline, acceptor.accept(stream)) => result,
                        _ = crate::conn::stream::wait_closed(&mut stopped) => return,
                    };
                    match accepted {
                        Ok(Ok(tls)) => {
                            let peer_key = first_certificate_key(tls.get_ref().1.peer_certificates());
                            let remote = Address::from_socket_addr(ConnType::Tls, peer);
                            on_accept(wrap_tls(
                                TlsStream::Server(tls),
                                peer_key,
                                local,
                                remote,
                                registry,
                                &config,
                            ));
                        }
                        Ok(Err(e)) => warn!(peer = %peer, error = %e, "TLS accept failed"),
                        Err(_) => warn!(peer = %peer, "TLS accept timed out"),
                    }
                });
            })
            .await;

        handshakes.shutdown().await;
        result
    }

    async fn connect(&self, peer: &ServerIdentity) -> NetResult<Arc<dyn Conn>> {
        let address = peer.address();
        if address.conn_type() != ConnType::Tls {
            return Err(NetError::WrongTransport(address.clone()));
        }
        let stream = self.core.dial(address).await?;
        let local = match stream.local_addr() {
            Ok(addr) => Address::from_socket_addr(ConnType::Tls, addr),
            Err(_) => self.core.address().clone(),
        };

        let server_name = ServerName::try_from(TLS_SERVER_NAME)
            .map_err(|e| NetError::Tls(e.to_string()))?;
        let deadline = self.core.config().handshake_timeout();
        let tls = match tokio::time::timeout(
            deadline,
            self.tls.connector.connect(server_name, stream),
        )
        .await
        {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                debug!(peer = %address, error = %e, "TLS connect failed");
                return Err(NetError::Tls(e.to_string()));
            }
            Err(_) => return Err(NetError::Timeout),
        };

        let peer_key = first_certificate_key(tls.get_ref().1.peer_certificates());
        Ok(self.wrap(TlsStream::Client(tls), peer_key, local, address.clone()))
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
