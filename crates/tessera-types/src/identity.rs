//! Node identities.
//!
//! A node is known to its peers by an Ed25519 public key. The [`ServerIdentity`]
//! bundles that key with the address the node listens on and is what peers
//! exchange as the first frame of every connection. [`LocalIdentity`] is the
//! node's own view, which also holds the signing key.

use crate::address::Address;
use crate::error::{TypesError, TypesResult};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Prefix hashed together with the hex public key to derive an [`IdentityId`].
const IDENTITY_NAMESPACE: &str = "tessera://identity/";

/// An Ed25519 public key, validated on construction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Build from raw bytes. Rejects byte strings that are not a curve point.
    pub fn from_bytes(bytes: &[u8]) -> TypesResult<Self> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            TypesError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| TypesError::InvalidKey(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Parse the hex text form.
    pub fn from_hex(text: &str) -> TypesResult<Self> {
        let bytes = hex::decode(text).map_err(|e| TypesError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex text form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Check an Ed25519 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> TypesResult<()> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| TypesError::InvalidKey(e.to_string()))?;
        let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| {
            TypesError::InvalidSignature(format!(
                "expected 64 bytes, got {}",
                signature.len()
            ))
        })?;
        key.verify(message, &Signature::from_bytes(&sig_bytes))
            .map_err(|e| TypesError::InvalidSignature(e.to_string()))
    }
}

impl From<&VerifyingKey> for PublicKey {
    fn from(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl TryFrom<String> for PublicKey {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.to_hex()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}…)", &self.to_hex()[..12])
    }
}

/// Stable 128-bit identifier derived from a public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(pub Uuid);

impl IdentityId {
    /// Derive the id for a public key. Same key, same id, on every node.
    pub fn from_public(public: &PublicKey) -> Self {
        let name = format!("{IDENTITY_NAMESPACE}{}", public.to_hex());
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()))
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named secondary key a node publishes for one of its services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Service name, unique within one server identity.
    pub name: String,
    /// The service's public key.
    pub public: PublicKey,
}

/// The public identity of a node, as exchanged on the wire.
///
/// Equality and hashing use the derived [`IdentityId`] only.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "RawServerIdentity")]
pub struct ServerIdentity {
    public: PublicKey,
    #[serde(default)]
    service_identities: Vec<ServiceIdentity>,
    address: Address,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(skip_serializing)]
    id: IdentityId,
}

/// Wire form of [`ServerIdentity`]; the id is recomputed from the key.
#[derive(Deserialize)]
struct RawServerIdentity {
    public: PublicKey,
    #[serde(default)]
    service_identities: Vec<ServiceIdentity>,
    address: Address,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    description: String,
}

impl From<RawServerIdentity> for ServerIdentity {
    fn from(raw: RawServerIdentity) -> Self {
        Self {
            id: IdentityId::from_public(&raw.public),
            public: raw.public,
            service_identities: raw.service_identities,
            address: raw.address,
            url: raw.url,
            description: raw.description,
        }
    }
}

impl ServerIdentity {
    pub fn new(public: PublicKey, address: Address) -> Self {
        Self {
            id: IdentityId::from_public(&public),
            public,
            service_identities: Vec::new(),
            address,
            url: None,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Add or replace a service identity.
    pub fn with_service(mut self, name: impl Into<String>, public: PublicKey) -> Self {
        let name = name.into();
        self.service_identities.retain(|s| s.name != name);
        self.service_identities.push(ServiceIdentity { name, public });
        self
    }

    pub fn id(&self) -> IdentityId {
        self.id
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn service_identities(&self) -> &[ServiceIdentity] {
        &self.service_identities
    }

    /// Public key of the named service, if the node publishes one.
    pub fn service_public(&self, name: &str) -> Option<&PublicKey> {
        self.service_identities
            .iter()
            .find(|s| s.name == name)
            .map(|s| &s.public)
    }

    /// Check a signature made by this node's main key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> TypesResult<()> {
        self.public.verify(message, signature)
    }
}

impl PartialEq for ServerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServerIdentity {}

impl Hash for ServerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("public", &self.public)
            .finish()
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.id)
    }
}

/// A node's own identity, including its private keys.
///
/// Never serialized. `SigningKey` zeroizes itself on drop.
pub struct LocalIdentity {
    identity: ServerIdentity,
    signing_key: SigningKey,
    service_keys: BTreeMap<String, SigningKey>,
}

impl LocalIdentity {
    /// Generate a fresh key pair for a node listening on `address`.
    pub fn generate(address: Address) -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng), address)
    }

    pub fn from_signing_key(signing_key: SigningKey, address: Address) -> Self {
        let public = PublicKey::from(&signing_key.verifying_key());
        Self {
            identity: ServerIdentity::new(public, address),
            signing_key,
            service_keys: BTreeMap::new(),
        }
    }

    /// Replace the advertised address, keeping the keys.
    ///
    /// Used once a host has bound and knows its real port.
    pub fn with_address(mut self, address: Address) -> Self {
        self.identity.address = address;
        self
    }

    /// Generate a key for a named service and publish it in the identity.
    pub fn add_service(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        let key = SigningKey::generate(&mut OsRng);
        let public = PublicKey::from(&key.verifying_key());
        self.identity = self.identity.with_service(name.clone(), public);
        self.service_keys.insert(name, key);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.identity = self.identity.with_description(description);
        self
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Sign with the node's main key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Sign with a service key. `None` if the service is unknown.
    pub fn sign_as_service(&self, service: &str, message: &[u8]) -> Option<Vec<u8>> {
        self.service_keys
            .get(service)
            .map(|key| key.sign(message).to_bytes().to_vec())
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("identity", &self.identity)
            .field("signing_key", &"<redacted>")
            .field("services", &self.service_keys.keys().collect::<Vec<_>>())
            .finish()
    }
}
