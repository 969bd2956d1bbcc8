//! Message registry: maps Rust types to stable wire type ids.
//!
//! A [`Registry`] is a write-once, bidirectional table between concrete
//! message types and [`MessageTypeId`]s. It owns the encode/decode functions
//! for every registered type and is shared (cheaply cloned) by every host and
//! router that speaks the same protocol. Registration mistakes are programming
//! errors and panic; data errors surface as [`NetError`].

use crate::error::{NetError, NetResult};
use crate::message::{Message, MessageTypeId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tessera_types::ServerIdentity;

/// Registration name of the identity message every registry knows.
pub const SERVER_IDENTITY_NAME: &str = "tessera.ServerIdentity";

type EncodeFn = fn(&dyn Message) -> NetResult<Vec<u8>>;
type DecodeFn = fn(&[u8]) -> NetResult<Box<dyn Message>>;

#[derive(Clone)]
struct Entry {
    name: String,
    rust_type: TypeId,
    rust_name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<MessageTypeId, Entry>,
    by_type: HashMap<TypeId, MessageTypeId>,
    sealed: bool,
}

/// Thread-safe table of registered message types.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

fn encode_as<T: Message + Serialize>(msg: &dyn Message) -> NetResult<Vec<u8>> {
    let value = msg
        .downcast_ref::<T>()
        .ok_or_else(|| NetError::Encode(format!("value is not a {}", std::any::type_name::<T>())))?;
    rmp_serde::to_vec_named(value).map_err(|e| NetError::Encode(e.to_string()))
}

fn decode_as<T: Message + DeserializeOwned>(bytes: &[u8]) -> NetResult<Box<dyn Message>> {
    let value: T = rmp_serde::from_slice(bytes).map_err(|e| NetError::Decode(e.to_string()))?;
    Ok(Box::new(value))
}

/// Short description of an unregistered value for error messages.
fn describe(msg: &dyn Message) -> String {
    let text = format!("{msg:?}");
    if text.chars().count() > 64 {
        let head: String = text.chars().take(64).collect();
        format!("{head}…")
    } else {
        text
    }
}

impl Registry {
    /// Create a registry that already knows [`ServerIdentity`].
    pub fn new() -> Self {
        let registry = Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        };
        registry.register::<ServerIdentity>(SERVER_IDENTITY_NAME);
        registry
    }

    /// Register `T` under `name` and return its type id.
    ///
    /// Registering the same pair again returns the same id.
    ///
    /// # Panics
    ///
    /// If `name` is bound to another type, `T` is bound to another name, or
    /// the registry is sealed.
    pub fn register<T>(&self, name: &str) -> MessageTypeId
    where
        T: Message + Serialize + DeserializeOwned,
    {
        let id = MessageTypeId::from_name(name);
        let rust_type = TypeId::of::<T>();
        let rust_name = std::any::type_name::<T>();

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = inner.by_id.get(&id) {
            if existing.rust_type == rust_type && existing.name == name {
                return id;
            }
            panic!(
                "message name '{name}' is already bound to {}, cannot bind it to {rust_name}",
                existing.rust_name
            );
        }
        if let Some(existing_id) = inner.by_type.get(&rust_type) {
            let existing = inner
                .by_id
                .get(existing_id)
                .map(|e| e.name.clone())
                .unwrap_or_default();
            panic!("type {rust_name} is already registered as '{existing}', cannot register it as '{name}'");
        }
        if inner.sealed {
            panic!("registry is sealed, cannot register '{name}'");
        }

        inner.by_type.insert(rust_type, id);
        inner.by_id.insert(
            id,
            Entry {
                name: name.to_string(),
                rust_type,
                rust_name,
                encode: encode_as::<T>,
                decode: decode_as::<T>,
            },
        );
        id
    }

    /// Refuse any further registration.
    pub fn seal(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.sealed
    }

    /// Number of registered types, the identity message included.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Type id of a registered value.
    pub fn message_type(&self, msg: &dyn Message) -> Option<MessageTypeId> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_type.get(&msg.as_any().type_id()).copied()
    }

    /// Type id registered for `T`.
    pub fn type_id_of<T: Message>(&self) -> Option<MessageTypeId> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Registration name of a type id.
    pub fn type_name(&self, id: MessageTypeId) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_id.get(&id).map(|e| e.name.clone())
    }

    /// Encode `msg` as its 16-byte type id followed by the MessagePack payload.
    pub fn marshal(&self, msg: &dyn Message) -> NetResult<Vec<u8>> {
        let (id, encode) = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            let id = inner
                .by_type
                .get(&msg.as_any().type_id())
                .copied()
                .ok_or_else(|| NetError::UnregisteredType(describe(msg)))?;
            let encode = inner
                .by_id
                .get(&id)
                .map(|e| e.encode)
                .ok_or_else(|| NetError::UnregisteredType(id.to_string()))?;
            (id, encode)
        };

        let payload = encode(msg)?;
        let mut bytes = Vec::with_capacity(MessageTypeId::LEN + payload.len());
        bytes.extend_from_slice(&id.to_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Decode a frame body produced by [`marshal`](Self::marshal).
    pub fn unmarshal(&self, bytes: &[u8]) -> NetResult<(MessageTypeId, Box<dyn Message>)> {
        if bytes.len() < MessageTypeId::LEN {
            return Err(NetError::Decode(format!(
                "frame of {} bytes is shorter than the type id",
                bytes.len()
            )));
        }
        let (head, payload) = bytes.split_at(MessageTypeId::LEN);
        let mut raw = [0u8; MessageTypeId::LEN];
        raw.copy_from_slice(head);
        let id = MessageTypeId::from_bytes(raw);

        let decode = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            inner
                .by_id
                .get(&id)
                .map(|e| e.decode)
                .ok_or_else(|| NetError::UnregisteredType(id.to_string()))?
        };
        Ok((id, decode(payload)?))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<&str> = inner.by_id.values().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        f.debug_struct("Registry")
            .field("types", &names)
            .field("sealed", &inner.sealed)
            .finish()
    }
}
