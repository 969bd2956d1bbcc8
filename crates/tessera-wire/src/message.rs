//! Message values carried over connections.
//!
//! Any `Clone + Send + Sync + Debug + 'static` type is a [`Message`]; to travel
//! over the network it must also be registered with a
//! [`Registry`](crate::Registry) under a stable name, which fixes its
//! [`MessageTypeId`].

use std::any::Any;
use std::fmt;
use tessera_types::ServerIdentity;
use uuid::Uuid;

/// Prefix hashed together with a registration name to derive a type id.
const MESSAGE_NAMESPACE: &str = "tessera://message/";

/// A value that can be sent through a connection or the router.
pub trait Message: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;

    /// Deep copy behind a fresh box. Used by self-send.
    fn clone_message(&self) -> Box<dyn Message>;
}

impl<T> Message for T
where
    T: Any + Clone + Send + Sync + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_message(&self) -> Box<dyn Message> {
        Box::new(self.clone())
    }
}

impl<'a> dyn Message + 'a {
    /// Borrow the concrete value if it is a `T`.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: Message>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Stable identifier of a registered message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageTypeId(pub Uuid);

impl MessageTypeId {
    /// Size of the id on the wire.
    pub const LEN: usize = 16;

    /// Derive the id for a registration name. Same name, same id, everywhere.
    pub fn from_name(name: &str) -> Self {
        let scoped = format!("{MESSAGE_NAMESPACE}{name}");
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, scoped.as_bytes()))
    }

    /// Big-endian wire form.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        *self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for MessageTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded frame as read from one connection.
#[derive(Debug)]
pub struct Packet {
    pub msg_type: MessageTypeId,
    pub msg: Box<dyn Message>,
    /// Bytes read for this frame, length prefix included.
    pub size: u64,
}

/// A decoded message together with the identity that sent it.
///
/// Built by the router's receive path and by self-send.
#[derive(Debug)]
pub struct Envelope {
    pub sender: ServerIdentity,
    pub msg_type: MessageTypeId,
    pub msg: Box<dyn Message>,
    /// Bytes read for this frame. Zero for self-sent messages.
    pub size: u64,
}

impl Envelope {
    pub fn from_packet(sender: ServerIdentity, packet: Packet) -> Self {
        Self {
            sender,
            msg_type: packet.msg_type,
            msg: packet.msg,
            size: packet.size,
        }
    }

    /// Borrow the payload as a `T`.
    pub fn message<T: Message>(&self) -> Option<&T> {
        self.msg.downcast_ref::<T>()
    }
}

impl Clone for Envelope {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            msg_type: self.msg_type,
            msg: self.msg.clone_message(),
            size: self.size,
        }
    }
}
