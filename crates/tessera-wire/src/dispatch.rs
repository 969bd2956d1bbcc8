//! Dispatchers: where the router delivers decoded envelopes.
//!
//! The router calls [`Dispatcher::dispatch`] once per inbound envelope, in
//! arrival order per connection. An error is logged by the router and does
//! not close the connection.

use crate::error::DispatchError;
use crate::message::{Envelope, Message, MessageTypeId};
use crate::registry::Registry;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

/// Sink for every envelope a router receives.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, envelope: Envelope) -> Result<(), DispatchError>;
}

/// Handler for one or more message types in a [`TypedDispatcher`].
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, envelope: Envelope) -> Result<(), DispatchError>;
}

/// Routes envelopes to processors by message type.
///
/// With `spawn_processors` set, each envelope is handled on its own task so a
/// slow processor does not hold up the connection's receive loop; processor
/// errors are then only logged.
pub struct TypedDispatcher {
    registry: Registry,
    processors: DashMap<MessageTypeId, Arc<dyn Processor>>,
    spawn_processors: bool,
}

impl TypedDispatcher {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            processors: DashMap::new(),
            spawn_processors: false,
        }
    }

    pub fn with_spawned_processors(mut self) -> Self {
        self.spawn_processors = true;
        self
    }

    /// Route every `T` to `processor`, replacing any previous route.
    ///
    /// # Panics
    ///
    /// If `T` is not registered.
    pub fn register_processor<T: Message>(&self, processor: Arc<dyn Processor>) -> MessageTypeId {
        let id = self.registry.type_id_of::<T>().unwrap_or_else(|| {
            panic!(
                "cannot route {}: type is not registered",
                std::any::type_name::<T>()
            )
        });
        self.processors.insert(id, processor);
        id
    }

    pub fn has_processor(&self, id: MessageTypeId) -> bool {
        self.processors.contains_key(&id)
    }
}

#[async_trait]
impl Dispatcher for TypedDispatcher {
    async fn dispatch(&self, envelope: Envelope) -> Result<(), DispatchError> {
        let processor = self
            .processors
            .get(&envelope.msg_type)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                let name = self
                    .registry
                    .type_name(envelope.msg_type)
                    .unwrap_or_else(|| envelope.msg_type.to_string());
                DispatchError::NoProcessor(name)
            })?;

        if !self.spawn_processors {
            return processor.process(envelope).await;
        }
        tokio::spawn(async move {
            let sender = envelope.sender.id();
            let msg_type = envelope.msg_type;
            if let Err(e) = processor.process(envelope).await {
                warn!(peer = %sender, msg_type = %msg_type, error = %e, "Processor failed");
            }
        });
        Ok(())
    }
}

/// Dispatcher that drops everything, for routers that only send.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDispatcher;

#[async_trait]
impl Dispatcher for NoopDispatcher {
    async fn dispatch(&self, _envelope: Envelope) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tessera_types::{Address, LocalIdentity};
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u64,
    }

    struct Collect(mpsc::UnboundedSender<Envelope>);

    #[async_trait]
    impl Processor for Collect {
        async fn process(&self, envelope: Envelope) -> Result<(), DispatchError> {
            self.0
                .send(envelope)
                .map_err(|e| DispatchError::Processor(e.to_string()))
        }
    }

    fn envelope(registry: &Registry, msg: Box<dyn Message>) -> Envelope {
        let sender = LocalIdentity::generate(Address::parse("local://a:1").unwrap());
        Envelope {
            sender: sender.identity().clone(),
            msg_type: registry.message_type(msg.as_ref()).unwrap(),
            msg,
            size: 0,
        }
    }

    #[tokio::test]
    async fn test_routes_by_type() {
        let registry = Registry::new();
        registry.register::<Ping>("test.Ping");
        registry.register::<Pong>("test.Pong");

        let dispatcher = TypedDispatcher::new(registry.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = dispatcher.register_processor::<Ping>(Arc::new(Collect(tx)));
        assert!(dispatcher.has_processor(id));

        dispatcher
            .dispatch(envelope(&registry, Box::new(Ping { seq: 3 })))
            .await
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.message::<Ping>(), Some(&Ping { seq: 3 }));

        let err = dispatcher
            .dispatch(envelope(&registry, Box::new(Pong { seq: 1 })))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoProcessor(name) if name == "test.Pong"));
    }

    #[tokio::test]
    async fn test_spawned_processors() {
        let registry = Registry::new();
        registry.register::<Ping>("test.Ping");
        let dispatcher = TypedDispatcher::new(registry.clone()).with_spawned_processors();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register_processor::<Ping>(Arc::new(Collect(tx)));

        dispatcher
            .dispatch(envelope(&registry, Box::new(Ping { seq: 5 })))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap().message::<Ping>(),
            Some(&Ping { seq: 5 })
        );
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn test_unregistered_processor_panics() {
        let dispatcher = TypedDispatcher::new(Registry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        dispatcher.register_processor::<Ping>(Arc::new(Collect(tx)));
    }
}
