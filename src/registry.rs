//! Subscription registry
//!
//! Static mapping from event name (routing key) to payload type, handlers and
//! decoder. Populated through the builder before the bus starts and frozen
//! thereafter; the consumer reads it for queue bindings and type resolution.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::event::IntegrationEvent;
use crate::handler::{AnyEvent, ErasedEventHandler, EventHandler, PipelineBehavior, TypedEventHandler};

/// Decodes a raw payload into the registered event type.
pub(crate) type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<AnyEvent, serde_json::Error> + Send + Sync>;

/// One registered event type.
pub struct EventTypeEntry {
    type_id: TypeId,
    event_name: String,
    decode: DecodeFn,
}

impl EventTypeEntry {
    /// Type tag of the registered payload type.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Event name this entry is registered under.
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Decode a raw payload into the registered type.
    pub(crate) fn decode(&self, body: &[u8]) -> Result<AnyEvent, serde_json::Error> {
        (self.decode)(body)
    }
}

impl std::fmt::Debug for EventTypeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTypeEntry")
            .field("event_name", &self.event_name)
            .finish()
    }
}

pub(crate) struct BehaviorRegistration {
    /// Restricts the behavior to one event type; `None` applies everywhere.
    pub(crate) only_for: Option<TypeId>,
    pub(crate) behavior: Arc<dyn PipelineBehavior>,
}

/// Frozen mapping from event names to types, handlers and behaviors.
///
/// Built once through [`SubscriptionRegistry::builder`]; read-only for the
/// lifetime of the process.
pub struct SubscriptionRegistry {
    event_types: HashMap<String, EventTypeEntry>,
    handlers: HashMap<TypeId, Vec<Arc<dyn ErasedEventHandler>>>,
    behaviors: Vec<BehaviorRegistration>,
}

impl SubscriptionRegistry {
    /// Start building a registry.
    pub fn builder() -> SubscriptionRegistryBuilder {
        SubscriptionRegistryBuilder {
            event_types: HashMap::new(),
            handlers: HashMap::new(),
            behaviors: Vec::new(),
        }
    }

    /// Resolve an event name to its registered type entry.
    pub fn resolve(&self, event_name: &str) -> Option<&EventTypeEntry> {
        self.event_types.get(event_name)
    }

    /// All registered event names, one queue binding each.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.event_types.keys().map(String::as_str)
    }

    /// Number of registered event types.
    pub fn len(&self) -> usize {
        self.event_types.len()
    }

    /// Whether no event types are registered.
    pub fn is_empty(&self) -> bool {
        self.event_types.is_empty()
    }

    pub(crate) fn handlers_for(&self, type_id: TypeId) -> &[Arc<dyn ErasedEventHandler>] {
        self.handlers
            .get(&type_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Behaviors applicable to a type, in registration order.
    pub(crate) fn behaviors_for(&self, type_id: TypeId) -> Vec<Arc<dyn PipelineBehavior>> {
        self.behaviors
            .iter()
            .filter(|registration| {
                registration
                    .only_for
                    .map_or(true, |only_for| only_for == type_id)
            })
            .map(|registration| registration.behavior.clone())
            .collect()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("event_types", &self.event_types.len())
            .field("behaviors", &self.behaviors.len())
            .finish()
    }
}

/// Builder for [`SubscriptionRegistry`]. Append-only; freezing happens at
/// [`build`](SubscriptionRegistryBuilder::build).
pub struct SubscriptionRegistryBuilder {
    event_types: HashMap<String, EventTypeEntry>,
    handlers: HashMap<TypeId, Vec<Arc<dyn ErasedEventHandler>>>,
    behaviors: Vec<BehaviorRegistration>,
}

impl SubscriptionRegistryBuilder {
    /// Register a handler for an event type.
    ///
    /// The event name (the type's simple name) becomes a routing key the
    /// consumer queue is bound to. Registering a second handler for the same
    /// type appends it; every handler gets its own chain execution per
    /// message.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EventNameConflict`] if the event name is already
    /// registered to a different payload type.
    pub fn add_subscription<E, H>(mut self, handler: H) -> Result<Self, ConfigError>
    where
        E: IntegrationEvent,
        H: EventHandler<E> + 'static,
    {
        let event_name = E::name();
        let type_id = TypeId::of::<E>();

        match self.event_types.get(event_name) {
            Some(existing) if existing.type_id != type_id => {
                return Err(ConfigError::EventNameConflict {
                    name: event_name.to_string(),
                });
            }
            Some(_) => {}
            None => {
                let decode: DecodeFn = Arc::new(|body: &[u8]| {
                    let event: E = serde_json::from_slice(body)?;
                    Ok(Arc::new(event) as AnyEvent)
                });
                self.event_types.insert(
                    event_name.to_string(),
                    EventTypeEntry {
                        type_id,
                        event_name: event_name.to_string(),
                        decode,
                    },
                );
            }
        }

        self.handlers
            .entry(type_id)
            .or_default()
            .push(Arc::new(TypedEventHandler::new(handler)));

        Ok(self)
    }

    /// Register a behavior applying to every event type.
    pub fn add_behavior(mut self, behavior: impl PipelineBehavior + 'static) -> Self {
        self.behaviors.push(BehaviorRegistration {
            only_for: None,
            behavior: Arc::new(behavior),
        });
        self
    }

    /// Register a behavior applying only to one event type.
    pub fn add_behavior_for<E: IntegrationEvent>(
        mut self,
        behavior: impl PipelineBehavior + 'static,
    ) -> Self {
        self.behaviors.push(BehaviorRegistration {
            only_for: Some(TypeId::of::<E>()),
            behavior: Arc::new(behavior),
        });
        self
    }

    /// Freeze the registry.
    pub fn build(self) -> SubscriptionRegistry {
        SubscriptionRegistry {
            event_types: self.event_types,
            handlers: self.handlers,
            behaviors: self.behaviors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EventContext;
    use crate::error::DispatchError;
    use crate::event::EventInfo;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct SampleEvent {
        #[serde(flatten)]
        info: EventInfo,
        message: String,
    }

    impl IntegrationEvent for SampleEvent {
        fn info(&self) -> &EventInfo {
            &self.info
        }
    }

    // Same simple name as SampleEvent, different type.
    mod clash {
        use super::*;

        #[derive(Debug, Serialize, Deserialize)]
        pub struct SampleEvent {
            #[serde(flatten)]
            pub info: EventInfo,
            pub count: u32,
        }

        impl IntegrationEvent for SampleEvent {
            fn info(&self) -> &EventInfo {
                &self.info
            }
        }
    }

    struct NoopHandler;

    #[async_trait]
    impl EventHandler<SampleEvent> for NoopHandler {
        async fn handle(
            &self,
            _event: &SampleEvent,
            _context: &EventContext,
        ) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    struct OtherNoopHandler;

    #[async_trait]
    impl EventHandler<clash::SampleEvent> for OtherNoopHandler {
        async fn handle(
            &self,
            _event: &clash::SampleEvent,
            _context: &EventContext,
        ) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    #[test]
    fn test_resolve_registered_name() {
        let registry = SubscriptionRegistry::builder()
            .add_subscription::<SampleEvent, _>(NoopHandler)
            .unwrap()
            .build();

        let entry = registry.resolve("SampleEvent").unwrap();
        assert_eq!(entry.event_name(), "SampleEvent");
        assert_eq!(entry.type_id(), TypeId::of::<SampleEvent>());
        assert!(registry.resolve("Unknown").is_none());
    }

    #[test]
    fn test_duplicate_name_different_type_fails() {
        let result = SubscriptionRegistry::builder()
            .add_subscription::<SampleEvent, _>(NoopHandler)
            .unwrap()
            .add_subscription::<clash::SampleEvent, _>(OtherNoopHandler);

        assert!(matches!(
            result,
            Err(ConfigError::EventNameConflict { name }) if name == "SampleEvent"
        ));
    }

    #[test]
    fn test_same_type_appends_handler() {
        let registry = SubscriptionRegistry::builder()
            .add_subscription::<SampleEvent, _>(NoopHandler)
            .unwrap()
            .add_subscription::<SampleEvent, _>(NoopHandler)
            .unwrap()
            .build();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.handlers_for(TypeId::of::<SampleEvent>()).len(), 2);
    }

    #[test]
    fn test_entry_decodes_registered_type() {
        let registry = SubscriptionRegistry::builder()
            .add_subscription::<SampleEvent, _>(NoopHandler)
            .unwrap()
            .build();

        let original = SampleEvent {
            info: EventInfo::new(),
            message: "Hello".to_string(),
        };
        let body = serde_json::to_vec(&original).unwrap();

        let decoded = registry.resolve("SampleEvent").unwrap().decode(&body).unwrap();
        let decoded = decoded.downcast_ref::<SampleEvent>().unwrap();
        assert_eq!(decoded.info.id, original.info.id);
        assert_eq!(decoded.message, "Hello");
    }
}
