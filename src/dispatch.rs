//! Event dispatch mediator
//!
//! Entry point for every inbound event: looks up the handlers registered for
//! the event's concrete type and runs each through the composed behavior
//! chain. Chains are cached per type tag; the cache fill is first-writer-wins
//! so concurrent first dispatches of the same type build at most one effective
//! chain and losers discard their work.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::context::EventContext;
use crate::error::DispatchError;
use crate::event::IntegrationEvent;
use crate::handler::{AnyEvent, ChainFuture, ErasedEventHandler, Next, PipelineBehavior, Segment};
use crate::registry::SubscriptionRegistry;

/// Dispatches events through the cached behavior chain.
pub struct EventDispatcher {
    registry: Arc<SubscriptionRegistry>,
    chains: RwLock<HashMap<TypeId, Segment>>,
}

impl EventDispatcher {
    /// Create a dispatcher over a frozen registry.
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            chains: RwLock::new(HashMap::new()),
        }
    }

    /// Dispatch a typed event to every handler registered for its type.
    ///
    /// Each handler gets its own chain execution with a fresh per-dispatch
    /// context, so behavior state never leaks across handlers for the same
    /// message. The first failing behavior or handler aborts the remaining
    /// executions and propagates to the caller.
    pub async fn dispatch<E: IntegrationEvent>(
        &self,
        event: E,
        headers: HashMap<String, serde_json::Value>,
    ) -> Result<(), DispatchError> {
        self.dispatch_erased(TypeId::of::<E>(), Arc::new(event), Arc::new(headers))
            .await
    }

    pub(crate) async fn dispatch_erased(
        &self,
        type_id: TypeId,
        event: AnyEvent,
        headers: Arc<HashMap<String, serde_json::Value>>,
    ) -> Result<(), DispatchError> {
        let handlers = self.registry.handlers_for(type_id).to_vec();
        if handlers.is_empty() {
            tracing::trace!("no handlers registered for dispatched event type");
            return Ok(());
        }

        let chain = self.chain_for(type_id);

        for handler in handlers {
            let context = Arc::new(EventContext::new(headers.clone()));
            (chain)(event.clone(), context, handler).await?;
        }

        Ok(())
    }

    /// Cached chain for a type, built on first use.
    fn chain_for(&self, type_id: TypeId) -> Segment {
        if let Some(chain) = self
            .chains
            .read()
            .expect("chain cache poisoned")
            .get(&type_id)
        {
            return chain.clone();
        }

        // Built outside the write lock; a concurrent builder may win the
        // race, in which case this build is discarded.
        let built = build_chain(self.registry.behaviors_for(type_id));

        let mut chains = self.chains.write().expect("chain cache poisoned");
        chains.entry(type_id).or_insert(built).clone()
    }

    #[cfg(test)]
    fn cached_chain_count(&self) -> usize {
        self.chains.read().expect("chain cache poisoned").len()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("registry", &self.registry)
            .finish()
    }
}

/// Compose behaviors around the terminal handler segment.
///
/// Behaviors are folded in registration order, each wrapping the accumulated
/// inner delegate, which leaves the last registration outermost: at run time
/// behaviors execute in reverse registration order before the handler and
/// unwind through their post-phases afterwards.
///
/// The ordering is deliberate. Registration order is wrapping order, the way
/// layered middleware composes, rather than the first-registered-runs-first
/// convention of some mediator pipelines.
fn build_chain(behaviors: Vec<Arc<dyn PipelineBehavior>>) -> Segment {
    let terminal: Segment = Arc::new(
        |event: AnyEvent, context: Arc<EventContext>, handler: Arc<dyn ErasedEventHandler>| {
            Box::pin(async move { handler.handle(&event, &context).await }) as ChainFuture
        },
    );

    behaviors.into_iter().fold(terminal, |inner, behavior| {
        Arc::new(
            move |event: AnyEvent,
                  context: Arc<EventContext>,
                  handler: Arc<dyn ErasedEventHandler>| {
                let next = Next {
                    segment: inner.clone(),
                    event: event.clone(),
                    context: context.clone(),
                    handler,
                };
                let behavior = behavior.clone();
                Box::pin(async move { behavior.handle(&event, &context, next).await })
                    as ChainFuture
            },
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventInfo;
    use crate::handler::EventHandler;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;
    use tokio::sync::Barrier;

    #[derive(Debug, Clone, Serialize, Deserialize)]
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

    impl SampleEvent {
        fn new(message: &str) -> Self {
            Self {
                info: EventInfo::new(),
                message: message.to_string(),
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OtherEvent {
        #[serde(flatten)]
        info: EventInfo,
    }

    impl IntegrationEvent for OtherEvent {
        fn info(&self) -> &EventInfo {
            &self.info
        }
    }

    type Trace = Arc<Mutex<Vec<String>>>;

    struct TracingHandler {
        trace: Trace,
        label: &'static str,
    }

    #[async_trait]
    impl EventHandler<SampleEvent> for TracingHandler {
        async fn handle(
            &self,
            _event: &SampleEvent,
            _context: &EventContext,
        ) -> Result<(), DispatchError> {
            self.trace.lock().unwrap().push(self.label.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl EventHandler<OtherEvent> for TracingHandler {
        async fn handle(
            &self,
            _event: &OtherEvent,
            _context: &EventContext,
        ) -> Result<(), DispatchError> {
            self.trace.lock().unwrap().push(self.label.to_string());
            Ok(())
        }
    }

    struct TracingBehavior {
        trace: Trace,
        label: &'static str,
    }

    #[async_trait]
    impl PipelineBehavior for TracingBehavior {
        async fn handle(
            &self,
            _event: &AnyEvent,
            _context: &EventContext,
            next: Next,
        ) -> Result<(), DispatchError> {
            self.trace.lock().unwrap().push(format!("{}:pre", self.label));
            let result = next.run().await;
            self.trace.lock().unwrap().push(format!("{}:post", self.label));
            result
        }
    }

    struct ShortCircuitBehavior {
        trace: Trace,
    }

    #[async_trait]
    impl PipelineBehavior for ShortCircuitBehavior {
        async fn handle(
            &self,
            _event: &AnyEvent,
            _context: &EventContext,
            _next: Next,
        ) -> Result<(), DispatchError> {
            self.trace.lock().unwrap().push("short-circuit".to_string());
            Ok(())
        }
    }

    fn trace() -> Trace {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_behaviors_run_in_reverse_registration_order() {
        let trace = trace();
        let registry = SubscriptionRegistry::builder()
            .add_subscription::<SampleEvent, _>(TracingHandler {
                trace: trace.clone(),
                label: "handler",
            })
            .unwrap()
            .add_behavior(TracingBehavior {
                trace: trace.clone(),
                label: "b1",
            })
            .add_behavior(TracingBehavior {
                trace: trace.clone(),
                label: "b2",
            })
            .build();

        let dispatcher = EventDispatcher::new(Arc::new(registry));
        dispatcher
            .dispatch(SampleEvent::new("hi"), HashMap::new())
            .await
            .unwrap();

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["b2:pre", "b1:pre", "handler", "b1:post", "b2:post"]
        );
    }

    #[tokio::test]
    async fn test_every_handler_gets_its_own_chain_execution() {
        let trace = trace();
        let registry = SubscriptionRegistry::builder()
            .add_subscription::<SampleEvent, _>(TracingHandler {
                trace: trace.clone(),
                label: "h1",
            })
            .unwrap()
            .add_subscription::<SampleEvent, _>(TracingHandler {
                trace: trace.clone(),
                label: "h2",
            })
            .unwrap()
            .add_behavior(TracingBehavior {
                trace: trace.clone(),
                label: "b",
            })
            .build();

        let dispatcher = EventDispatcher::new(Arc::new(registry));
        dispatcher
            .dispatch(SampleEvent::new("hi"), HashMap::new())
            .await
            .unwrap();

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["b:pre", "h1", "b:post", "b:pre", "h2", "b:post"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner_chain() {
        let trace = trace();
        let registry = SubscriptionRegistry::builder()
            .add_subscription::<SampleEvent, _>(TracingHandler {
                trace: trace.clone(),
                label: "handler",
            })
            .unwrap()
            // Registered first, so it sits inside the outer tracing behavior.
            .add_behavior(ShortCircuitBehavior {
                trace: trace.clone(),
            })
            .add_behavior(TracingBehavior {
                trace: trace.clone(),
                label: "outer",
            })
            .build();

        let dispatcher = EventDispatcher::new(Arc::new(registry));
        dispatcher
            .dispatch(SampleEvent::new("hi"), HashMap::new())
            .await
            .unwrap();

        // The outer behavior observes control return; the handler never runs.
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["outer:pre", "short-circuit", "outer:post"]
        );
    }

    #[tokio::test]
    async fn test_per_type_behavior_only_wraps_its_type() {
        let trace = trace();
        let registry = SubscriptionRegistry::builder()
            .add_subscription::<SampleEvent, _>(TracingHandler {
                trace: trace.clone(),
                label: "sample",
            })
            .unwrap()
            .add_subscription::<OtherEvent, _>(TracingHandler {
                trace: trace.clone(),
                label: "other",
            })
            .unwrap()
            .add_behavior_for::<SampleEvent>(TracingBehavior {
                trace: trace.clone(),
                label: "sample-only",
            })
            .build();

        let dispatcher = EventDispatcher::new(Arc::new(registry));
        dispatcher
            .dispatch(SampleEvent::new("hi"), HashMap::new())
            .await
            .unwrap();
        dispatcher
            .dispatch(
                OtherEvent {
                    info: EventInfo::new(),
                },
                HashMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["sample-only:pre", "sample", "sample-only:post", "other"]
        );
    }

    #[tokio::test]
    async fn test_handler_failure_propagates() {
        struct FailingHandler;

        #[async_trait]
        impl EventHandler<SampleEvent> for FailingHandler {
            async fn handle(
                &self,
                _event: &SampleEvent,
                _context: &EventContext,
            ) -> Result<(), DispatchError> {
                Err(DispatchError::handler("boom"))
            }
        }

        let registry = SubscriptionRegistry::builder()
            .add_subscription::<SampleEvent, _>(FailingHandler)
            .unwrap()
            .build();

        let dispatcher = EventDispatcher::new(Arc::new(registry));
        let result = dispatcher
            .dispatch(SampleEvent::new("hi"), HashMap::new())
            .await;

        assert!(matches!(result, Err(DispatchError::Handler(_))));
    }

    #[tokio::test]
    async fn test_concurrent_first_dispatch_caches_one_chain() {
        let trace = trace();
        let registry = SubscriptionRegistry::builder()
            .add_subscription::<SampleEvent, _>(TracingHandler {
                trace: trace.clone(),
                label: "handler",
            })
            .unwrap()
            .build();

        let dispatcher = Arc::new(EventDispatcher::new(Arc::new(registry)));
        let barrier = Arc::new(Barrier::new(2));

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let dispatcher = dispatcher.clone();
            let barrier = barrier.clone();
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                dispatcher
                    .dispatch(SampleEvent::new("hi"), HashMap::new())
                    .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(dispatcher.cached_chain_count(), 1);
        assert_eq!(trace.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_context_values_do_not_leak_across_handlers() {
        #[derive(Clone)]
        struct Seen(bool);

        struct MarkingBehavior;

        #[async_trait]
        impl PipelineBehavior for MarkingBehavior {
            async fn handle(
                &self,
                _event: &AnyEvent,
                context: &EventContext,
                next: Next,
            ) -> Result<(), DispatchError> {
                // Every chain execution must start from a clean value map.
                assert!(context.get::<Seen>().is_none());
                context.insert(Seen(true));
                next.run().await
            }
        }

        struct AssertingHandler;

        #[async_trait]
        impl EventHandler<SampleEvent> for AssertingHandler {
            async fn handle(
                &self,
                _event: &SampleEvent,
                context: &EventContext,
            ) -> Result<(), DispatchError> {
                assert!(context.get::<Seen>().is_some());
                Ok(())
            }
        }

        let registry = SubscriptionRegistry::builder()
            .add_subscription::<SampleEvent, _>(AssertingHandler)
            .unwrap()
            .add_subscription::<SampleEvent, _>(AssertingHandler)
            .unwrap()
            .add_behavior(MarkingBehavior)
            .build();

        let dispatcher = EventDispatcher::new(Arc::new(registry));
        dispatcher
            .dispatch(SampleEvent::new("hi"), HashMap::new())
            .await
            .unwrap();
    }
}
