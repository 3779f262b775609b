//! Handler and middleware traits
//!
//! Handlers are registered per event type; behaviors wrap every handler
//! invocation, middleware style. Both are stored type-erased so the dispatch
//! pipeline can treat heterogeneous event types uniformly; the typed surface
//! is restored at the edges by downcasting adapters.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::context::EventContext;
use crate::error::DispatchError;
use crate::event::IntegrationEvent;

/// Type-erased event payload moved through the dispatch pipeline.
pub type AnyEvent = Arc<dyn Any + Send + Sync>;

/// Handles one event type.
///
/// # Example
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use eventbus::{DispatchError, EventContext, EventHandler, EventInfo, IntegrationEvent};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced {
///     #[serde(flatten)]
///     info: EventInfo,
///     order_id: u64,
/// }
///
/// impl IntegrationEvent for OrderPlaced {
///     fn info(&self) -> &EventInfo {
///         &self.info
///     }
/// }
///
/// struct OrderProjection;
///
/// #[async_trait]
/// impl EventHandler<OrderPlaced> for OrderProjection {
///     async fn handle(
///         &self,
///         event: &OrderPlaced,
///         _context: &EventContext,
///     ) -> Result<(), DispatchError> {
///         println!("order {} placed", event.order_id);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler<E: IntegrationEvent>: Send + Sync {
    /// Process one event.
    async fn handle(&self, event: &E, context: &EventContext) -> Result<(), DispatchError>;
}

/// Object-safe handler form stored in the registry.
#[async_trait]
pub trait ErasedEventHandler: Send + Sync {
    async fn handle(&self, event: &AnyEvent, context: &EventContext) -> Result<(), DispatchError>;
}

/// Adapter erasing a typed handler. The downcast at the terminal chain segment
/// restores the concrete event type the handler was registered for.
pub(crate) struct TypedEventHandler<E, H> {
    handler: H,
    _event: PhantomData<fn(E)>,
}

impl<E, H> TypedEventHandler<E, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E, H> ErasedEventHandler for TypedEventHandler<E, H>
where
    E: IntegrationEvent,
    H: EventHandler<E>,
{
    async fn handle(&self, event: &AnyEvent, context: &EventContext) -> Result<(), DispatchError> {
        let event = event
            .downcast_ref::<E>()
            .ok_or(DispatchError::TypeMismatch)?;
        self.handler.handle(event, context).await
    }
}

/// Future produced by one composed chain execution.
pub(crate) type ChainFuture = BoxFuture<'static, Result<(), DispatchError>>;

/// One composed chain segment: everything inward of a given behavior,
/// parameterized by the terminal handler so a single cached chain serves
/// every handler registered for the event type.
pub(crate) type Segment = Arc<
    dyn Fn(AnyEvent, Arc<EventContext>, Arc<dyn ErasedEventHandler>) -> ChainFuture + Send + Sync,
>;

/// Continuation invoking the remainder of the behavior chain.
///
/// A behavior that never calls [`Next::run`] short-circuits the inner
/// behaviors and the terminal handler; control still returns to the behaviors
/// outside it.
pub struct Next {
    pub(crate) segment: Segment,
    pub(crate) event: AnyEvent,
    pub(crate) context: Arc<EventContext>,
    pub(crate) handler: Arc<dyn ErasedEventHandler>,
}

impl Next {
    /// Run the rest of the chain.
    pub async fn run(self) -> Result<(), DispatchError> {
        (self.segment)(self.event, self.context, self.handler).await
    }
}

/// Cross-cutting middleware wrapped around every handler invocation.
///
/// Behaviors may run logic before calling `next.run()`, skip the call to
/// short-circuit, and run logic after it returns. Failures propagate up the
/// chain uncaught. The event arrives type-erased; behaviors that care about a
/// specific payload can `downcast_ref` it.
///
/// # Example
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use eventbus::{AnyEvent, DispatchError, EventContext, Next, PipelineBehavior};
///
/// struct Timing;
///
/// #[async_trait]
/// impl PipelineBehavior for Timing {
///     async fn handle(
///         &self,
///         _event: &AnyEvent,
///         _context: &EventContext,
///         next: Next,
///     ) -> Result<(), DispatchError> {
///         let started = std::time::Instant::now();
///         let result = next.run().await;
///         tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "handled");
///         result
///     }
/// }
/// ```
#[async_trait]
pub trait PipelineBehavior: Send + Sync {
    /// Wrap one handler invocation.
    async fn handle(
        &self,
        event: &AnyEvent,
        context: &EventContext,
        next: Next,
    ) -> Result<(), DispatchError>;
}
