//! # Eventbus
//!
//! A typed integration-event bus over AMQP-style message brokers: publish
//! strongly-typed domain events onto a broker's direct-exchange routing model
//! and dispatch inbound events through an ordered, extensible middleware
//! pipeline.
//!
//! ## Overview
//!
//! The crate handles:
//! - **Event Model**: immutable typed events carrying a UUID identity and a
//!   UTC creation timestamp
//! - **Subscription Registry**: a frozen mapping from event name (routing key)
//!   to payload type, handlers and decoder
//! - **Dispatch Pipeline**: per-type cached behavior chains wrapping every
//!   handler invocation, middleware style
//! - **Bus Client**: connection lifecycle, retry-wrapped publishing, and an
//!   explicit-ack consume loop
//! - **Resilience**: exponential-backoff retry shared by connection
//!   establishment and publishing
//!
//! ## Features
//!
//! - `memory` (default): in-process broker for single-process apps and tests
//!
//! ## Publishing
//!
//! ```rust,no_run
//! use eventbus::{
//!     BrokerEventBus, EventBusOptions, EventInfo, IntegrationEvent, MemoryBroker,
//!     PublishProperties, SubscriptionRegistry,
//! };
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderPlaced {
//!     #[serde(flatten)]
//!     info: EventInfo,
//!     order_id: u64,
//! }
//!
//! impl IntegrationEvent for OrderPlaced {
//!     fn info(&self) -> &EventInfo {
//!         &self.info
//!     }
//! }
//!
//! async fn publish_example(bus: &BrokerEventBus) {
//!     let event = OrderPlaced { info: EventInfo::new(), order_id: 42 };
//!     let properties = PublishProperties::new().with_header("userId", 123);
//!     bus.publish_with_properties(&event, properties).await.unwrap();
//! }
//! ```
//!
//! ## Subscribing
//!
//! Handlers and behaviors are registered explicitly before the bus starts;
//! there is no runtime discovery. The registry is frozen at build time:
//!
//! ```rust,no_run
//! use eventbus::{BrokerEventBus, EventBusOptions, MemoryBroker, SubscriptionRegistry};
//! use std::sync::Arc;
//!
//! # fn example(
//! #     registry: SubscriptionRegistry,
//! # ) {
//! let broker = MemoryBroker::new();
//! let bus = BrokerEventBus::new(
//!     EventBusOptions::new("eventbus", "my-service"),
//!     Arc::new(registry),
//!     Arc::new(broker.connector()),
//! );
//!
//! // Connects and consumes on a background task; never blocks the caller.
//! bus.start();
//! # }
//! ```
//!
//! ## Routing
//!
//! The routing key of an event is its type's simple name (`OrderPlaced` for
//! `my_app::orders::OrderPlaced`). The consumer queue gets one binding per
//! registered event name, and inbound routing keys resolve back to payload
//! types through the registry. Unresolvable messages are logged, dropped and
//! acknowledged.
//!
//! ## Delivery semantics
//!
//! At-least-once from the broker's point of view, with explicit,
//! unconditional acknowledgment after processing: a failing handler is logged
//! and tagged on the receive span but never blocks the ack, so a poison
//! message is processed once and discarded rather than redelivered.

pub mod bus;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod handler;
pub mod registry;
pub mod retry;
pub mod transport;

#[cfg(feature = "memory")]
pub mod memory;

// Re-export main types
pub use bus::{BrokerEventBus, ConsumerState, EventBusOptions};
pub use context::EventContext;
pub use dispatch::EventDispatcher;
pub use error::{ConfigError, DispatchError, PublishError};
pub use event::{EventInfo, IntegrationEvent, PublishProperties};
pub use handler::{AnyEvent, EventHandler, Next, PipelineBehavior};
pub use registry::{SubscriptionRegistry, SubscriptionRegistryBuilder};
pub use retry::RetryConfig;
pub use transport::{
    BrokerChannel, BrokerConnection, BrokerError, Connector, Delivery, ExchangeKind,
    MessageProperties, QueueOptions,
};

#[cfg(feature = "memory")]
pub use memory::{MemoryBroker, MemoryConnector};
