//! Broker transport abstraction
//!
//! The bus never speaks a wire protocol itself. It works against these traits,
//! which mirror the connection / channel / exchange / queue primitives of an
//! AMQP-style broker. The in-process implementation lives in
//! [`crate::memory`]; a production transport wraps a real client library
//! behind the same traits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Broker-level fault.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// Socket-level failure
    #[error("socket failure: {0}")]
    Io(#[from] std::io::Error),

    /// The channel was closed by the broker or by shutdown
    #[error("broker channel closed")]
    ChannelClosed,

    /// A mandatory publish could not be routed to any queue
    #[error("message with routing key \"{routing_key}\" could not be routed")]
    Unroutable {
        /// Routing key of the rejected message
        routing_key: String,
    },

    /// The named queue does not exist
    #[error("queue \"{0}\" does not exist")]
    UnknownQueue(String),
}

impl BrokerError {
    /// Whether the resilience policy may retry after this fault.
    ///
    /// Only broker-unreachable and socket-level failures are transient;
    /// routing and declaration failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unreachable(_) | BrokerError::Io(_))
    }
}

/// Exchange kinds the bus can declare. Event routing uses `Direct`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Exact routing-key match
    Direct,
    /// Deliver to every bound queue
    Fanout,
    /// Pattern-based routing
    Topic,
}

impl ExchangeKind {
    /// Wire name of the exchange kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    /// Survive broker restarts
    pub durable: bool,
    /// Restrict the queue to this connection
    pub exclusive: bool,
    /// Delete the queue when the last consumer disconnects
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Properties attached to one outbound message.
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
    /// AMQP delivery mode; 2 marks the message persistent
    pub delivery_mode: u8,
    /// Caller-supplied headers
    pub headers: HashMap<String, serde_json::Value>,
}

/// One inbound message delivered by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag used for acknowledgment
    pub delivery_tag: u64,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Message headers
    pub headers: HashMap<String, serde_json::Value>,
    /// Raw message body
    pub body: Vec<u8>,
}

/// Callback invoked on channel-level errors.
pub type ErrorCallback = Arc<dyn Fn(&BrokerError) + Send + Sync>;

/// A long-lived broker connection shared by all publishers.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Whether the connection is currently usable.
    fn is_open(&self) -> bool;

    /// Open a new channel on this connection.
    ///
    /// Channels are not safely shared across concurrent publishes, so the bus
    /// opens a fresh one per publish call and one dedicated consumer channel.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// A broker channel: declarations, publishing and consumption.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange. Idempotent.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Declare a queue. Idempotent.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    /// Bind a queue to an exchange for one routing key.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publish a message. With `mandatory` set, the broker must be able to
    /// route it or the publish fails.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: &[u8],
    ) -> Result<(), BrokerError>;

    /// Start consuming with explicit acknowledgment. Deliveries arrive on the
    /// returned receiver until the channel is dropped or the broker closes it.
    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError>;

    /// Acknowledge a delivery so the broker removes it from the queue.
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError>;

    /// Install a channel-level error callback.
    fn set_error_callback(&self, callback: ErrorCallback);
}

/// Opens broker connections.
///
/// The bus calls `connect` once at startup, wrapped in the resilience policy,
/// so implementations should fail with a transient [`BrokerError`] while the
/// broker is still coming up.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection to the broker.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}
