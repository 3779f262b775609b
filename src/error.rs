//! Error types for registry assembly, publishing and dispatch
//!
//! Broker-level faults live in [`crate::transport::BrokerError`]; the enums
//! here cover everything the bus itself can fail with.

use thiserror::Error;

use crate::transport::BrokerError;

/// Raised while assembling the subscription registry.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An event name is already registered to a different payload type
    #[error("event name \"{name}\" is already registered to a different event type")]
    EventNameConflict {
        /// The conflicting event name
        name: String,
    },
}

/// Failure of a single publish call.
#[derive(Debug, Error)]
pub enum PublishError {
    /// No open broker connection at publish time. Not retried; the connection
    /// is established on a background task at startup and a publish issued
    /// before that completes must fail rather than block.
    #[error("broker connection is not open")]
    NotConnected,

    /// The event could not be serialized. Never retried.
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker rejected the send, or it stayed unreachable after the retry
    /// policy exhausted its attempts.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Failure while dispatching one inbound message through the pipeline.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A behavior or handler failed
    #[error("handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The message body is not valid UTF-8
    #[error("message body is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// The payload could not be decoded as the registered event type
    #[error("failed to decode event payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// The erased payload did not match the type the chain was built for.
    /// Cannot occur for events resolved through the registry.
    #[error("event payload does not match the dispatched event type")]
    TypeMismatch,
}

impl DispatchError {
    /// Wrap an arbitrary handler or behavior failure.
    pub fn handler(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        DispatchError::Handler(error.into())
    }
}
