//! Integration event model
//!
//! This module defines the contract every integration event satisfies and the
//! outbound header bag attached to a single publish call.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Identity and creation metadata shared by every integration event.
///
/// Concrete events embed this with `#[serde(flatten)]` so the wire shape stays
/// flat. Domain equality is by `id`, never structural.
///
/// # Example
///
/// ```rust
/// use eventbus::{EventInfo, IntegrationEvent};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
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
/// let event = OrderPlaced { info: EventInfo::new(), order_id: 42 };
/// assert_eq!(OrderPlaced::name(), "OrderPlaced");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfo {
    /// Unique event ID
    pub id: Uuid,

    /// Timestamp when the event was created
    pub occurred_at: DateTime<Utc>,
}

impl EventInfo {
    /// Create metadata with a fresh id and the current UTC time.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
        }
    }
}

impl Default for EventInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// A typed integration event.
///
/// Events are immutable records: constructed by the producer, handed to
/// `publish`, serialized and discarded. The event name doubles as the routing
/// key on the broker and defaults to the type's simple name, which is also how
/// the consumer side resolves the payload type from an inbound routing key.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identity and creation timestamp.
    fn info(&self) -> &EventInfo;

    /// Event name used as the routing key.
    fn name() -> &'static str {
        simple_type_name::<Self>()
    }
}

/// Last path segment of a type name, e.g. `my_app::orders::OrderPlaced`
/// becomes `OrderPlaced`.
pub(crate) fn simple_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Mutable header bag attached to one outbound message.
///
/// Scoped to a single publish call; never reused across calls. Headers travel
/// with the message and surface on the consumer side through
/// [`EventContext::headers`](crate::EventContext::headers).
#[derive(Debug, Clone, Default)]
pub struct PublishProperties {
    headers: HashMap<String, serde_json::Value>,
}

impl PublishProperties {
    /// Create an empty header bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, builder style.
    pub fn with_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Add a header in place.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.headers.insert(key.into(), value.into());
    }

    /// All headers attached so far.
    pub fn headers(&self) -> &HashMap<String, serde_json::Value> {
        &self.headers
    }

    pub(crate) fn into_headers(self) -> HashMap<String, serde_json::Value> {
        self.headers
    }
}
