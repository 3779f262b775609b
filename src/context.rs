//! Per-message dispatch context
//!
//! The context carries the inbound message headers (read-only) plus a typed
//! value map behaviors use to hand per-dispatch state to handlers. A fresh
//! context is constructed for every (message, handler) execution so state set
//! by a behavior never leaks across handlers for the same message.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Read-only view of one inbound message plus per-dispatch typed values.
///
/// # Example
///
/// ```rust
/// use eventbus::EventContext;
///
/// #[derive(Clone)]
/// struct UserId(i64);
///
/// let context = EventContext::from_headers(Default::default());
/// context.insert(UserId(123));
/// assert_eq!(context.get::<UserId>().map(|u| u.0), Some(123));
/// ```
pub struct EventContext {
    headers: Arc<HashMap<String, serde_json::Value>>,
    values: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl EventContext {
    pub(crate) fn new(headers: Arc<HashMap<String, serde_json::Value>>) -> Self {
        Self {
            headers,
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Build a context from plain headers. Useful when dispatching events
    /// that did not arrive over a broker.
    pub fn from_headers(headers: HashMap<String, serde_json::Value>) -> Self {
        Self::new(Arc::new(headers))
    }

    /// Headers of the message this dispatch is processing.
    pub fn headers(&self) -> &HashMap<String, serde_json::Value> {
        &self.headers
    }

    /// A single header by key.
    pub fn header(&self, key: &str) -> Option<&serde_json::Value> {
        self.headers.get(key)
    }

    /// Store a typed value for the remainder of this dispatch.
    pub fn insert<T: Send + Sync + 'static>(&self, value: T) {
        self.values
            .lock()
            .expect("context value map poisoned")
            .insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Retrieve a typed value stored earlier in this dispatch.
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.values
            .lock()
            .expect("context value map poisoned")
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }
}

impl std::fmt::Debug for EventContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventContext")
            .field("headers", &self.headers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, Debug)]
    struct Marker(u32);

    #[test]
    fn test_header_lookup() {
        let mut headers = HashMap::new();
        headers.insert("userId".to_string(), serde_json::json!(123));
        let context = EventContext::from_headers(headers);

        assert_eq!(context.header("userId"), Some(&serde_json::json!(123)));
        assert_eq!(context.header("missing"), None);
    }

    #[test]
    fn test_typed_values() {
        let context = EventContext::from_headers(HashMap::new());
        assert_eq!(context.get::<Marker>(), None);

        context.insert(Marker(7));
        assert_eq!(context.get::<Marker>(), Some(Marker(7)));

        // Later inserts of the same type replace the value.
        context.insert(Marker(8));
        assert_eq!(context.get::<Marker>(), Some(Marker(8)));
    }
}
