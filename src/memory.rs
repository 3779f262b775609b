//! In-process broker
//!
//! A broker transport backed by in-process channels. Suitable for
//! single-process deployments and testing; for distributed systems wrap a
//! real broker client behind the same transport traits.
//!
//! The broker exposes failure-injection hooks (`fail_next_publishes`,
//! connector-level connect failures, `set_open`) so the retry and fail-fast
//! paths of the bus can be exercised without a network.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerError, Connector, Delivery, ErrorCallback,
    ExchangeKind, MessageProperties, QueueOptions,
};

const QUEUE_CAPACITY: usize = 1024;

struct QueueState {
    sender: mpsc::Sender<Delivery>,
    receiver: Option<mpsc::Receiver<Delivery>>,
}

struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
}

struct MemoryBrokerInner {
    state: Mutex<BrokerState>,
    open: AtomicBool,
    next_tag: AtomicU64,
    fail_publishes: AtomicU32,
    acked: Mutex<Vec<u64>>,
}

/// In-process broker implementing the transport traits.
///
/// # Example
///
/// ```rust
/// use eventbus::MemoryBroker;
///
/// let broker = MemoryBroker::new();
/// let connector = broker.connector();
/// ```
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<MemoryBrokerInner>,
}

impl MemoryBroker {
    /// Create an open in-process broker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryBrokerInner {
                state: Mutex::new(BrokerState::default()),
                open: AtomicBool::new(true),
                next_tag: AtomicU64::new(1),
                fail_publishes: AtomicU32::new(0),
                acked: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fail the next `count` publish calls with a transient error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.fail_publishes.store(count, Ordering::SeqCst);
    }

    /// Toggle the connection's open flag.
    pub fn set_open(&self, open: bool) {
        self.inner.open.store(open, Ordering::SeqCst);
    }

    /// Delivery tags acknowledged so far.
    pub fn acked_tags(&self) -> Vec<u64> {
        self.inner.acked.lock().expect("ack log poisoned").clone()
    }

    /// A connector handing out this broker as the connection.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
            fail_connects: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("open", &self.inner.open.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl BrokerConnection for MemoryBroker {
    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Unreachable("connection closed".to_string()));
        }
        Ok(Arc::new(MemoryChannel {
            inner: self.inner.clone(),
            error_callback: Mutex::new(None),
        }))
    }
}

struct MemoryChannel {
    inner: Arc<MemoryBrokerInner>,
    error_callback: Mutex<Option<ErrorCallback>>,
}

impl MemoryChannel {
    fn report(&self, error: &BrokerError) {
        let callback = self
            .error_callback
            .lock()
            .expect("error callback poisoned")
            .clone();
        if let Some(callback) = callback {
            callback(error);
        }
    }

    /// Decrement the injected-failure budget if any remains.
    fn take_injected_failure(&self) -> bool {
        self.inner
            .fail_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().expect("broker state poisoned");
        state.exchanges.entry(name.to_string()).or_insert(kind);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, _options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().expect("broker state poisoned");
        state.queues.entry(name.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
            QueueState {
                sender,
                receiver: Some(receiver),
            }
        });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().expect("broker state poisoned");
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        state.bindings.push(Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        if !self.inner.open.load(Ordering::SeqCst) {
            let error = BrokerError::Unreachable("connection closed".to_string());
            self.report(&error);
            return Err(error);
        }

        if self.take_injected_failure() {
            let error = BrokerError::Unreachable("injected publish failure".to_string());
            self.report(&error);
            return Err(error);
        }

        let senders: Vec<mpsc::Sender<Delivery>> = {
            let state = self.inner.state.lock().expect("broker state poisoned");
            let kind = state
                .exchanges
                .get(exchange)
                .copied()
                .unwrap_or(ExchangeKind::Direct);
            state
                .bindings
                .iter()
                .filter(|binding| {
                    binding.exchange == exchange
                        && match kind {
                            ExchangeKind::Fanout => true,
                            // Topic patterns are not implemented in-process;
                            // exact match covers the bus's direct routing.
                            ExchangeKind::Direct | ExchangeKind::Topic => {
                                binding.routing_key == routing_key
                            }
                        }
                })
                .filter_map(|binding| state.queues.get(&binding.queue))
                .map(|queue| queue.sender.clone())
                .collect()
        };

        if mandatory && senders.is_empty() {
            return Err(BrokerError::Unroutable {
                routing_key: routing_key.to_string(),
            });
        }

        for sender in senders {
            let delivery = Delivery {
                delivery_tag: self.inner.next_tag.fetch_add(1, Ordering::SeqCst),
                routing_key: routing_key.to_string(),
                headers: properties.headers.clone(),
                body: body.to_vec(),
            };
            // A queue whose consumer is gone simply drops the message.
            let _ = sender.send(delivery).await;
        }

        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        let mut state = self.inner.state.lock().expect("broker state poisoned");
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        queue_state
            .receiver
            .take()
            .ok_or(BrokerError::ChannelClosed)
    }

    async fn ack(&self, delivery_tag: u64, _multiple: bool) -> Result<(), BrokerError> {
        self.inner
            .acked
            .lock()
            .expect("ack log poisoned")
            .push(delivery_tag);
        Ok(())
    }

    fn set_error_callback(&self, callback: ErrorCallback) {
        *self
            .error_callback
            .lock()
            .expect("error callback poisoned") = Some(callback);
    }
}

/// Connector handing out a [`MemoryBroker`] connection, with injectable
/// connect failures for startup-retry tests.
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    fail_connects: Arc<AtomicU32>,
}

impl MemoryConnector {
    /// Fail the next `count` connect calls with a transient error.
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let injected = self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(BrokerError::Unreachable(
                "injected connect failure".to_string(),
            ));
        }
        Ok(Arc::new(self.broker.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        broker.create_channel().await.unwrap()
    }

    #[tokio::test]
    async fn test_direct_exchange_routes_by_exact_key() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;

        ch.declare_exchange("events", ExchangeKind::Direct).await.unwrap();
        ch.declare_queue("q1", QueueOptions::default()).await.unwrap();
        ch.bind_queue("q1", "events", "OrderPlaced").await.unwrap();

        ch.publish("events", "OrderPlaced", true, MessageProperties::default(), b"a")
            .await
            .unwrap();

        let mut rx = ch.consume("q1").await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.routing_key, "OrderPlaced");
        assert_eq!(delivery.body, b"a");
    }

    #[tokio::test]
    async fn test_mandatory_publish_without_binding_is_unroutable() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_exchange("events", ExchangeKind::Direct).await.unwrap();

        let result = ch
            .publish("events", "Nothing", true, MessageProperties::default(), b"a")
            .await;

        assert!(matches!(result, Err(BrokerError::Unroutable { .. })));
    }

    #[tokio::test]
    async fn test_fanout_ignores_routing_key() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;

        ch.declare_exchange("fan", ExchangeKind::Fanout).await.unwrap();
        ch.declare_queue("q1", QueueOptions::default()).await.unwrap();
        ch.bind_queue("q1", "fan", "anything").await.unwrap();

        ch.publish("fan", "other-key", true, MessageProperties::default(), b"a")
            .await
            .unwrap();

        let mut rx = ch.consume("q1").await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient_and_reported() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_exchange("events", ExchangeKind::Direct).await.unwrap();

        let reported = Arc::new(AtomicU32::new(0));
        let reported_clone = reported.clone();
        ch.set_error_callback(Arc::new(move |_| {
            reported_clone.fetch_add(1, Ordering::SeqCst);
        }));

        broker.fail_next_publishes(1);
        let result = ch
            .publish("events", "X", false, MessageProperties::default(), b"a")
            .await;
        assert!(matches!(result, Err(ref e) if e.is_transient()));
        assert_eq!(reported.load(Ordering::SeqCst), 1);

        // Budget exhausted, the next publish goes through.
        ch.publish("events", "X", false, MessageProperties::default(), b"a")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ack_is_recorded() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.ack(7, false).await.unwrap();
        assert_eq!(broker.acked_tags(), vec![7]);
    }

    #[tokio::test]
    async fn test_connector_injected_failures() {
        let broker = MemoryBroker::new();
        let connector = broker.connector();
        connector.fail_next_connects(2);

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
    }
}
