//! Broker-backed event bus
//!
//! Owns the broker connection, publishes typed events with retry, and drives
//! the consume loop: receive, decode, dispatch, acknowledge. The connection is
//! established on a background task at startup so a slow or failing broker
//! never delays the caller that starts the bus; publishes issued before the
//! connection is up fail fast instead of blocking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::dispatch::EventDispatcher;
use crate::error::{DispatchError, PublishError};
use crate::event::{IntegrationEvent, PublishProperties};
use crate::registry::SubscriptionRegistry;
use crate::retry::{with_retry_if, RetryConfig};
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerError, Connector, Delivery, ExchangeKind,
    MessageProperties, QueueOptions,
};

const DEFAULT_RETRY_COUNT: u32 = 10;

/// AMQP delivery mode marking a message persistent.
const PERSISTENT_DELIVERY: u8 = 2;

/// Bus configuration, consumed read-only.
#[derive(Debug, Clone)]
pub struct EventBusOptions {
    /// Name of the direct exchange events are published to
    pub exchange_name: String,

    /// Name of the durable queue this consumer reads from
    pub subscription_client_name: String,

    /// Publish retry attempts (default 10)
    pub retry_count: u32,

    /// Startup connection retry attempts (default 10)
    pub connect_retry_count: u32,
}

impl EventBusOptions {
    /// Options with default retry counts.
    pub fn new(
        exchange_name: impl Into<String>,
        subscription_client_name: impl Into<String>,
    ) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            subscription_client_name: subscription_client_name.into(),
            retry_count: DEFAULT_RETRY_COUNT,
            connect_retry_count: DEFAULT_RETRY_COUNT,
        }
    }

    /// Set the publish retry attempt count.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Set the startup connection retry attempt count.
    pub fn with_connect_retry_count(mut self, connect_retry_count: u32) -> Self {
        self.connect_retry_count = connect_retry_count;
        self
    }
}

/// Consumer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// `start` has not been called
    NotStarted,
    /// The background task is establishing the connection
    Connecting,
    /// Messages are being consumed
    Consuming,
    /// The consumer shut down
    Stopped,
    /// Connection establishment failed after exhausting retries
    Failed,
}

struct BusInner {
    options: EventBusOptions,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: EventDispatcher,
    connector: Arc<dyn Connector>,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    state: RwLock<ConsumerState>,
    shutdown: watch::Sender<bool>,
}

impl BusInner {
    fn set_state(&self, state: ConsumerState) {
        *self.state.write().expect("bus state poisoned") = state;
    }
}

/// Publish/subscribe bus over an injected broker transport.
///
/// # Example
///
/// ```rust,no_run
/// use eventbus::{BrokerEventBus, EventBusOptions, MemoryBroker, SubscriptionRegistry};
/// use std::sync::Arc;
///
/// # async fn example(registry: SubscriptionRegistry) {
/// let broker = MemoryBroker::new();
/// let bus = BrokerEventBus::new(
///     EventBusOptions::new("eventbus", "my-service"),
///     Arc::new(registry),
///     Arc::new(broker.connector()),
/// );
///
/// bus.start();
/// # }
/// ```
pub struct BrokerEventBus {
    inner: Arc<BusInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerEventBus {
    /// Create a bus over a frozen registry and a broker connector.
    pub fn new(
        options: EventBusOptions,
        registry: Arc<SubscriptionRegistry>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let dispatcher = EventDispatcher::new(registry.clone());
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(BusInner {
                options,
                registry,
                dispatcher,
                connector,
                connection: RwLock::new(None),
                state: RwLock::new(ConsumerState::NotStarted),
                shutdown,
            }),
            task: Mutex::new(None),
        }
    }

    /// Current consumer state.
    pub fn state(&self) -> ConsumerState {
        *self.inner.state.read().expect("bus state poisoned")
    }

    /// Start connecting and consuming on a background task.
    ///
    /// Returns immediately. Connection establishment is retried with the
    /// backoff policy; if it exhausts its attempts the consumer lands in
    /// [`ConsumerState::Failed`] and publishes keep failing with
    /// [`PublishError::NotConnected`].
    pub fn start(&self) {
        {
            let mut state = self.inner.state.write().expect("bus state poisoned");
            if *state != ConsumerState::NotStarted {
                tracing::warn!(state = ?*state, "event bus already started");
                return;
            }
            *state = ConsumerState::Connecting;
        }

        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(run_consumer(inner, shutdown));
        *self.task.lock().expect("task slot poisoned") = Some(handle);
    }

    /// Stop consuming and release the consumer channel.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let handle = self.task.lock().expect("task slot poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Publish an event with no extra headers.
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), PublishError> {
        self.publish_with_properties(event, PublishProperties::new())
            .await
    }

    /// Publish an event with caller-supplied headers.
    ///
    /// The routing key is the event type's simple name. The message is marked
    /// persistent and mandatory; transient broker faults are retried with
    /// exponential backoff up to the configured attempt count, after which the
    /// last error is returned.
    pub async fn publish_with_properties<E: IntegrationEvent>(
        &self,
        event: &E,
        properties: PublishProperties,
    ) -> Result<(), PublishError> {
        let connection = self
            .inner
            .connection
            .read()
            .expect("connection slot poisoned")
            .clone()
            .ok_or(PublishError::NotConnected)?;
        if !connection.is_open() {
            return Err(PublishError::NotConnected);
        }

        let routing_key = E::name();
        let event_id = event.info().id;

        tracing::trace!(
            event_id = %event_id,
            event_name = routing_key,
            "creating broker channel to publish event"
        );
        let channel = connection.create_channel().await?;

        tracing::trace!(event_id = %event_id, "declaring exchange to publish event");
        channel
            .declare_exchange(&self.inner.options.exchange_name, ExchangeKind::Direct)
            .await?;

        let body = serde_json::to_vec(event)?;
        let message_properties = MessageProperties {
            delivery_mode: PERSISTENT_DELIVERY,
            headers: properties.into_headers(),
        };

        let retry = RetryConfig::backoff(self.inner.options.retry_count);
        let exchange_name = self.inner.options.exchange_name.as_str();
        let body = body.as_slice();
        let channel = channel.as_ref();

        with_retry_if(
            &retry,
            || {
                let span = tracing::info_span!(
                    "event_bus.publish",
                    messaging.system = "amqp",
                    messaging.operation = "publish",
                    messaging.destination.name = routing_key,
                    messaging.rabbitmq.routing_key = routing_key,
                    exception.message = tracing::field::Empty,
                );
                let properties = message_properties.clone();
                let attempt_span = span.clone();
                async move {
                    tracing::trace!(event_id = %event_id, "publishing event to broker");
                    let result = channel
                        .publish(exchange_name, routing_key, true, properties, body)
                        .await;
                    if let Err(error) = &result {
                        attempt_span.record("exception.message", tracing::field::display(error));
                    }
                    result
                }
                .instrument(span)
            },
            BrokerError::is_transient,
        )
        .await?;

        Ok(())
    }
}

impl std::fmt::Debug for BrokerEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerEventBus")
            .field("options", &self.inner.options)
            .field("state", &self.state())
            .finish()
    }
}

/// Background task: connect with retry, set up the consumer channel, then
/// pump deliveries until shutdown.
async fn run_consumer(inner: Arc<BusInner>, mut shutdown: watch::Receiver<bool>) {
    tracing::info!("starting broker connection on a background task");

    let connect_retry = RetryConfig::backoff(inner.options.connect_retry_count);
    let connect = with_retry_if(
        &connect_retry,
        || inner.connector.connect(),
        BrokerError::is_transient,
    );

    // Shutdown must stay prompt while the connect schedule is still backing
    // off, so the retried connect races the shutdown signal.
    let connection = tokio::select! {
        _ = shutdown.changed() => {
            tracing::info!("event bus shut down before the broker connection was established");
            inner.set_state(ConsumerState::Stopped);
            return;
        }
        result = connect => match result {
            Ok(connection) => connection,
            Err(error) => {
                tracing::error!(error = %error, "error starting broker connection");
                inner.set_state(ConsumerState::Failed);
                return;
            }
        }
    };

    if !connection.is_open() {
        tracing::error!("broker connection is not open");
        inner.set_state(ConsumerState::Failed);
        return;
    }

    *inner
        .connection
        .write()
        .expect("connection slot poisoned") = Some(connection.clone());

    let (channel, mut receiver) = match setup_consumer(&inner, connection.as_ref()).await {
        Ok(consumer) => consumer,
        Err(error) => {
            tracing::error!(error = %error, "error setting up consumer channel");
            inner.set_state(ConsumerState::Failed);
            return;
        }
    };

    inner.set_state(ConsumerState::Consuming);
    tracing::info!(
        queue = %inner.options.subscription_client_name,
        exchange = %inner.options.exchange_name,
        "event bus consuming"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            delivery = receiver.recv() => match delivery {
                Some(delivery) => on_delivery(&inner, channel.as_ref(), delivery).await,
                None => {
                    tracing::warn!("consumer channel closed by broker");
                    break;
                }
            }
        }
    }

    // Dropping the channel releases its broker-side resources.
    drop(channel);
    inner.set_state(ConsumerState::Stopped);
    tracing::info!("event bus consumer stopped");
}

async fn setup_consumer(
    inner: &Arc<BusInner>,
    connection: &dyn BrokerConnection,
) -> Result<(Arc<dyn BrokerChannel>, mpsc::Receiver<Delivery>), BrokerError> {
    tracing::trace!("creating consumer channel");
    let channel = connection.create_channel().await?;

    channel.set_error_callback(Arc::new(|error| {
        tracing::warn!(error = %error, "error on consumer channel");
    }));

    channel
        .declare_exchange(&inner.options.exchange_name, ExchangeKind::Direct)
        .await?;
    channel
        .declare_queue(
            &inner.options.subscription_client_name,
            QueueOptions::default(),
        )
        .await?;

    tracing::trace!("starting basic consume");
    let receiver = channel
        .consume(&inner.options.subscription_client_name)
        .await?;

    // One binding per registered routing key.
    for event_name in inner.registry.event_names() {
        channel
            .bind_queue(
                &inner.options.subscription_client_name,
                &inner.options.exchange_name,
                event_name,
            )
            .await?;
    }

    Ok((channel, receiver))
}

async fn on_delivery(inner: &Arc<BusInner>, channel: &dyn BrokerChannel, delivery: Delivery) {
    let span = tracing::info_span!(
        "event_bus.receive",
        messaging.system = "amqp",
        messaging.operation = "receive",
        messaging.destination.name = %delivery.routing_key,
        messaging.rabbitmq.routing_key = %delivery.routing_key,
        message = tracing::field::Empty,
        exception.message = tracing::field::Empty,
    );

    if let Err(error) = process_delivery(inner, &delivery)
        .instrument(span.clone())
        .await
    {
        span.record("exception.message", tracing::field::display(&error));
        tracing::warn!(
            error = %error,
            routing_key = %delivery.routing_key,
            "error processing message"
        );
    }

    // Unconditional, so a permanently failing handler cannot block the queue.
    // The message is processed once and discarded.
    if let Err(error) = channel.ack(delivery.delivery_tag, false).await {
        tracing::warn!(
            error = %error,
            delivery_tag = delivery.delivery_tag,
            "failed to acknowledge message"
        );
    }
}

async fn process_delivery(
    inner: &Arc<BusInner>,
    delivery: &Delivery,
) -> Result<(), DispatchError> {
    tracing::trace!(event_name = %delivery.routing_key, "processing event");

    let message = String::from_utf8(delivery.body.clone())?;
    tracing::Span::current().record("message", message.as_str());

    // Test hook: lets integration suites force the failure path without
    // registering a broken handler.
    if message.to_ascii_lowercase().contains("throw-fake-exception") {
        return Err(DispatchError::handler(format!(
            "fake exception requested: \"{message}\""
        )));
    }

    let Some(entry) = inner.registry.resolve(&delivery.routing_key) else {
        tracing::warn!(
            event_name = %delivery.routing_key,
            "unable to resolve event type for event name"
        );
        return Ok(());
    };

    let event = entry.decode(&delivery.body)?;
    let headers = Arc::new(delivery.headers.clone());
    inner
        .dispatcher
        .dispatch_erased(entry.type_id(), event, headers)
        .await
}
