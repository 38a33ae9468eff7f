// Copyright (c) 2025, The RabbitHutch Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! The continuous [`Consumer`] subscribes to one queue and dispatches every
//! delivery to its [`MessageHandler`] on a dedicated background task.
//!
//! The task survives broker outages: whenever the connection cannot be
//! established, the liveness check finds the session closed, or the
//! subscription fails, it pauses and goes back to
//! [`ConnectionManager::ensure_connected`], subscribing again on the fresh
//! session. A delivery that is being handled when a graceful stop is
//! requested is finished and acknowledged before the task exits; once the
//! shutdown timeout passes it is abandoned unacknowledged and the connection
//! is closed.

use crate::{
    channel::{BrokerConnector, LapinConnector},
    consumer::{connection_manager, handle_delivery, ConsumerSettings, MessageHandler},
    errors::AmqpError,
    lifecycle::{pause, ConnectionManager, RunState, Worker},
    serialization::{json_deserializer, Deserializer},
};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::watch, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Floor of the liveness poll period; a zero period is not a valid interval.
const MIN_LIVENESS_INTERVAL: Duration = Duration::from_millis(1);

/// Consumes one queue continuously until shut down.
pub struct Consumer<T> {
    settings: Arc<ConsumerSettings>,
    connector: Arc<dyn BrokerConnector>,
    deserializer: Deserializer<T>,
    handler: Arc<dyn MessageHandler<T>>,
    worker: Mutex<Option<Worker<()>>>,
    shutdown_lock: tokio::sync::Mutex<()>,
    state: watch::Sender<RunState>,
    forced: AtomicBool,
}

impl<T> Consumer<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// A `lapin` backed consumer of JSON payloads.
    pub fn with_defaults(settings: ConsumerSettings, handler: Arc<dyn MessageHandler<T>>) -> Self {
        Consumer::new(
            settings,
            Arc::new(LapinConnector),
            json_deserializer(),
            handler,
        )
    }
}

impl<T> Consumer<T>
where
    T: Send + 'static,
{
    pub fn new(
        settings: ConsumerSettings,
        connector: Arc<dyn BrokerConnector>,
        deserializer: Deserializer<T>,
        handler: Arc<dyn MessageHandler<T>>,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Stopped);

        Consumer {
            settings: Arc::new(settings),
            connector,
            deserializer,
            handler,
            worker: Mutex::new(None),
            shutdown_lock: tokio::sync::Mutex::new(()),
            state,
            forced: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Notified on every [`RunState`] transition.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Whether the last shutdown had to abandon the consumer task.
    pub fn is_force_stopped(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// Spawns the consumer task on a fresh connection.
    pub fn start(&self) -> Result<(), AmqpError> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| AmqpError::WorkerStartError("worker state poisoned".to_owned()))?;

        if worker.is_some() {
            return Err(AmqpError::WorkerStartError("already running".to_owned()));
        }

        info!(queue = self.settings.queue_name, "consumer is starting");

        let stop = CancellationToken::new();
        let stop_now = CancellationToken::new();

        let task = run(RunLoop {
            connection: connection_manager(&self.settings, self.connector.clone()),
            settings: self.settings.clone(),
            deserializer: self.deserializer.clone(),
            handler: self.handler.clone(),
            stop: stop.clone(),
            stop_now: stop_now.clone(),
        });

        self.forced.store(false, Ordering::SeqCst);
        self.state.send_replace(RunState::Running);
        *worker = Some(Worker::spawn(stop, stop_now, task));

        Ok(())
    }

    /// [`Consumer::shutdown_with_timeout`] with the configured timeout.
    pub async fn shutdown(&self) {
        self.shutdown_with_timeout(self.settings.shutdown_timeout)
            .await
    }

    /// Stops consuming and closes the connection, waiting at most `timeout`
    /// for the delivery in flight to be handled.
    ///
    /// Idempotent: once stopped, further calls return immediately.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) {
        let _serial = self.shutdown_lock.lock().await;

        let worker = self.worker.lock().ok().and_then(|mut worker| worker.take());
        let Some(worker) = worker else {
            debug!("consumer is not running");
            return;
        };

        info!(queue = self.settings.queue_name, "consumer is shutting down");
        self.state.send_replace(RunState::Stopping);

        let (_, forced) = worker.stop(timeout, self.settings.shutdown_grace).await;
        if forced {
            self.forced.store(true, Ordering::SeqCst);
        }

        self.state.send_replace(RunState::Stopped);
        info!(queue = self.settings.queue_name, "consumer has stopped");
    }
}

struct RunLoop<T> {
    connection: ConnectionManager,
    settings: Arc<ConsumerSettings>,
    deserializer: Deserializer<T>,
    handler: Arc<dyn MessageHandler<T>>,
    stop: CancellationToken,
    stop_now: CancellationToken,
}

/// Why a subscription ended without an error.
#[derive(Debug, PartialEq, Eq)]
enum Interrupted {
    Stopped,
    ConnectionLost,
}

async fn run<T>(ctx: RunLoop<T>)
where
    T: Send + 'static,
{
    let RunLoop {
        mut connection,
        settings,
        deserializer,
        handler,
        stop,
        stop_now,
    } = ctx;

    let consumer_tag = settings.consumer_tag();

    while !stop.is_cancelled() {
        match connection.ensure_connected(&stop).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    host = connection.endpoint().host(),
                    "consumer connection is not active"
                );
                pause(settings.error_pause, &stop).await;
                continue;
            }
            Err(err) => {
                error!(error = err.to_string(), "unable to connect the consumer");
                pause(settings.error_pause, &stop).await;
                continue;
            }
        }

        let subscription = Subscription {
            connection: &connection,
            settings: &settings,
            consumer_tag: &consumer_tag,
            deserializer: &deserializer,
            handler: handler.as_ref(),
            stop: &stop,
            stop_now: &stop_now,
        };

        match subscription.consume().await {
            Ok(Interrupted::Stopped) => break,
            Ok(Interrupted::ConnectionLost) => {
                warn!(queue = settings.queue_name, "consumer connection was lost, reconnecting");
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = settings.queue_name,
                    "consumer failure, reconnecting"
                );
                connection.discard_session().await;
                pause(settings.error_pause, &stop).await;
            }
        }
    }

    connection.close().await;
    debug!(queue = settings.queue_name, "consumer task has exited");
}

/// One `basic.consume` subscription on a live session.
struct Subscription<'a, T> {
    connection: &'a ConnectionManager,
    settings: &'a ConsumerSettings,
    consumer_tag: &'a str,
    deserializer: &'a Deserializer<T>,
    handler: &'a dyn MessageHandler<T>,
    stop: &'a CancellationToken,
    stop_now: &'a CancellationToken,
}

impl<T> Subscription<'_, T>
where
    T: Send + 'static,
{
    /// Dispatches deliveries until stopped or the session dies.
    async fn consume(&self) -> Result<Interrupted, AmqpError> {
        let Some(session) = self.connection.session() else {
            return Ok(Interrupted::ConnectionLost);
        };

        let mut deliveries = session
            .consume(
                &self.settings.queue_name,
                self.consumer_tag,
                self.settings.auto_ack,
            )
            .await?;

        info!(
            queue = self.settings.queue_name,
            consumer_tag = self.consumer_tag,
            "consuming"
        );

        let mut liveness =
            tokio::time::interval(self.settings.liveness_interval.max(MIN_LIVENESS_INTERVAL));
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.stop_now.cancelled() => return Ok(Interrupted::Stopped),
                _ = self.stop.cancelled() => return Ok(Interrupted::Stopped),
                _ = liveness.tick() => {
                    if !session.is_active() {
                        return Ok(Interrupted::ConnectionLost);
                    }
                }
                delivery = deliveries.next() => match delivery {
                    Some(Ok(delivery)) => {
                        tokio::select! {
                            biased;
                            _ = self.stop_now.cancelled() => {
                                warn!(
                                    delivery_tag = delivery.delivery_tag,
                                    "stopping now, abandoning the delivery in flight"
                                );
                                return Ok(Interrupted::Stopped);
                            }
                            handled = handle_delivery(
                                session,
                                &delivery,
                                self.deserializer,
                                self.handler,
                                self.settings.ack_policy(),
                            ) => {
                                handled?;
                            }
                        }
                    }
                    Some(Err(err)) => return Err(err),
                    None => return Ok(Interrupted::ConnectionLost),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{BrokerSession, DeliveryStream, InboundDelivery, MockBrokerConnector, MockBrokerSession},
        consumer::sync_handler,
        lifecycle::ConnectionLifecycleProfile,
    };
    use futures_util::stream;
    use mockall::predicate::eq;
    use std::sync::atomic::AtomicUsize;

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            lifecycle: ConnectionLifecycleProfile::new(0, Duration::ZERO),
            exchange: None,
            queue: None,
            ..ConsumerSettings::new("amqp://localhost", "TestExchange", "TestQueue")
        }
    }

    fn delivery(tag: u64, payload: &str) -> Result<InboundDelivery, AmqpError> {
        Ok(InboundDelivery {
            delivery_tag: tag,
            data: payload.as_bytes().to_vec(),
            ..Default::default()
        })
    }

    /// A session that pushes `payloads`, then nothing, while `alive` holds.
    fn pushing_session<F>(payloads: Vec<&'static str>, acked: Arc<AtomicUsize>, alive: F) -> MockBrokerSession
    where
        F: Fn() -> bool + Send + 'static,
    {
        counting_session(payloads, acked, Arc::new(AtomicUsize::new(0)), alive)
    }

    /// Like [`pushing_session`], also counting how often it is closed.
    fn counting_session<F>(
        payloads: Vec<&'static str>,
        acked: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        alive: F,
    ) -> MockBrokerSession
    where
        F: Fn() -> bool + Send + 'static,
    {
        let mut session = MockBrokerSession::new();
        session.expect_is_active().returning(alive);
        session.expect_close().returning(move || {
            closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        session.expect_set_prefetch().returning(|_| Ok(()));
        session.expect_bind_queue().returning(|_, _, _| Ok(()));
        let mut payloads = Some(payloads);
        session
            .expect_consume()
            .with(eq("TestQueue"), mockall::predicate::always(), eq(false))
            .times(1)
            .returning(move |_, _, _| {
                let deliveries = payloads
                    .take()
                    .unwrap_or_default()
                    .into_iter()
                    .enumerate()
                    .map(|(tag, payload)| delivery(tag as u64 + 1, payload));
                Ok(stream::iter(deliveries).chain(stream::pending()).boxed() as DeliveryStream)
            });
        session.expect_ack().returning(move |_| {
            acked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        session
    }

    async fn wait_for(count: &AtomicUsize, expected: usize) {
        while count.load(Ordering::SeqCst) < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn dispatches_deliveries_and_acks_them() {
        let acked = Arc::new(AtomicUsize::new(0));
        let session = pushing_session(vec!["\"a\"", "\"b\""], acked.clone(), || true);
        let mut session = Some(session);
        let mut connector = MockBrokerConnector::new();
        connector.expect_connect().times(1).returning(move |_| {
            Ok(Box::new(session.take().unwrap()) as Box<dyn BrokerSession>)
        });
        let consumer = Consumer::new(
            settings(),
            Arc::new(connector),
            json_deserializer::<String>(),
            sync_handler(|_: String| true),
        );

        consumer.start().unwrap();
        wait_for(&acked, 2).await;
        consumer.shutdown().await;

        assert_eq!(acked.load(Ordering::SeqCst), 2);
        assert_eq!(consumer.state(), RunState::Stopped);
        assert!(!consumer.is_force_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_is_resubscribed() {
        let acked = Arc::new(AtomicUsize::new(0));
        let connects = Arc::new(AtomicUsize::new(0));

        let mut connector = MockBrokerConnector::new();
        let counter = connects.clone();
        let acks = acked.clone();
        connector.expect_connect().returning(move |_| {
            let session = if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                // dies once its delivery is acked
                let handled = acks.clone();
                pushing_session(vec!["\"x\""], acks.clone(), move || {
                    handled.load(Ordering::SeqCst) == 0
                })
            } else {
                pushing_session(vec!["\"y\""], acks.clone(), || true)
            };
            Ok(Box::new(session) as Box<dyn BrokerSession>)
        });
        let consumer = Consumer::new(
            settings(),
            Arc::new(connector),
            json_deserializer::<String>(),
            sync_handler(|_: String| true),
        );

        consumer.start().unwrap();
        wait_for(&acked, 2).await;
        consumer.shutdown().await;

        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_broker_keeps_retrying_until_shutdown() {
        let connects = Arc::new(AtomicUsize::new(0));
        let counter = connects.clone();
        let mut connector = MockBrokerConnector::new();
        connector.expect_connect().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AmqpError::ConnectionError("refused".to_owned()))
        });
        let consumer = Consumer::new(
            settings(),
            Arc::new(connector),
            json_deserializer::<String>(),
            sync_handler(|_: String| true),
        );

        consumer.start().unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        consumer.shutdown().await;

        assert!(connects.load(Ordering::SeqCst) >= 3);
        assert!(!consumer.is_force_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_is_forced_to_stop() {
        let acked = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let session = counting_session(vec!["\"slow\""], acked.clone(), closed.clone(), || true);
        let mut session = Some(session);
        let mut connector = MockBrokerConnector::new();
        connector.expect_connect().times(1).returning(move |_| {
            Ok(Box::new(session.take().unwrap()) as Box<dyn BrokerSession>)
        });
        let started = Arc::new(AtomicUsize::new(0));
        let handling = started.clone();
        let consumer = Consumer::new(
            settings(),
            Arc::new(connector),
            json_deserializer::<String>(),
            crate::consumer::handler_fn(move |_: String| {
                handling.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    true
                }
            }),
        );

        consumer.start().unwrap();
        wait_for(&started, 1).await;
        let stopping = tokio::time::Instant::now();
        consumer.shutdown_with_timeout(Duration::from_secs(30)).await;

        assert_eq!(stopping.elapsed(), Duration::from_secs(30));
        assert!(consumer.is_force_stopped());
        assert_eq!(acked.load(Ordering::SeqCst), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn zero_liveness_interval_still_consumes() {
        let acked = Arc::new(AtomicUsize::new(0));
        let session = pushing_session(vec!["\"a\""], acked.clone(), || true);
        let mut session = Some(session);
        let mut connector = MockBrokerConnector::new();
        connector.expect_connect().times(1).returning(move |_| {
            Ok(Box::new(session.take().unwrap()) as Box<dyn BrokerSession>)
        });
        let settings: ConsumerSettings = serde_json::from_str(
            r#"{"endpoint":{"uri":"amqp://localhost"},"exchange_name":"TestExchange","queue_name":"TestQueue","exchange":null,"queue":null,"liveness_interval_ms":0}"#,
        )
        .unwrap();
        assert_eq!(settings.liveness_interval, Duration::ZERO);
        let consumer = Consumer::new(
            settings,
            Arc::new(connector),
            json_deserializer::<String>(),
            sync_handler(|_: String| true),
        );

        consumer.start().unwrap();
        wait_for(&acked, 1).await;
        consumer.shutdown().await;

        assert_eq!(consumer.state(), RunState::Stopped);
        assert!(!consumer.is_force_stopped());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_restartable() {
        let mut connector = MockBrokerConnector::new();
        connector
            .expect_connect()
            .returning(|_| Err(AmqpError::ConnectionError("refused".to_owned())));
        let consumer = Consumer::new(
            settings(),
            Arc::new(connector),
            json_deserializer::<String>(),
            sync_handler(|_: String| true),
        );

        consumer.shutdown().await;
        consumer.start().unwrap();
        assert!(consumer.start().is_err());
        consumer.shutdown().await;
        consumer.shutdown().await;
        consumer.start().unwrap();
        consumer.shutdown().await;

        assert_eq!(consumer.state(), RunState::Stopped);
    }
}
