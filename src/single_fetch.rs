// Copyright (c) 2025, The RabbitHutch Authors
// MIT License
// All rights reserved.

//! # Single-Fetch Consumer
//!
//! Pulls one message at a time with `basic.get`, for request/response and
//! batch polling. Each fetch reconnects when needed and acknowledges the way
//! the continuous consumer does.

use crate::{
    channel::{BrokerConnector, LapinConnector},
    consumer::{connection_manager, handle_delivery, ConsumerSettings, MessageHandler},
    lifecycle::{ConnectionManager, LifecycleState},
    serialization::{json_deserializer, Deserializer},
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub struct SingleFetchConsumer<T> {
    settings: ConsumerSettings,
    connection: Mutex<ConnectionManager>,
    lifecycle: watch::Receiver<LifecycleState>,
    deserializer: Deserializer<T>,
    handler: Arc<dyn MessageHandler<T>>,
}

impl<T> SingleFetchConsumer<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn with_defaults(settings: ConsumerSettings, handler: Arc<dyn MessageHandler<T>>) -> Self {
        SingleFetchConsumer::new(
            settings,
            Arc::new(LapinConnector),
            json_deserializer(),
            handler,
        )
    }
}

impl<T> SingleFetchConsumer<T>
where
    T: Send + 'static,
{
    pub fn new(
        settings: ConsumerSettings,
        connector: Arc<dyn BrokerConnector>,
        deserializer: Deserializer<T>,
        handler: Arc<dyn MessageHandler<T>>,
    ) -> Self {
        let connection = connection_manager(&settings, connector);

        SingleFetchConsumer {
            settings,
            lifecycle: connection.subscribe(),
            connection: Mutex::new(connection),
            deserializer,
            handler,
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn state(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    /// Fetches and handles at most one message.
    ///
    /// Returns the handler's verdict; `false` when not connected, when the
    /// queue is empty, or when anything along the way fails.
    pub async fn fetch_message(&self, cancel: &CancellationToken) -> bool {
        let mut connection = self.connection.lock().await;

        match connection.ensure_connected(cancel).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(host = connection.endpoint().host(), "connection is not active");
                return false;
            }
            Err(err) => {
                error!(error = err.to_string(), "unable to connect the consumer");
                return false;
            }
        }

        let Some(session) = connection.session() else {
            return false;
        };

        let delivery = match session
            .get(&self.settings.queue_name, self.settings.auto_ack)
            .await
        {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                debug!(queue = self.settings.queue_name, "no message available");
                return false;
            }
            Err(err) => {
                error!(error = err.to_string(), "failure while fetching a message");
                return false;
            }
        };

        handle_delivery(
            session,
            &delivery,
            &self.deserializer,
            self.handler.as_ref(),
            self.settings.ack_policy(),
        )
        .await
        .unwrap_or(false)
    }

    pub async fn close(&self) {
        self.connection.lock().await.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{BrokerSession, InboundDelivery, MockBrokerConnector, MockBrokerSession},
        consumer::sync_handler,
        errors::AmqpError,
        lifecycle::ConnectionLifecycleProfile,
    };
    use mockall::predicate::eq;
    use std::time::Duration;

    fn settings(auto_ack: bool) -> ConsumerSettings {
        ConsumerSettings {
            lifecycle: ConnectionLifecycleProfile::new(0, Duration::ZERO),
            exchange: None,
            queue: None,
            auto_ack,
            ..ConsumerSettings::new("amqp://localhost", "TestExchange", "TestQueue")
        }
    }

    fn fetching(session: MockBrokerSession, auto_ack: bool, verdict: bool) -> SingleFetchConsumer<String> {
        let mut session = Some(session);
        let mut connector = MockBrokerConnector::new();
        connector.expect_connect().times(1).returning(move |_| {
            Ok(Box::new(session.take().unwrap()) as Box<dyn BrokerSession>)
        });

        SingleFetchConsumer::new(
            settings(auto_ack),
            Arc::new(connector),
            json_deserializer(),
            sync_handler(move |_: String| verdict),
        )
    }

    fn open_session() -> MockBrokerSession {
        let mut session = MockBrokerSession::new();
        session.expect_is_active().return_const(true);
        session.expect_close().returning(|| Ok(()));
        session.expect_set_prefetch().returning(|_| Ok(()));
        session.expect_bind_queue().returning(|_, _, _| Ok(()));
        session
    }

    fn message(payload: &str) -> Option<InboundDelivery> {
        Some(InboundDelivery {
            delivery_tag: 7,
            data: payload.as_bytes().to_vec(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn empty_queue_yields_false() {
        let mut session = open_session();
        session
            .expect_get()
            .with(eq("TestQueue"), eq(false))
            .times(1)
            .returning(|_, _| Ok(None));
        let consumer = fetching(session, false, true);

        assert!(!consumer.fetch_message(&CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn fetched_message_is_handled_and_acked() {
        let mut session = open_session();
        session
            .expect_get()
            .times(1)
            .returning(|_, _| Ok(message("\"Porter Robinson\"")));
        session.expect_ack().with(eq(7)).times(1).returning(|_| Ok(()));
        let consumer = fetching(session, false, true);

        assert!(consumer.fetch_message(&CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn auto_ack_fetch_sends_no_ack() {
        let mut session = open_session();
        session
            .expect_get()
            .with(eq("TestQueue"), eq(true))
            .times(1)
            .returning(|_, _| Ok(message("\"hello\"")));
        let consumer = fetching(session, true, true);

        assert!(consumer.fetch_message(&CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn rejected_message_yields_false() {
        let mut session = open_session();
        session
            .expect_get()
            .times(1)
            .returning(|_, _| Ok(message("\"hello\"")));
        let consumer = fetching(session, false, false);

        assert!(!consumer.fetch_message(&CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn unreachable_broker_yields_false() {
        let mut connector = MockBrokerConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_| Err(AmqpError::ConnectionError("refused".to_owned())));
        let consumer = SingleFetchConsumer::new(
            settings(false),
            Arc::new(connector),
            json_deserializer::<String>(),
            sync_handler(|_: String| true),
        );

        assert!(!consumer.fetch_message(&CancellationToken::new()).await);
        assert_eq!(consumer.state(), LifecycleState::Disconnected);
    }

    #[tokio::test]
    async fn failed_get_yields_false() {
        let mut session = open_session();
        session
            .expect_get()
            .times(1)
            .returning(|_, _| Err(AmqpError::GetMessageError("channel closed".to_owned())));
        let consumer = fetching(session, false, true);

        assert!(!consumer.fetch_message(&CancellationToken::new()).await);
    }
}
