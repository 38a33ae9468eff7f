// Copyright (c) 2025, The RabbitHutch Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides the [`Publisher`] abstraction and the
//! [`DirectPublisher`], which publishes synchronously with the caller: it
//! makes sure the connection is up, sends, and (with acks enabled) waits for
//! the broker confirmation. Failures come back as `false`, never as errors.
//! Trace context of the caller is propagated in the message headers.

use crate::{
    channel::{BrokerConnector, BrokerEndpointConfig, BrokerSession, LapinConnector},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    lifecycle::{millis, ConnectionLifecycleProfile, ConnectionManager, LifecycleState, SessionSetup},
    otel::HeaderPropagator,
    serialization::{
        json_serializer, wildcard_routing_key, RoutingKeyGenerator, Serializer, JSON_CONTENT_TYPE,
        UTF8_CONTENT_ENCODING,
    },
    topology::Topology,
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::{global, Context};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    sync::{watch, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// A header or declaration argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    LongInt(i32),
    LongLongInt(i64),
    Double(f64),
    LongString(String),
}

/// Message headers attached to a publication.
pub type Headers = HashMap<String, HeaderValue>;

/// Converts header values to the AMQP field table representation.
pub(crate) fn amqp_table<'a, I>(values: I) -> BTreeMap<ShortString, AMQPValue>
where
    I: IntoIterator<Item = (&'a String, &'a HeaderValue)>,
{
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in values {
        let amqp_value = match value {
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(*v),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Double(v) => AMQPValue::Double(*v),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v.clone())),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    btree
}

/// Everything a publisher needs to know about its broker and exchange.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PublisherSettings {
    pub endpoint: BrokerEndpointConfig,
    pub lifecycle: ConnectionLifecycleProfile,
    pub exchange_name: String,
    /// Declared after every (re)connect when set.
    pub exchange: Option<ExchangeDefinition>,
    /// Enables publisher confirms; a publish then succeeds only once acked.
    pub enable_acks: bool,
    pub content_type: String,
    pub content_encoding: String,
    #[serde(rename = "confirm_timeout_ms", with = "millis")]
    pub confirm_timeout: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        PublisherSettings {
            endpoint: BrokerEndpointConfig::default(),
            lifecycle: ConnectionLifecycleProfile::default(),
            exchange_name: String::new(),
            exchange: None,
            enable_acks: false,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            content_encoding: UTF8_CONTENT_ENCODING.to_owned(),
            confirm_timeout: Duration::from_secs(5),
        }
    }
}

impl PublisherSettings {
    pub fn new(uri: &str, exchange_name: &str) -> PublisherSettings {
        PublisherSettings {
            endpoint: BrokerEndpointConfig::new(uri),
            exchange_name: exchange_name.to_owned(),
            ..Default::default()
        }
    }
}

/// Publishes domain messages.
#[async_trait]
pub trait Publisher<T>: Send + Sync {
    /// Publishes with the generated routing key and the default content type.
    async fn publish(&self, message: T, headers: Option<Headers>) -> bool;

    /// Publishes with an explicit routing key and content type.
    async fn publish_with(
        &self,
        message: T,
        routing_key: &str,
        content_type: &str,
        headers: Option<Headers>,
    ) -> bool;
}

/// Enables confirms and declares the exchange on every fresh session.
struct PublisherSetup {
    topology: Topology,
    enable_acks: bool,
}

#[async_trait]
impl SessionSetup for PublisherSetup {
    async fn setup(
        &self,
        session: &dyn BrokerSession,
        _: &CancellationToken,
    ) -> Result<(), AmqpError> {
        if self.enable_acks {
            debug!("acks are enabled");
            session.enable_confirms().await?;
        }

        self.topology.install(session).await;

        Ok(())
    }
}

/// Publishes on the caller's task, blocking on connection readiness and
/// broker confirmation.
pub struct DirectPublisher<T> {
    settings: PublisherSettings,
    connection: Mutex<ConnectionManager>,
    lifecycle: watch::Receiver<LifecycleState>,
    serializer: Serializer<T>,
    routing_key: RoutingKeyGenerator<T>,
    cancel: CancellationToken,
    // runtime the publisher was built on, for blocking publishes from plain threads
    runtime: Option<Handle>,
}

impl<T> DirectPublisher<T>
where
    T: Serialize + Send + Sync + 'static,
{
    /// A `lapin` backed publisher with JSON payloads and the wildcard key.
    pub fn with_defaults(settings: PublisherSettings) -> DirectPublisher<T> {
        DirectPublisher::new(
            settings,
            Arc::new(LapinConnector),
            json_serializer(),
            wildcard_routing_key(),
        )
    }
}

impl<T> DirectPublisher<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(
        settings: PublisherSettings,
        connector: Arc<dyn BrokerConnector>,
        serializer: Serializer<T>,
        routing_key: RoutingKeyGenerator<T>,
    ) -> DirectPublisher<T> {
        let setup = PublisherSetup {
            topology: Topology::new(&settings.exchange_name).exchange(settings.exchange.clone()),
            enable_acks: settings.enable_acks,
        };
        let connection = ConnectionManager::new(
            connector,
            settings.endpoint.clone(),
            settings.lifecycle,
            Arc::new(setup),
        );

        DirectPublisher {
            settings,
            lifecycle: connection.subscribe(),
            connection: Mutex::new(connection),
            serializer,
            routing_key,
            cancel: CancellationToken::new(),
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    pub fn routing_key_for(&self, message: &T) -> String {
        (self.routing_key)(message)
    }

    /// State as of the last connect attempt; `Connecting` while one is running.
    pub fn state(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    /// Cancelled when the publisher is closed.
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Blocking flavour of [`Publisher::publish`].
    ///
    /// Works from a multi-threaded tokio runtime, or from a thread outside any
    /// runtime when the publisher was built inside a multi-threaded one.
    /// Anywhere else, such
    /// as a current-thread runtime, it logs and returns `false`.
    pub fn publish_blocking(&self, message: T, headers: Option<Headers>) -> bool {
        let routing_key = self.routing_key_for(&message);
        let publish = || {
            self.send(
                &message,
                &routing_key,
                &self.settings.content_type,
                &self.settings.content_encoding,
                headers.as_ref(),
                &self.cancel,
            )
        };

        let published = match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(publish()))
            }
            Ok(handle) => {
                error!(
                    flavor = format!("{:?}", handle.runtime_flavor()),
                    "blocking publish needs a multi-threaded runtime"
                );
                return false;
            }
            Err(_) => match &self.runtime {
                Some(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                    handle.block_on(publish())
                }
                _ => {
                    error!("blocking publish outside of a tokio runtime");
                    return false;
                }
            },
        };

        published.is_ok()
    }

    /// Serializes and publishes one message.
    ///
    /// `cancel` only aborts reconnect waits.
    pub(crate) async fn send(
        &self,
        message: &T,
        routing_key: &str,
        content_type: &str,
        content_encoding: &str,
        headers: Option<&Headers>,
        cancel: &CancellationToken,
    ) -> Result<(), AmqpError> {
        let payload = (self.serializer)(message)?;

        let mut connection = self.connection.lock().await;
        match connection.ensure_connected(cancel).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(host = connection.endpoint().host(), "connection is not active");
                return Err(AmqpError::ConnectionError("not connected".to_owned()));
            }
            Err(err) => {
                error!(error = err.to_string(), "unable to connect the publisher");
                return Err(err);
            }
        }

        let Some(session) = connection.session() else {
            return Err(AmqpError::ConnectionError("not connected".to_owned()));
        };

        let confirm_timeout = self
            .settings
            .enable_acks
            .then_some(self.settings.confirm_timeout);

        match session
            .publish(
                &self.settings.exchange_name,
                routing_key,
                &payload,
                self.properties(content_type, content_encoding, headers),
                confirm_timeout,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "publishing error");
                Err(err)
            }
            Ok(_) => {
                debug!(
                    "published [{}] to [{}]",
                    routing_key, self.settings.exchange_name
                );
                Ok(())
            }
        }
    }

    fn properties(
        &self,
        content_type: &str,
        content_encoding: &str,
        headers: Option<&Headers>,
    ) -> BasicProperties {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(
                &Context::current(),
                &mut HeaderPropagator::new(&mut btree),
            )
        });

        if let Some(headers) = headers {
            btree.extend(amqp_table(headers));
        }

        BasicProperties::default()
            .with_content_type(ShortString::from(content_type))
            .with_content_encoding(ShortString::from(content_encoding))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(btree))
    }

    /// Aborts pending reconnect waits and closes the connection for good.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.connection.lock().await.close().await;
    }
}

#[async_trait]
impl<T> Publisher<T> for DirectPublisher<T>
where
    T: Send + Sync + 'static,
{
    async fn publish(&self, message: T, headers: Option<Headers>) -> bool {
        let routing_key = self.routing_key_for(&message);
        self.publish_with(message, &routing_key, &self.settings.content_type, headers)
            .await
    }

    async fn publish_with(
        &self,
        message: T,
        routing_key: &str,
        content_type: &str,
        headers: Option<Headers>,
    ) -> bool {
        self.send(
            &message,
            routing_key,
            content_type,
            &self.settings.content_encoding,
            headers.as_ref(),
            &self.cancel,
        )
        .await
        .is_ok()
    }
}
