// Copyright (c) 2025, The RabbitHutch Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitHutch Resilience Layer
//!
//! This module provides the error taxonomy shared by the connection lifecycle
//! manager, topology reconciler, publishers and consumers. Most of these errors
//! never reach application code: connectivity failures are retried, publish
//! failures are surfaced as `false`, and topology failures are logged and
//! ignored. They exist so every failure path can be logged with context.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// The broker endpoint is malformed. This is a programmer error and the
    /// only error the connection lifecycle manager propagates.
    #[error("invalid broker endpoint `{0}`")]
    InvalidEndpoint(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The broker refused the publication or never confirmed it in time
    #[error("publication was not confirmed by the broker")]
    PublishNotConfirmed,

    /// Error serializing a message payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error enabling publisher confirms on the channel
    #[error("failure to enable publisher confirms `{0}`")]
    ConfirmSelectError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error performing a single basic.get
    #[error("failure to get message `{0}`")]
    GetMessageError(String),

    /// Error talking to the HTTP management API
    #[error("management api failure `{0}`")]
    ManagementApiError(String),

    /// The operation was aborted by its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// No instance registered under the given name
    #[error("no instance registered as `{0}`")]
    UnknownInstance(String),

    /// An instance is registered under the name but with another type
    #[error("instance `{0}` is not a `{1}`")]
    InstanceTypeMismatch(String, String),

    /// The background worker cannot be started in its current state
    #[error("worker cannot be started `{0}`")]
    WorkerStartError(String),
}
