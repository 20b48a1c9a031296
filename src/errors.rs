// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Runtime
//!
//! `AmqpError` enumerates every failure the runtime can produce: configuration
//! mistakes, topology declaration failures, transport failures while the
//! supervisor reconnects, delivery decoding problems and publish failures.
//!
//! The structured errors (`ConsumerError`, `PublishError`, `DeliveryError`,
//! `ReturnError`) wrap a cause together with the queue, consumer tag, exchange
//! or routing key it happened on, so a log line is enough for triage.

use thiserror::Error;

/// Represents errors that can occur during AMQP operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The broker URI could not be parsed
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    /// The active connection is closed, dependents wait for the supervisor to redial
    #[error("connection closed")]
    ConnectionClosed,

    /// The initial dial did not complete in time
    #[error("connect timeout")]
    ConnectTimeout,

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// There is no open channel to publish on
    #[error("channel/connection is not open")]
    ChannelClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos: {0}")]
    QoSDeclarationError(String),

    /// Error starting to consume a queue
    #[error("failure to consume: {0}")]
    ConsumerDeclarationError(String),

    /// Error switching a channel into confirm mode
    #[error("failure to set confirm mode: {0}")]
    ConfirmModeError(String),

    /// The broker refused a publish
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker negatively confirmed a publish
    #[error("publish has not confirmation")]
    PublishConfirm,

    /// The confirmation did not arrive in time
    #[error("publish confirmation timeout")]
    ConfirmTimeout,

    /// The caller canceled the wait
    #[error("operation canceled")]
    Canceled,

    /// No marshaler for the payload type
    #[error("marshaler not found")]
    MarshalerNotFound,

    /// No unmarshaler registered for a typed handler
    #[error("unmarshaler not found")]
    UnmarshalerNotFound,

    /// A publish was attempted without a routing key
    #[error("routing key is empty")]
    EmptyRoutingKey,

    /// Error encoding a payload
    #[error("failure to marshal payload: {0}")]
    MarshalError(String),

    /// Error decoding a payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message: {0}")]
    RejectMessageError(String),

    /// The delivery was already settled
    #[error("delivery already acknowledged")]
    AlreadyAcknowledged,

    /// Error raised by a hook in the chain
    #[error("{0}")]
    HookError(String),

    /// Errors reported by the protocol layer
    #[error("amqp: {0}")]
    Protocol(String),
}

impl From<lapin::Error> for AmqpError {
    fn from(err: lapin::Error) -> Self {
        AmqpError::Protocol(err.to_string())
    }
}

/// A failure tied to one consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("queue `{queue}` consumer-tag `{tag}`: {source}")]
pub struct ConsumerError {
    pub queue: String,
    pub tag: String,
    pub source: AmqpError,
}

/// A failure tied to one publish.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("exchange `{exchange}` routing-key `{routing_key}`: {source}")]
pub struct PublishError {
    pub exchange: String,
    pub routing_key: String,
    pub source: AmqpError,
}

/// A delivery that could not be handed to user code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("exchange `{exchange}` routing-key `{routing_key}`: {message}")]
pub struct DeliveryError {
    pub exchange: String,
    pub routing_key: String,
    pub message: String,
}

/// A mandatory or immediate publish the broker sent back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("exchange `{exchange}` routing-key `{routing_key}`: returned {reply_code} {reply_text}")]
pub struct ReturnError {
    pub exchange: String,
    pub routing_key: String,
    pub reply_code: u16,
    pub reply_text: String,
}
