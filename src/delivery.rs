// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries and Acknowledgment
//!
//! A `Delivery` is one inbound message. It travels through the consume hook
//! chain as `&mut Delivery`, so hooks may rewrite the body or attach a trace
//! context before the handler sees it. Once the handler returns an `Action`,
//! the consumer settles the delivery with the broker exactly once.

use crate::{channel::Acknowledger, channel::RawDelivery, errors::AmqpError, log::LogFunc};
use lapin::{
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use opentelemetry::Context;
use std::{error::Error, fmt, sync::Arc};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Acknowledgment a handler returns for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Processing finished, the broker removes the message permanently.
    Ack,
    /// Transient failure. The broker requeues the message, preferably to a
    /// different consumer.
    Nack,
    /// The message can never be processed. It is dropped or dead-lettered.
    Reject,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Ack => write!(f, "ack"),
            Action::Nack => write!(f, "nack"),
            Action::Reject => write!(f, "reject"),
        }
    }
}

/// Routing metadata and properties of a delivery.
#[derive(Debug, Clone, Default)]
pub struct DeliveryInfo {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
}

impl DeliveryInfo {
    pub fn content_type(&self) -> &str {
        self.properties
            .content_type()
            .as_ref()
            .map(|v| v.as_str())
            .unwrap_or_default()
    }

    pub fn content_encoding(&self) -> &str {
        self.properties
            .content_encoding()
            .as_ref()
            .map(|v| v.as_str())
            .unwrap_or_default()
    }

    pub fn headers(&self) -> FieldTable {
        self.properties.headers().clone().unwrap_or_default()
    }

    /// How many times the message went through a dead-letter exchange.
    pub fn death_count(&self) -> i64 {
        let headers = self.headers();
        let Some(AMQPValue::FieldArray(arr)) = headers.inner().get(AMQP_HEADERS_X_DEATH) else {
            return 0;
        };

        arr.as_slice()
            .first()
            .and_then(|value| value.as_field_table())
            .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
            .and_then(|count| count.as_long_long_int())
            .unwrap_or_default()
    }
}

/// One inbound message.
pub struct Delivery {
    pub info: DeliveryInfo,
    pub body: Vec<u8>,
    /// Trace context of the delivery, hooks may replace it.
    pub context: Context,

    status: Option<Action>,
    acknowledger: Arc<dyn Acknowledger>,
    logger: LogFunc,
}

impl Delivery {
    pub(crate) fn new(raw: RawDelivery, consumer_tag: &str, logger: LogFunc) -> Self {
        Delivery {
            info: DeliveryInfo {
                consumer_tag: consumer_tag.to_owned(),
                delivery_tag: raw.delivery_tag,
                redelivered: raw.redelivered,
                exchange: raw.exchange,
                routing_key: raw.routing_key,
                properties: raw.properties,
            },
            body: raw.data,
            context: Context::new(),
            status: None,
            acknowledger: raw.acknowledger,
            logger,
        }
    }

    /// The action applied to the delivery, `None` until it is settled.
    pub fn status(&self) -> Option<Action> {
        self.status
    }

    /// Reports a failure through the client log sink.
    pub fn log(&self, err: &(dyn Error + 'static)) {
        (self.logger)(err)
    }

    /// Settles the delivery with the broker. A second call fails without
    /// reaching the broker.
    pub(crate) async fn set_status(&mut self, action: Action) -> Result<(), AmqpError> {
        if self.status.is_some() {
            return Err(AmqpError::AlreadyAcknowledged);
        }

        let tag = self.info.delivery_tag;
        match action {
            Action::Ack => self.acknowledger.ack(tag, false).await?,
            Action::Nack => self.acknowledger.nack(tag, false, true).await?,
            Action::Reject => self.acknowledger.reject(tag, false).await?,
        }

        self.status = Some(action);
        Ok(())
    }
}
