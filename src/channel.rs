// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Capabilities
//!
//! The runtime never talks to `lapin` directly. The supervisor, consumers and
//! publishers go through the `Connection`, `Channel` and `Acknowledger` traits
//! defined here, which keeps the reconnect and dispatch logic independent of
//! the wire protocol. `LapinConnection` and `LapinChannel` are the production
//! implementations.
//!
//! Close notifications are plain `mpsc` receivers: the receiver yields (or its
//! sender is dropped) once the connection or channel is gone.
//!
//! Messages the broker returns as undeliverable are buffered by the channel
//! and collected with `Channel::take_returns`. Lapin keeps the returns of a
//! channel outside confirm mode until they are drained, so the buffer has to be
//! polled for the channel's whole life.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::{
    future::{self, BoxFuture},
    stream::BoxStream,
    FutureExt, StreamExt,
};
use lapin::{
    message::BasicReturnMessage,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use parking_lot::Mutex;
use std::{
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Inbound deliveries of one consumer, in receipt order.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, AmqpError>>;

/// Resolves to `true` once the broker acks the publish, `false` on a nack.
pub type DeferredConfirmation = BoxFuture<'static, Result<bool, AmqpError>>;

/// Yields once when the owning connection or channel is lost.
pub type CloseNotify = mpsc::Receiver<AmqpError>;

/// Per-message acknowledgment, addressed by delivery tag.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Settles the delivery as processed.
    ///
    /// # Parameters
    /// * `delivery_tag` - Tag of the delivery on its channel
    /// * `multiple` - Also settle every earlier unacknowledged delivery
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    /// Settles the delivery as failed.
    ///
    /// # Parameters
    /// * `delivery_tag` - Tag of the delivery on its channel
    /// * `multiple` - Also settle every earlier unacknowledged delivery
    /// * `requeue` - Ask the broker to deliver the message again
    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;

    /// Refuses a single delivery.
    ///
    /// # Parameters
    /// * `delivery_tag` - Tag of the delivery on its channel
    /// * `requeue` - Ask the broker to deliver the message again
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// A delivery frame as it leaves the protocol layer.
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    /// The channel the delivery arrived on.
    pub acknowledger: Arc<dyn Acknowledger>,
}

/// An undeliverable mandatory/immediate publish sent back by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub reply_code: u16,
    pub reply_text: String,
}

impl From<BasicReturnMessage> for ReturnedMessage {
    fn from(msg: BasicReturnMessage) -> Self {
        ReturnedMessage {
            exchange: msg.delivery.exchange.as_str().to_owned(),
            routing_key: msg.delivery.routing_key.as_str().to_owned(),
            reply_code: msg.reply_code,
            reply_text: msg.reply_text.as_str().to_owned(),
        }
    }
}

/// A broker session able to open sub-channels.
#[async_trait]
pub trait Connection: Send + Sync {
    fn is_closed(&self) -> bool;

    /// Opens a new sub-channel on this connection.
    async fn channel(&self) -> Result<Arc<dyn Channel>, AmqpError>;

    /// Returns a receiver yielding once the connection is lost. An already
    /// closed connection yields immediately.
    fn notify_close(&self) -> CloseNotify;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A multiplexed session used by exactly one consumer or publisher.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declares a queue.
    ///
    /// # Parameters
    /// * `name` - Queue name
    /// * `options` - Durability, exclusivity and auto-delete flags
    /// * `args` - Extra `x-` arguments such as TTL or dead-lettering
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Declares an exchange of the given kind.
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Binds `queue` to `exchange` for messages matching `routing_key`.
    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Caps the unacknowledged deliveries the broker sends to this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Switches the channel to publisher confirms.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Starts consuming `queue`.
    ///
    /// # Returns
    /// The delivery stream. It ends when the broker cancels the consumer or
    /// the channel closes.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Sends one message.
    ///
    /// # Returns
    /// The broker's confirmation. Outside confirm mode it resolves to `true`
    /// at once. Dropping it does not lose a returned message.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: Vec<u8>,
        properties: BasicProperties,
    ) -> Result<DeferredConfirmation, AmqpError>;

    /// Returns a receiver yielding once the channel is lost.
    fn notify_close(&self) -> CloseNotify;

    /// Removes and returns the messages the broker sent back since the last call.
    async fn take_returns(&self) -> Result<Vec<ReturnedMessage>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

type Listeners = Arc<Mutex<Vec<mpsc::Sender<AmqpError>>>>;

fn notify_all(listeners: &Listeners, err: AmqpError) {
    for tx in listeners.lock().drain(..) {
        let _ = tx.try_send(err.clone());
    }
}

/// `Connection` backed by a `lapin::Connection`.
///
/// A connection error is fanned out to the connection listeners and to every
/// channel opened from it, since lapin does not always surface a lost
/// connection on the channels themselves.
pub struct LapinConnection {
    inner: lapin::Connection,
    listeners: Listeners,
}

impl LapinConnection {
    pub fn new(inner: lapin::Connection) -> Self {
        let listeners: Listeners = Arc::default();

        let on_error = listeners.clone();
        inner.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection lost");
            notify_all(&on_error, AmqpError::from(err));
        });

        LapinConnection { inner, listeners }
    }
}

#[async_trait]
impl Connection for LapinConnection {
    fn is_closed(&self) -> bool {
        !self.inner.status().connected()
    }

    async fn channel(&self) -> Result<Arc<dyn Channel>, AmqpError> {
        let channel = self.inner.create_channel().await?;
        debug!(id = channel.id(), "channel created");

        Ok(Arc::new(LapinChannel {
            inner: channel,
            connection: self.listeners.clone(),
            confirm: AtomicBool::new(false),
            returned: Arc::default(),
        }))
    }

    fn notify_close(&self) -> CloseNotify {
        let (tx, rx) = mpsc::channel(1);
        if self.is_closed() {
            let _ = tx.try_send(AmqpError::ConnectionClosed);
        } else {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| !l.is_closed());
            listeners.push(tx);
        }
        rx
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close(200, "OK").await?;
        Ok(())
    }
}

/// `Channel` backed by a `lapin::Channel`.
///
/// In confirm mode lapin hands a returned message to the confirmation of its
/// publish; those are kept in `returned`. Outside confirm mode lapin buffers
/// them itself until `wait_for_confirms` drains them.
pub struct LapinChannel {
    inner: lapin::Channel,
    connection: Listeners,
    confirm: AtomicBool,
    returned: Arc<Mutex<Vec<ReturnedMessage>>>,
}

fn keep_return(returned: &Mutex<Vec<ReturnedMessage>>, msg: Option<Box<BasicReturnMessage>>) {
    if let Some(msg) = msg {
        returned.lock().push(ReturnedMessage::from(*msg));
    }
}

#[async_trait]
impl Channel for LapinChannel {
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner.queue_declare(name, options, args).await?;
        Ok(())
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner.exchange_declare(name, kind, options, args).await?;
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(queue, exchange, routing_key, options, args)
            .await?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        self.confirm.store(true, Ordering::Release);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .inner
            .basic_consume(queue, consumer_tag, options, args)
            .await?;

        let acknowledger: Arc<dyn Acknowledger> =
            Arc::new(LapinAcknowledger(self.inner.clone()));

        Ok(consumer
            .map(move |result| {
                result
                    .map(|d| RawDelivery {
                        delivery_tag: d.delivery_tag,
                        redelivered: d.redelivered,
                        exchange: d.exchange.to_string(),
                        routing_key: d.routing_key.to_string(),
                        properties: d.properties,
                        data: d.data,
                        acknowledger: acknowledger.clone(),
                    })
                    .map_err(AmqpError::from)
            })
            .boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: Vec<u8>,
        properties: BasicProperties,
    ) -> Result<DeferredConfirmation, AmqpError> {
        let confirm = self
            .inner
            .basic_publish(exchange, routing_key, options, &payload, properties)
            .await?;

        if !self.confirm.load(Ordering::Acquire) {
            return Ok(future::ready(Ok(true)).boxed());
        }

        // Awaited on its own task: the caller may stop waiting, the returned
        // message must still be kept.
        let (tx, rx) = oneshot::channel();
        let returned = self.returned.clone();
        tokio::spawn(async move {
            let outcome = match confirm.await {
                Ok(Confirmation::Ack(msg)) => {
                    keep_return(&returned, msg);
                    Ok(true)
                }
                Ok(Confirmation::Nack(msg)) => {
                    keep_return(&returned, msg);
                    Ok(false)
                }
                Ok(Confirmation::NotRequested) => Ok(true),
                Err(err) => Err(AmqpError::from(err)),
            };
            let _ = tx.send(outcome);
        });

        Ok(rx
            .map(|outcome| outcome.unwrap_or(Err(AmqpError::ChannelClosed)))
            .boxed())
    }

    fn notify_close(&self) -> CloseNotify {
        let (tx, rx) = mpsc::channel(1);
        if !self.inner.status().connected() {
            let _ = tx.try_send(AmqpError::ChannelClosed);
            return rx;
        }

        {
            let mut listeners = self.connection.lock();
            listeners.retain(|l| !l.is_closed());
            listeners.push(tx.clone());
        }

        self.inner.on_error(move |err| {
            let _ = tx.try_send(AmqpError::from(err));
        });
        rx
    }

    async fn take_returns(&self) -> Result<Vec<ReturnedMessage>, AmqpError> {
        let mut taken = mem::take(&mut *self.returned.lock());

        // Without pending confirms this only drains lapin's buffer.
        if !self.confirm.load(Ordering::Acquire) {
            let returned = self.inner.wait_for_confirms().await?;
            taken.extend(returned.into_iter().map(ReturnedMessage::from));
        }
        Ok(taken)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close(200, "OK").await?;
        Ok(())
    }
}

/// Acknowledges through the channel the delivery arrived on.
struct LapinAcknowledger(lapin::Channel);

#[async_trait]
impl Acknowledger for LapinAcknowledger {
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.0
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.0
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| AmqpError::RejectMessageError(err.to_string()))
    }
}
