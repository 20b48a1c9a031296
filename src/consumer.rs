// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Consumer
//!
//! A consumer owns one sub-channel bound to one queue. Its task loops over
//! three situations:
//!
//! - a delivery arrived: wait for a free slot of the concurrency limit, then
//!   run the hook-wrapped handler on its own task and settle the delivery
//!   with the action it returned (unless the consumer is in auto-ack mode)
//! - the sub-channel closed, or the broker canceled the consumer: reopen the
//!   sub-channel with a fixed delay between attempts, replaying topology and
//!   QoS, until it works or the client shuts down
//! - the client shuts down: stop dispatching and close the sub-channel
//!
//! In-flight handlers are never interrupted, `Client::close` waits for them.

use crate::{
    channel::{Channel, CloseNotify, DeliveryStream, RawDelivery},
    client::Shared,
    delivery::Delivery,
    errors::{AmqpError, ConsumerError},
    exchange::ExchangeDefinition,
    handler::{Consume, Handler},
    hook::{self, ConsumeHook},
    log::LogFunc,
    queue::{QueueBinding, QueueDefinition},
    topology::Topology,
};
use futures_util::StreamExt;
use lapin::{options::BasicConsumeOptions, types::FieldTable};
use std::{num::NonZeroUsize, sync::Arc, thread};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

/// Options of `Client::new_consumer`.
#[derive(Clone, Default)]
pub struct ConsumerOptions {
    tag: String,
    auto_ack: bool,
    exclusive: bool,
    prefetch_count: u16,
    concurrency: usize,
    topology: Topology,
    hooks: Vec<Arc<dyn ConsumeHook>>,
}

impl ConsumerOptions {
    /// Consumer tag shown by the broker, a random one is used when empty.
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_owned();
        self
    }

    /// The broker considers deliveries settled as soon as it sends them.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Asks the broker to make this the only consumer of the queue.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Number of unacknowledged deliveries the broker keeps in flight.
    ///
    /// Without auto-ack a non-zero prefetch count is also the concurrency
    /// limit, there can be no more handlers running than unsettled messages.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Maximum number of handlers running at once. Zero is ignored, values
    /// above `Semaphore::MAX_PERMITS` are capped to it.
    pub fn concurrency(mut self, limit: usize) -> Self {
        if limit > 0 {
            self.concurrency = limit;
        }
        self
    }

    /// Declares the consumed queue on every sub-channel the consumer opens.
    pub fn declare_queue(mut self, def: QueueDefinition) -> Self {
        self.topology.queue = Some(def);
        self
    }

    /// Declares an exchange before the queue is bound.
    pub fn declare_exchange(mut self, def: ExchangeDefinition) -> Self {
        self.topology.exchange = Some(def);
        self
    }

    /// Binds the consumed queue after it is declared.
    pub fn bind_queue(mut self, binding: QueueBinding) -> Self {
        self.topology.binding = Some(binding);
        self
    }

    /// Appends a hook, after the ones registered on the client.
    pub fn hook(mut self, hook: Arc<dyn ConsumeHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    fn limit(&self) -> usize {
        if !self.auto_ack && self.prefetch_count > 0 {
            return usize::from(self.prefetch_count);
        }

        if self.concurrency > 0 {
            return self.concurrency.min(Semaphore::MAX_PERMITS);
        }

        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }
}

struct Consumer {
    shared: Arc<Shared>,
    queue: String,
    tag: String,
    opts: ConsumerOptions,
    handler: Arc<dyn Consume>,
    limit: Arc<Semaphore>,
    channel: Option<Arc<dyn Channel>>,
    closed: Option<CloseNotify>,
    deliveries: Option<DeliveryStream>,
}

enum Event {
    Shutdown,
    Lost(AmqpError),
    Delivery(RawDelivery),
}

pub(crate) async fn start(
    shared: Arc<Shared>,
    queue: &str,
    handler: Handler,
    opts: ConsumerOptions,
) -> Result<(), ConsumerError> {
    let tag = match opts.tag.as_str() {
        "" => format!("ctag-{}", Uuid::new_v4().simple()),
        tag => tag.to_owned(),
    };

    if let Err(source) = handler.validate() {
        return Err(ConsumerError {
            queue: queue.to_owned(),
            tag,
            source,
        });
    }

    let hooks: Vec<_> = shared
        .consume_hooks
        .iter()
        .chain(opts.hooks.iter())
        .cloned()
        .collect();

    let mut consumer = Consumer {
        queue: queue.to_owned(),
        tag,
        handler: hook::consume_chain(&hooks, handler.into_consume()),
        limit: Arc::new(Semaphore::new(opts.limit())),
        shared,
        opts,
        channel: None,
        closed: None,
        deliveries: None,
    };

    debug!(queue, tag = consumer.tag, "creating consumer...");
    if let Err(source) = consumer.init_channel().await {
        return Err(consumer.error(source));
    }

    let tracker = consumer.shared.tracker.clone();
    tracker.spawn(consumer.serve());
    Ok(())
}

impl Consumer {
    fn error(&self, source: AmqpError) -> ConsumerError {
        ConsumerError {
            queue: self.queue.clone(),
            tag: self.tag.clone(),
            source,
        }
    }

    async fn init_channel(&mut self) -> Result<(), AmqpError> {
        let conn = self.shared.connection()?;
        let channel = conn
            .channel()
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))?;

        let deliveries = match self.subscribe(channel.as_ref()).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                if let Err(err) = channel.close().await {
                    debug!(error = err.to_string(), "closing the unused channel");
                }
                return Err(err);
            }
        };

        self.closed = Some(channel.notify_close());
        if let Some(old) = self.channel.replace(channel) {
            if let Err(err) = old.close().await {
                debug!(error = err.to_string(), "closing the replaced channel");
            }
        }

        self.deliveries = Some(deliveries);
        debug!(queue = self.queue, tag = self.tag, "consuming");
        Ok(())
    }

    /// Installs topology and QoS on a fresh channel, then starts consuming.
    async fn subscribe(&mut self, channel: &dyn Channel) -> Result<DeliveryStream, AmqpError> {
        self.opts.topology.install(channel, &self.queue).await?;

        channel
            .basic_qos(self.opts.prefetch_count)
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))?;

        channel
            .basic_consume(
                &self.queue,
                &self.tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: self.opts.auto_ack,
                    exclusive: self.opts.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::ConsumerDeclarationError(err.to_string()))
    }

    async fn serve(mut self) {
        loop {
            match self.next_event().await {
                Event::Shutdown => break,

                Event::Delivery(raw) => {
                    if !self.dispatch(raw).await {
                        break;
                    }
                }

                Event::Lost(err) => {
                    warn!(
                        error = err.to_string(),
                        queue = self.queue,
                        tag = self.tag,
                        "consumer channel lost"
                    );
                    if !self.reconnect().await {
                        break;
                    }
                }
            }
        }

        if let Some(channel) = self.channel.take() {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "closing the consumer channel");
            }
        }
        debug!(queue = self.queue, tag = self.tag, "consumer stopped");
    }

    async fn next_event(&mut self) -> Event {
        let (Some(closed), Some(deliveries)) = (self.closed.as_mut(), self.deliveries.as_mut())
        else {
            return Event::Lost(AmqpError::ChannelClosed);
        };

        tokio::select! {
            biased;

            _ = self.shared.done.cancelled() => Event::Shutdown,

            err = closed.recv() => Event::Lost(err.unwrap_or(AmqpError::ChannelClosed)),

            next = deliveries.next() => match next {
                Some(Ok(raw)) => Event::Delivery(raw),
                Some(Err(err)) => Event::Lost(err),
                // The broker canceled the consumer.
                None => Event::Lost(AmqpError::ChannelClosed),
            },
        }
    }

    /// Runs the handler on a new task once a slot is free. Returns false
    /// when the client shut down first.
    async fn dispatch(&mut self, raw: RawDelivery) -> bool {
        let permit = tokio::select! {
            biased;

            _ = self.shared.done.cancelled() => return false,

            permit = self.limit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        let handler = self.handler.clone();
        let logger = self.shared.logger.clone();
        let auto_ack = self.opts.auto_ack;
        let (queue, tag) = (self.queue.clone(), self.tag.clone());

        self.shared.tracker.spawn(async move {
            let _permit = permit;

            let mut delivery = Delivery::new(raw, &tag, logger.clone());
            let action = handler.serve(&mut delivery).await;
            if auto_ack {
                return;
            }

            if let Err(source) = delivery.set_status(action).await {
                report(&logger, ConsumerError { queue, tag, source });
            }
        });

        true
    }

    /// Reopens the sub-channel. Returns false when the client shut down first.
    async fn reconnect(&mut self) -> bool {
        self.closed = None;
        self.deliveries = None;

        loop {
            match self.init_channel().await {
                Ok(()) => return true,
                Err(AmqpError::ConnectionClosed) => {}
                Err(err) => report(&self.shared.logger, self.error(err)),
            }

            tokio::select! {
                _ = self.shared.done.cancelled() => return false,
                _ = tokio::time::sleep(self.shared.reconnect_delay) => {}
            }
        }
    }
}

fn report(logger: &LogFunc, err: ConsumerError) {
    logger(&err)
}
