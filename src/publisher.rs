// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! A `Publisher<T>` encodes values of type `T`, runs them through the publish
//! hook chain and sends them to one exchange over its own sub-channel.
//!
//! A background task keeps the sub-channel alive: when the broker closes it,
//! the task reopens it (switching it back to confirm mode when asked to). A
//! second task polls the current sub-channel for returned messages and reports
//! them through the client's log sink. Publishing while the sub-channel is being replaced
//! fails, there is no local buffering.
//!
//! In confirm mode `publish` waits for the broker to acknowledge the message.
//! The wait is bounded by the optional confirm timeout and by the
//! cancellation token of the `Publishing`.

use crate::{
    channel::{Channel, CloseNotify},
    client::Shared,
    errors::{AmqpError, PublishError, ReturnError},
    hook::{self, PublishHook},
    log::LogFunc,
    marshal::{self, Marshaler},
};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use parking_lot::RwLock;
use std::{
    mem,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Delivery mode of messages the broker may lose on restart.
pub const TRANSIENT: u8 = 1;
/// Delivery mode of messages written to disk by durable queues.
pub const PERSISTENT: u8 = 2;

const RETURNS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One step of the publish path. The last step sends the request.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(&self, request: &mut PublishRequest) -> Result<(), AmqpError>;
}

/// A message on its way to the broker, as seen by publish hooks.
#[derive(Debug)]
pub struct PublishRequest {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
    /// Trace context of the publish.
    pub context: Context,
    pub(crate) cancel: Option<CancellationToken>,
}

impl PublishRequest {
    pub fn new(exchange: &str, routing_key: &str, body: Vec<u8>) -> Self {
        PublishRequest {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            mandatory: false,
            immediate: false,
            body,
            properties: BasicProperties::default(),
            context: Context::new(),
            cancel: None,
        }
    }

    /// A copy of the message headers, empty when none are set.
    pub fn headers(&self) -> FieldTable {
        self.properties.headers().clone().unwrap_or_default()
    }

    /// Adds or replaces one header.
    pub fn set_header(&mut self, key: &str, value: AMQPValue) {
        let mut headers = self.headers();
        headers.insert(ShortString::from(key), value);
        self.set_headers(headers);
    }

    /// Replaces every header.
    pub fn set_headers(&mut self, headers: FieldTable) {
        self.set_properties(|props| props.with_headers(headers));
    }

    /// Sets the content-encoding property, e.g. `gzip`.
    pub fn set_content_encoding(&mut self, encoding: &str) {
        self.set_properties(|props| props.with_content_encoding(ShortString::from(encoding)));
    }

    fn set_properties(&mut self, update: impl FnOnce(BasicProperties) -> BasicProperties) {
        self.properties = update(mem::take(&mut self.properties));
    }
}

/// A value to publish, with its message properties.
///
/// Every publishing gets a random message id unless one is set.
pub struct Publishing<T> {
    value: T,
    request: PublishRequest,
    routing_key: Option<String>,
    mandatory: Option<bool>,
    immediate: Option<bool>,
}

impl<T> Publishing<T> {
    /// Creates a publishing of `value` with a v4 UUID message id and an
    /// empty header table.
    pub fn new(value: T) -> Self {
        let mut request = PublishRequest::new("", "", vec![]);
        request.properties = BasicProperties::default()
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::default());

        Publishing {
            value,
            request,
            routing_key: None,
            mandatory: None,
            immediate: None,
        }
    }

    fn with(mut self, update: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.request.set_properties(update);
        self
    }

    /// Asks durable queues to keep the message across broker restarts.
    pub fn persistent(self) -> Self {
        self.with(|props| props.with_delivery_mode(PERSISTENT))
    }

    /// Message priority, honored by queues declared with a max priority.
    pub fn priority(self, priority: u8) -> Self {
        self.with(|props| props.with_priority(priority))
    }

    /// Ties a reply to its request.
    pub fn correlation_id(self, id: &str) -> Self {
        self.with(|props| props.with_correlation_id(ShortString::from(id)))
    }

    /// Queue the receiver should answer to.
    pub fn reply_to(self, queue: &str) -> Self {
        self.with(|props| props.with_reply_to(ShortString::from(queue)))
    }

    /// Per-message TTL in milliseconds, as the broker expects it.
    pub fn expiration(self, millis: &str) -> Self {
        self.with(|props| props.with_expiration(ShortString::from(millis)))
    }

    /// Replaces the generated message id.
    pub fn message_id(self, id: &str) -> Self {
        self.with(|props| props.with_message_id(ShortString::from(id)))
    }

    /// Stored with second precision.
    pub fn timestamp(self, at: SystemTime) -> Self {
        let secs = at
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        self.with(|props| props.with_timestamp(secs))
    }

    /// Application-defined message type.
    pub fn kind(self, kind: &str) -> Self {
        self.with(|props| props.with_type(ShortString::from(kind)))
    }

    /// Checked by the broker against the connection's user.
    pub fn user_id(self, id: &str) -> Self {
        self.with(|props| props.with_user_id(ShortString::from(id)))
    }

    /// Name of the publishing application.
    pub fn app_id(self, id: &str) -> Self {
        self.with(|props| props.with_app_id(ShortString::from(id)))
    }

    /// Adds or replaces one header.
    pub fn header(mut self, key: &str, value: AMQPValue) -> Self {
        self.request.set_header(key, value);
        self
    }

    /// Overrides the publisher's routing key. Empty keys are ignored.
    pub fn routing_key(mut self, key: &str) -> Self {
        if !key.is_empty() {
            self.routing_key = Some(key.to_owned());
        }
        self
    }

    /// Overrides the publisher's mandatory flag.
    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = Some(mandatory);
        self
    }

    /// Overrides the publisher's immediate flag.
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = Some(immediate);
        self
    }

    /// Trace context handed to the publish hooks.
    pub fn context(mut self, cx: Context) -> Self {
        self.request.context = cx;
        self
    }

    /// Stops waiting for the confirmation once `token` is canceled.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.request.cancel = Some(token);
        self
    }
}

/// Routing defaults of a publisher.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    routing_key: String,
    mandatory: bool,
    immediate: bool,
}

impl PublishOptions {
    /// Empty keys are ignored.
    pub fn routing_key(mut self, key: &str) -> Self {
        if !key.is_empty() {
            self.routing_key = key.to_owned();
        }
        self
    }

    /// The broker returns the message when no queue is bound for it.
    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    /// The broker returns the message when no consumer is ready for it.
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }
}

/// Options of `Client::new_publisher`.
pub struct PublisherOptions<T> {
    confirm_mode: bool,
    confirm_timeout: Option<Duration>,
    marshaler: Option<Arc<dyn Marshaler<T>>>,
    hooks: Vec<Arc<dyn PublishHook>>,
    publish: PublishOptions,
}

impl<T: 'static> Default for PublisherOptions<T> {
    fn default() -> Self {
        PublisherOptions {
            confirm_mode: false,
            confirm_timeout: None,
            marshaler: marshal::default_marshaler(),
            hooks: vec![],
            publish: PublishOptions::default(),
        }
    }
}

impl<T> PublisherOptions<T> {
    /// Puts the sub-channel in confirm mode, `publish` then waits for the
    /// broker to acknowledge every message.
    pub fn confirm_mode(mut self) -> Self {
        self.confirm_mode = true;
        self
    }

    /// Bounds the wait for a confirmation. Unbounded by default.
    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = Some(timeout);
        self
    }

    /// Encoder of published values. `Vec<u8>` publishers get the raw
    /// bytes marshaler without asking.
    pub fn marshaler(mut self, marshaler: Arc<dyn Marshaler<T>>) -> Self {
        self.marshaler = Some(marshaler);
        self
    }

    /// Appends a hook, after the ones registered on the client.
    pub fn hook(mut self, hook: Arc<dyn PublishHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Routing defaults applied to every publishing.
    pub fn publish(mut self, opts: PublishOptions) -> Self {
        self.publish = opts;
        self
    }
}

/// Last step of the chain: sends on the current sub-channel.
struct Sender {
    channel: RwLock<Option<Arc<dyn Channel>>>,
    confirm_mode: bool,
    confirm_timeout: Option<Duration>,
    stop: CancellationToken,
}

#[async_trait]
impl Publish for Sender {
    async fn publish(&self, request: &mut PublishRequest) -> Result<(), AmqpError> {
        let channel = self.channel.read().clone().ok_or(AmqpError::ChannelClosed)?;

        let confirmation = channel
            .basic_publish(
                &request.exchange,
                &request.routing_key,
                BasicPublishOptions {
                    mandatory: request.mandatory,
                    immediate: request.immediate,
                },
                mem::take(&mut request.body),
                request.properties.clone(),
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        if !self.confirm_mode {
            return Ok(());
        }

        let cancel = request.cancel.clone().unwrap_or_default();
        let timeout = async {
            match self.confirm_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            confirmed = confirmation => match confirmed? {
                true => Ok(()),
                false => Err(AmqpError::PublishConfirm),
            },
            _ = cancel.cancelled() => Err(AmqpError::Canceled),
            _ = self.stop.cancelled() => Err(AmqpError::Canceled),
            _ = timeout => Err(AmqpError::ConfirmTimeout),
        }
    }
}

/// Sends values of type `T` to one exchange.
pub struct Publisher<T> {
    exchange: String,
    defaults: PublishOptions,
    marshaler: Option<Arc<dyn Marshaler<T>>>,
    chain: Arc<dyn Publish>,
    stop: CancellationToken,
}

impl<T> Publisher<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) async fn new(shared: Arc<Shared>, exchange: &str, opts: PublisherOptions<T>) -> Self {
        let stop = shared.done.child_token();
        let sender = Arc::new(Sender {
            channel: RwLock::new(None),
            confirm_mode: opts.confirm_mode,
            confirm_timeout: opts.confirm_timeout,
            stop: stop.clone(),
        });

        let hooks: Vec<_> = shared
            .publish_hooks
            .iter()
            .chain(opts.hooks.iter())
            .cloned()
            .collect();
        let chain = hook::publish_chain(&hooks, sender.clone());

        let publisher = Publisher {
            exchange: exchange.to_owned(),
            defaults: opts.publish,
            marshaler: opts.marshaler,
            chain,
            stop: stop.clone(),
        };

        if publisher.marshaler.is_none() {
            debug!(exchange, "publisher without marshaler");
            return publisher;
        }

        let mut keeper = ChannelKeeper {
            shared,
            exchange: publisher.exchange.clone(),
            routing_key: publisher.defaults.routing_key.clone(),
            sender,
            stop,
            closed: None,
            drain: None,
        };

        // The background task retries when this first attempt fails.
        if let Err(err) = keeper.init_channel().await {
            debug!(error = err.to_string(), exchange, "publisher channel not ready");
        }

        let tracker = keeper.shared.tracker.clone();
        tracker.spawn(keeper.serve());
        publisher
    }

    /// Encodes the value, runs the hook chain and sends the message.
    ///
    /// # Parameters
    /// * `publishing` - The value with its properties and routing overrides
    ///
    /// # Returns
    /// Ok(()) once the message is sent, or confirmed in confirm mode.
    /// Otherwise a PublishError naming the exchange and routing key.
    pub async fn publish(&self, publishing: Publishing<T>) -> Result<(), PublishError> {
        let Publishing {
            value,
            mut request,
            routing_key,
            mandatory,
            immediate,
        } = publishing;

        let routing_key = routing_key.unwrap_or_else(|| self.defaults.routing_key.clone());

        let Some(marshaler) = &self.marshaler else {
            return Err(self.error(routing_key, AmqpError::MarshalerNotFound));
        };

        if routing_key.is_empty() {
            return Err(self.error(routing_key, AmqpError::EmptyRoutingKey));
        }

        request.body = match marshaler.marshal(&value) {
            Ok(body) => body,
            Err(err) => return Err(self.error(routing_key, err)),
        };
        let content_type = ShortString::from(marshaler.content_type());
        request.set_properties(|props| props.with_content_type(content_type));

        request.exchange = self.exchange.clone();
        request.routing_key = routing_key;
        request.mandatory = mandatory.unwrap_or(self.defaults.mandatory);
        request.immediate = immediate.unwrap_or(self.defaults.immediate);

        self.chain
            .publish(&mut request)
            .await
            .map_err(|source| self.error(request.routing_key, source))
    }

    /// Stops the background task and closes the sub-channel.
    pub fn close(&self) {
        self.stop.cancel();
    }

    fn error(&self, routing_key: String, source: AmqpError) -> PublishError {
        PublishError {
            exchange: self.exchange.clone(),
            routing_key,
            source,
        }
    }
}

impl<T> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Reopens the publisher's sub-channel whenever the broker closes it.
struct ChannelKeeper {
    shared: Arc<Shared>,
    exchange: String,
    routing_key: String,
    sender: Arc<Sender>,
    stop: CancellationToken,
    closed: Option<CloseNotify>,
    /// Stops the returns drain of the current channel.
    drain: Option<CancellationToken>,
}

impl ChannelKeeper {
    async fn init_channel(&mut self) -> Result<(), AmqpError> {
        let conn = self.shared.connection()?;
        let channel = conn
            .channel()
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))?;

        if self.sender.confirm_mode {
            if let Err(err) = channel.confirm_select().await {
                if let Err(err) = channel.close().await {
                    debug!(error = err.to_string(), "closing the unused channel");
                }
                return Err(AmqpError::ConfirmModeError(err.to_string()));
            }
        }

        self.closed = Some(channel.notify_close());

        let drain = self.stop.child_token();
        if let Some(previous) = self.drain.replace(drain.clone()) {
            previous.cancel();
        }
        self.shared.tracker.spawn(drain_returns(
            channel.clone(),
            self.shared.logger.clone(),
            drain,
        ));

        let old = self.sender.channel.write().replace(channel);
        if let Some(old) = old {
            if let Err(err) = old.close().await {
                debug!(error = err.to_string(), "closing the replaced channel");
            }
        }

        debug!(exchange = self.exchange, "publisher channel ready");
        Ok(())
    }

    async fn serve(mut self) {
        // Without a channel from the first attempt there is nothing to lose yet.
        let mut open = self.closed.is_some() || self.reconnect().await;

        while open {
            let Some(closed) = self.closed.as_mut() else {
                break;
            };
            let lost = tokio::select! {
                biased;

                _ = self.stop.cancelled() => break,

                err = closed.recv() => err.unwrap_or(AmqpError::ChannelClosed),
            };

            warn!(
                error = lost.to_string(),
                exchange = self.exchange,
                "publisher channel lost"
            );
            open = self.reconnect().await;
        }

        let channel = self.sender.channel.write().take();
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "closing the publisher channel");
            }
        }
        debug!(exchange = self.exchange, "publisher stopped");
    }

    /// Returns false when the publisher was closed first.
    async fn reconnect(&mut self) -> bool {
        self.closed = None;

        loop {
            match self.init_channel().await {
                Ok(()) => return true,
                Err(AmqpError::ConnectionClosed) => {}
                Err(source) => (self.shared.logger)(&PublishError {
                    exchange: self.exchange.clone(),
                    routing_key: self.routing_key.clone(),
                    source,
                }),
            }

            tokio::select! {
                _ = self.stop.cancelled() => return false,
                _ = tokio::time::sleep(self.shared.reconnect_delay) => {}
            }
        }
    }
}

/// Logs the messages the broker returns on `channel` until `done` fires,
/// then collects once more and stops.
async fn drain_returns(channel: Arc<dyn Channel>, logger: LogFunc, done: CancellationToken) {
    let mut poll = tokio::time::interval(RETURNS_POLL_INTERVAL);

    loop {
        let last = tokio::select! {
            _ = done.cancelled() => true,
            _ = poll.tick() => false,
        };

        match channel.take_returns().await {
            Ok(returned) => {
                for msg in returned {
                    logger(&ReturnError {
                        exchange: msg.exchange,
                        routing_key: msg.routing_key,
                        reply_code: msg.reply_code,
                        reply_text: msg.reply_text,
                    });
                }
            }
            Err(err) => {
                debug!(error = err.to_string(), "returned messages no longer available");
                return;
            }
        }

        if last {
            return;
        }
    }
}
