// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! Every fake shares one `Script`, so a test can make the next channel open,
//! declaration, publish or dial fail, or make confirmations negative, on
//! whichever connection the supervisor currently holds.

use crate::{
    channel::{
        Acknowledger, Channel, CloseNotify, Connection, DeferredConfirmation, DeliveryStream,
        RawDelivery, ReturnedMessage,
    },
    delivery::Action,
    dial::Dialer,
    errors::AmqpError,
    log::LogFunc,
};
use async_trait::async_trait;
use futures_util::{future, stream, FutureExt, StreamExt};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use parking_lot::Mutex;
use std::{
    error::Error,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Failures and outcomes the fakes produce.
#[derive(Default)]
pub(crate) struct Script {
    pub(crate) dial: Option<AmqpError>,
    pub(crate) channel: Option<AmqpError>,
    pub(crate) declare: Option<AmqpError>,
    pub(crate) qos: Option<AmqpError>,
    pub(crate) consume: Option<AmqpError>,
    pub(crate) confirm_select: Option<AmqpError>,
    pub(crate) publish: Option<AmqpError>,
    /// Confirmations resolve to a nack.
    pub(crate) nack: bool,
    /// Confirmations never resolve.
    pub(crate) hold_confirms: bool,
    /// Mandatory publishes find no queue and come back as returns.
    pub(crate) unroutable: bool,
}

pub(crate) type SharedScript = Arc<Mutex<Script>>;

impl Script {
    pub(crate) fn shared() -> SharedScript {
        Arc::default()
    }
}

fn closed_notify(err: AmqpError) -> CloseNotify {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(err);
    rx
}

#[derive(Default)]
struct Listeners(Mutex<Vec<mpsc::Sender<AmqpError>>>);

impl Listeners {
    fn push(&self, closed: bool, err: AmqpError) -> CloseNotify {
        if closed {
            return closed_notify(err);
        }

        let (tx, rx) = mpsc::channel(1);
        self.0.lock().push(tx);
        rx
    }

    fn fire(&self, err: AmqpError) {
        for tx in self.0.lock().drain(..) {
            let _ = tx.try_send(err.clone());
        }
    }
}

/// Records every settlement it receives.
#[derive(Default)]
pub(crate) struct FakeAcknowledger {
    settled: Mutex<Vec<(Action, u64)>>,
}

impl FakeAcknowledger {
    pub(crate) fn settled(&self) -> Vec<(Action, u64)> {
        self.settled.lock().clone()
    }
}

#[async_trait]
impl Acknowledger for FakeAcknowledger {
    async fn ack(&self, delivery_tag: u64, _: bool) -> Result<(), AmqpError> {
        self.settled.lock().push((Action::Ack, delivery_tag));
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, _: bool, _: bool) -> Result<(), AmqpError> {
        self.settled.lock().push((Action::Nack, delivery_tag));
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, _: bool) -> Result<(), AmqpError> {
        self.settled.lock().push((Action::Reject, delivery_tag));
        Ok(())
    }
}

/// A message seen by `FakeChannel::basic_publish`.
#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) options: BasicPublishOptions,
    pub(crate) body: Vec<u8>,
    pub(crate) properties: BasicProperties,
}

type DeliverySender = mpsc::UnboundedSender<Result<RawDelivery, AmqpError>>;

pub(crate) struct FakeChannel {
    script: SharedScript,
    closed: AtomicBool,
    listeners: Listeners,
    calls: Mutex<Vec<String>>,
    deliveries: Mutex<Option<DeliverySender>>,
    returns: Mutex<Vec<ReturnedMessage>>,
    published: Mutex<Vec<Published>>,
    acknowledger: Arc<FakeAcknowledger>,
}

impl FakeChannel {
    pub(crate) fn new(script: SharedScript) -> Self {
        FakeChannel {
            script,
            closed: AtomicBool::new(false),
            listeners: Listeners::default(),
            calls: Mutex::default(),
            deliveries: Mutex::default(),
            returns: Mutex::default(),
            published: Mutex::default(),
            acknowledger: Arc::default(),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn scripted(&self, pick: impl Fn(&Script) -> &Option<AmqpError>) -> Result<(), AmqpError> {
        match pick(&self.script.lock()) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub(crate) fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub(crate) fn acknowledger(&self) -> Arc<FakeAcknowledger> {
        self.acknowledger.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_consuming(&self) -> bool {
        self.deliveries.lock().is_some()
    }

    /// Pushes a delivery to the consumer of this channel.
    pub(crate) fn deliver(&self, delivery_tag: u64, body: &[u8], properties: BasicProperties) {
        let delivery = RawDelivery {
            delivery_tag,
            redelivered: false,
            exchange: "amq.direct".to_owned(),
            routing_key: "key".to_owned(),
            properties,
            data: body.to_vec(),
            acknowledger: self.acknowledger.clone(),
        };

        let sent = self
            .deliveries
            .lock()
            .as_ref()
            .map(|tx| tx.send(Ok(delivery)).is_ok());
        assert_eq!(sent, Some(true), "channel has no consumer");
    }

    /// The broker canceled the consumer, the delivery stream ends.
    pub(crate) fn cancel(&self) {
        self.deliveries.lock().take();
    }

    /// The broker closed the channel.
    pub(crate) fn shutdown(&self, err: AmqpError) {
        self.closed.store(true, Ordering::SeqCst);
        self.deliveries.lock().take();
        self.listeners.fire(err);
    }

    /// Buffers a returned message until the next `take_returns`.
    pub(crate) fn return_message(&self, msg: ReturnedMessage) {
        self.returns.lock().push(msg);
    }

    pub(crate) fn pending_returns(&self) -> usize {
        self.returns.lock().len()
    }
}

#[async_trait]
impl Channel for FakeChannel {
    async fn queue_declare(
        &self,
        name: &str,
        _: QueueDeclareOptions,
        _: FieldTable,
    ) -> Result<(), AmqpError> {
        self.scripted(|s| &s.declare)?;
        self.record(format!("queue_declare {name}"));
        Ok(())
    }

    async fn exchange_declare(
        &self,
        name: &str,
        _: ExchangeKind,
        _: ExchangeDeclareOptions,
        _: FieldTable,
    ) -> Result<(), AmqpError> {
        self.scripted(|s| &s.declare)?;
        self.record(format!("exchange_declare {name}"));
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _: QueueBindOptions,
        _: FieldTable,
    ) -> Result<(), AmqpError> {
        self.scripted(|s| &s.declare)?;
        self.record(format!("queue_bind {queue} {exchange} {routing_key}"));
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.scripted(|s| &s.qos)?;
        self.record(format!("qos {prefetch_count}"));
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.scripted(|s| &s.confirm_select)?;
        self.record("confirm_select".to_owned());
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        _: FieldTable,
    ) -> Result<DeliveryStream, AmqpError> {
        self.scripted(|s| &s.consume)?;
        self.record(format!(
            "consume {queue} {consumer_tag} no_ack={} exclusive={}",
            options.no_ack, options.exclusive
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        *self.deliveries.lock() = Some(tx);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
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
        self.scripted(|s| &s.publish)?;
        if options.mandatory && self.script.lock().unroutable {
            self.return_message(ReturnedMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                reply_code: 312,
                reply_text: "NO_ROUTE".to_owned(),
            });
        }
        self.published.lock().push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            options,
            body: payload,
            properties,
        });

        let script = self.script.lock();
        if script.hold_confirms {
            return Ok(future::pending().boxed());
        }
        Ok(future::ready(Ok(!script.nack)).boxed())
    }

    fn notify_close(&self) -> CloseNotify {
        self.listeners.push(self.is_closed(), AmqpError::ChannelClosed)
    }

    async fn take_returns(&self) -> Result<Vec<ReturnedMessage>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ChannelClosed);
        }
        Ok(std::mem::take(&mut *self.returns.lock()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        self.deliveries.lock().take();
        self.record("close".to_owned());
        Ok(())
    }
}

pub(crate) struct FakeConnection {
    script: SharedScript,
    closed: AtomicBool,
    listeners: Listeners,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    pub(crate) fn new(script: SharedScript) -> Self {
        FakeConnection {
            script,
            closed: AtomicBool::new(false),
            listeners: Listeners::default(),
            channels: Mutex::default(),
        }
    }

    pub(crate) fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().clone()
    }

    /// The connection drops, taking its channels with it.
    pub(crate) fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for channel in self.channels() {
            channel.shutdown(AmqpError::ConnectionClosed);
        }
        self.listeners.fire(AmqpError::ConnectionClosed);
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn channel(&self) -> Result<Arc<dyn Channel>, AmqpError> {
        if let Some(err) = &self.script.lock().channel {
            return Err(err.clone());
        }

        let channel = Arc::new(FakeChannel::new(self.script.clone()));
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    fn notify_close(&self) -> CloseNotify {
        self.listeners
            .push(self.is_closed(), AmqpError::ConnectionClosed)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        for channel in self.channels() {
            channel.close().await?;
        }
        Ok(())
    }
}

/// Hands out a new `FakeConnection` per dial.
#[derive(Default)]
pub(crate) struct FakeDialer {
    script: SharedScript,
    dials: AtomicUsize,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeDialer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::default()
    }

    pub(crate) fn script(&self) -> SharedScript {
        self.script.clone()
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// The most recently dialed connection.
    pub(crate) fn connection(&self) -> Arc<FakeConnection> {
        self.connections
            .lock()
            .last()
            .cloned()
            .expect("nothing dialed yet")
    }

    /// The most recently opened channel of the current connection.
    pub(crate) fn channel(&self) -> Arc<FakeChannel> {
        self.connection()
            .channels()
            .last()
            .cloned()
            .expect("no channel opened yet")
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, _: &CancellationToken) -> Result<Arc<dyn Connection>, AmqpError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.script.lock().dial {
            return Err(err.clone());
        }

        let conn = Arc::new(FakeConnection::new(self.script.clone()));
        self.connections.lock().push(conn.clone());
        Ok(conn)
    }
}

/// A `LogFunc` keeping every message it receives.
pub(crate) fn collect_logs() -> (LogFunc, Arc<Mutex<Vec<String>>>) {
    let logs: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = logs.clone();
    let logger: LogFunc = Arc::new(move |err: &(dyn Error + 'static)| {
        sink.lock().push(err.to_string());
    });
    (logger, logs)
}

/// Polls `cond` until it holds, panics after two seconds.
pub(crate) async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
