// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! A consumer runs one `Handler` per queue. Two kinds exist:
//!
//! - `Handler::raw` hands the delivery body to user code as bytes and needs no
//!   unmarshaler.
//! - `Handler::typed` decodes the body with the unmarshaler registered for the
//!   delivery's content-type into a pooled value. Deliveries that cannot be
//!   decoded are logged and rejected without reaching user code.
//!
//! Both end up as a `Consume` stage, the terminal of the consume hook chain.

use crate::{
    delivery::{Action, Delivery, DeliveryInfo},
    errors::{AmqpError, DeliveryError},
    marshal::{Unmarshaler, Unmarshalers},
    pool::{Pool, Pooled},
};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use opentelemetry::Context;
use std::{future::Future, mem, sync::Arc};

/// One stage of the consume path.
#[async_trait]
pub trait Consume: Send + Sync {
    async fn serve(&self, delivery: &mut Delivery) -> Action;
}

/// What user code receives for each delivery.
#[derive(Debug)]
pub struct Envelope<B> {
    pub info: DeliveryInfo,
    pub body: B,
    /// Trace context attached by the consume hooks.
    pub context: Context,
}

/// A typed handler seen through its payload-independent capabilities.
pub trait TypedConsume: Consume {
    fn has_unmarshaler(&self) -> bool;

    fn into_consume(self: Arc<Self>) -> Arc<dyn Consume>;
}

/// The handler of a consumer.
pub enum Handler {
    Raw(Arc<dyn Consume>),
    Typed(Arc<dyn TypedConsume>),
}

impl Handler {
    /// Handles raw delivery bodies.
    pub fn raw<F, Fut>(handle: F) -> Self
    where
        F: Fn(Envelope<Vec<u8>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Action> + Send + 'static,
    {
        Handler::Raw(Arc::new(RawHandler {
            handle: Box::new(move |envelope| handle(envelope).boxed()),
        }))
    }

    /// Handles decoded values, see `TypedHandler`.
    pub fn typed<T>(handler: TypedHandler<T>) -> Self
    where
        T: Default + Send + Sync + 'static,
    {
        Handler::Typed(Arc::new(handler))
    }

    pub(crate) fn validate(&self) -> Result<(), AmqpError> {
        match self {
            Handler::Raw(_) => Ok(()),
            Handler::Typed(typed) if typed.has_unmarshaler() => Ok(()),
            Handler::Typed(_) => Err(AmqpError::UnmarshalerNotFound),
        }
    }

    pub(crate) fn into_consume(self) -> Arc<dyn Consume> {
        match self {
            Handler::Raw(raw) => raw,
            Handler::Typed(typed) => typed.into_consume(),
        }
    }
}

type HandleFn<B> = Box<dyn Fn(Envelope<B>) -> BoxFuture<'static, Action> + Send + Sync>;

struct RawHandler {
    handle: HandleFn<Vec<u8>>,
}

#[async_trait]
impl Consume for RawHandler {
    async fn serve(&self, delivery: &mut Delivery) -> Action {
        (self.handle)(Envelope {
            info: delivery.info.clone(),
            body: mem::take(&mut delivery.body),
            context: delivery.context.clone(),
        })
        .await
    }
}

/// Decodes deliveries into `T` before calling user code.
///
/// ```ignore
/// let handler = TypedHandler::new(|order: Envelope<Pooled<Order>>| async move {
///     println!("{}", order.body.id);
///     Action::Ack
/// })
/// .unmarshaler(Arc::new(Json));
/// ```
pub struct TypedHandler<T: Default> {
    handle: HandleFn<Pooled<T>>,
    unmarshalers: Unmarshalers<T>,
    pool: Pool<T>,
}

impl<T> TypedHandler<T>
where
    T: Default + Send + Sync + 'static,
{
    /// Wraps `handle`. At least one unmarshaler must be registered before
    /// the handler is given to a consumer.
    pub fn new<F, Fut>(handle: F) -> Self
    where
        F: Fn(Envelope<Pooled<T>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Action> + Send + 'static,
    {
        TypedHandler {
            handle: Box::new(move |envelope| handle(envelope).boxed()),
            unmarshalers: Unmarshalers::new(),
            pool: Pool::new(),
        }
    }

    /// Registers an unmarshaler for its content type.
    pub fn unmarshaler(mut self, unmarshaler: Arc<dyn Unmarshaler<T>>) -> Self {
        self.unmarshalers.register(unmarshaler);
        self
    }

    /// Reuses decoded values across deliveries, `reset` clears one before reuse.
    pub fn reset<R>(mut self, reset: R) -> Self
    where
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        self.pool = Pool::with_reset(reset);
        self
    }

    fn reject(&self, delivery: &Delivery, message: String) -> Action {
        delivery.log(&DeliveryError {
            exchange: delivery.info.exchange.clone(),
            routing_key: delivery.info.routing_key.clone(),
            message,
        });
        Action::Reject
    }
}

#[async_trait]
impl<T> Consume for TypedHandler<T>
where
    T: Default + Send + Sync + 'static,
{
    async fn serve(&self, delivery: &mut Delivery) -> Action {
        let content_type = delivery.info.content_type();
        let Some(unmarshaler) = self.unmarshalers.get(content_type) else {
            let message = format!("content-type \"{content_type}\" of the unmarshal not found");
            return self.reject(delivery, message);
        };

        let mut value = self.pool.get();
        if let Err(err) = unmarshaler.unmarshal(&delivery.body, &mut value) {
            let message = format!("has an error trying to unmarshal: {err}");
            return self.reject(delivery, message);
        }

        (self.handle)(Envelope {
            info: delivery.info.clone(),
            body: value,
            context: delivery.context.clone(),
        })
        .await
    }
}

impl<T> TypedConsume for TypedHandler<T>
where
    T: Default + Send + Sync + 'static,
{
    fn has_unmarshaler(&self) -> bool {
        !self.unmarshalers.is_empty()
    }

    fn into_consume(self: Arc<Self>) -> Arc<dyn Consume> {
        self
    }
}
