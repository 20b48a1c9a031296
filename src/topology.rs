// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Topology
//!
//! The exchange, queue and bindings a consumer declares before it starts
//! consuming. Installation is idempotent on the broker side and is replayed
//! each time the consumer opens a new sub-channel, so a broker restart that
//! lost non-durable entities does not leave the consumer without a queue.
//!
//! Order of installation:
//! 1. the exchange
//! 2. the dead-letter queue, then the queue
//! 3. one binding per routing key

use crate::{
    channel::Channel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
};
use tracing::{debug, error};

#[derive(Debug, Clone, Default)]
pub(crate) struct Topology {
    pub(crate) exchange: Option<ExchangeDefinition>,
    pub(crate) queue: Option<QueueDefinition>,
    pub(crate) binding: Option<QueueBinding>,
}

impl Topology {
    pub(crate) async fn install(&self, channel: &dyn Channel, queue: &str) -> Result<(), AmqpError> {
        if let Some(exchange) = &self.exchange {
            install_exchange(channel, exchange).await?;
        }

        if let Some(def) = &self.queue {
            install_queue(channel, queue, def).await?;
        }

        if let Some(binding) = &self.binding {
            bind_queue(channel, queue, binding).await?;
        }

        Ok(())
    }
}

async fn install_exchange(channel: &dyn Channel, def: &ExchangeDefinition) -> Result<(), AmqpError> {
    debug!(name = %def.name, "declaring exchange");

    channel
        .exchange_declare(
            &def.name,
            def.kind.clone().into(),
            ExchangeDeclareOptions {
                passive: def.passive,
                durable: def.durable,
                auto_delete: def.delete,
                internal: def.internal,
                nowait: def.no_wait,
            },
            def.arguments(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), name = %def.name, "error to declare the exchange");
            AmqpError::DeclareExchangeError(def.name.clone(), err.to_string())
        })
}

async fn install_queue(
    channel: &dyn Channel,
    queue: &str,
    def: &QueueDefinition,
) -> Result<(), AmqpError> {
    let options = QueueDeclareOptions {
        passive: def.passive,
        durable: def.durable,
        exclusive: def.exclusive,
        auto_delete: def.delete,
        nowait: def.no_wait,
    };

    if let Some(dlq) = def.dlq_name(queue) {
        declare_queue(channel, &dlq, options, FieldTable::default()).await?;
    }

    declare_queue(channel, queue, options, def.arguments(queue)).await
}

async fn declare_queue(
    channel: &dyn Channel,
    name: &str,
    options: QueueDeclareOptions,
    args: FieldTable,
) -> Result<(), AmqpError> {
    debug!(name, "declaring queue");

    channel
        .queue_declare(name, options, args)
        .await
        .map_err(|err| {
            error!(error = err.to_string(), name, "error to declare the queue");
            AmqpError::DeclareQueueError(name.to_owned(), err.to_string())
        })
}

async fn bind_queue(
    channel: &dyn Channel,
    queue: &str,
    binding: &QueueBinding,
) -> Result<(), AmqpError> {
    for key in &binding.routing_keys {
        debug!(queue, exchange = %binding.exchange, key = %key, "binding queue");

        channel
            .queue_bind(
                queue,
                &binding.exchange,
                key,
                QueueBindOptions {
                    nowait: binding.no_wait,
                },
                binding.args.clone(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange.clone(),
                    queue.to_owned(),
                    err.to_string(),
                )
            })?;
    }

    Ok(())
}
