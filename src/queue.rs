// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declarations
//!
//! A consumer may declare the queue it consumes from, and bind it to an
//! exchange, every time it opens a sub-channel. The queue name is the one the
//! consumer was created for, so definitions here only carry the properties.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Properties of a queue declared by a consumer.
///
/// ```ignore
/// let queue = QueueDefinition::default().durable().ttl(60_000).with_dlq();
/// ```
#[derive(Debug, Clone, Default)]
pub struct QueueDefinition {
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq: bool,
    pub(crate) args: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Makes the queue survive broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue once its last consumer is gone.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Restricts the queue to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Message time-to-live in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Maximum number of ready messages.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Declares a `<queue>-dlq` queue and dead-letters rejected, expired or
    /// overflowing messages into it.
    pub fn with_dlq(mut self) -> Self {
        self.dlq = true;
        self
    }

    /// Adds a raw `x-*` argument.
    pub fn arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.args.insert(ShortString::from(key), value);
        self
    }

    pub(crate) fn dlq_name(&self, queue: &str) -> Option<String> {
        self.dlq.then(|| format!("{queue}-dlq"))
    }

    /// Declaration arguments of `queue`.
    pub(crate) fn arguments(&self, queue: &str) -> FieldTable {
        let mut args = self.args.clone();

        if let Some(dlq) = self.dlq_name(queue) {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(dlq)),
            );
        }

        let limits = [
            (AMQP_HEADERS_MESSAGE_TTL, self.ttl),
            (AMQP_HEADERS_MAX_LENGTH, self.max_length),
            (AMQP_HEADERS_MAX_LENGTH_BYTES, self.max_length_bytes),
        ];
        for (key, value) in limits {
            if let Some(value) = value {
                args.insert(
                    ShortString::from(key),
                    AMQPValue::LongInt(LongInt::from(value)),
                );
            }
        }

        FieldTable::from(args)
    }
}

/// Binds the consumer's queue to an exchange, once per routing key.
#[derive(Debug, Clone, Default)]
pub struct QueueBinding {
    pub(crate) exchange: String,
    pub(crate) routing_keys: Vec<String>,
    pub(crate) no_wait: bool,
    pub(crate) args: FieldTable,
}

impl QueueBinding {
    /// Creates a binding to `exchange`.
    ///
    /// # Parameters
    /// * `exchange` - Name of an exchange the broker already knows, or one
    ///   declared with `ConsumerOptions::declare_exchange`
    pub fn new(exchange: &str) -> Self {
        QueueBinding {
            exchange: exchange.to_owned(),
            ..Default::default()
        }
    }

    /// Adds a binding key. A binding without keys binds nothing.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_keys.push(key.to_owned());
        self
    }

    /// Does not wait for the broker to confirm the binding.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Binding arguments, used by headers exchanges.
    pub fn args(mut self, args: FieldTable) -> Self {
        self.args = args;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_queue_has_no_arguments() {
        let args = QueueDefinition::default().durable().arguments("orders");

        assert!(args.inner().is_empty());
    }

    #[test]
    fn limits_become_arguments() {
        let args = QueueDefinition::default()
            .ttl(1000)
            .max_length(10)
            .max_length_bytes(2048)
            .arguments("orders");

        let args = args.inner();
        assert_eq!(
            args.get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(1000))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_MAX_LENGTH),
            Some(&AMQPValue::LongInt(10))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_MAX_LENGTH_BYTES),
            Some(&AMQPValue::LongInt(2048))
        );
    }

    #[test]
    fn dlq_routes_to_suffixed_queue() {
        let def = QueueDefinition::default().with_dlq();
        assert_eq!(def.dlq_name("orders").as_deref(), Some("orders-dlq"));

        let args = def.arguments("orders");
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("orders-dlq")))
        );
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("")))
        );
    }

    #[test]
    fn binding_collects_routing_keys() {
        let binding = QueueBinding::new("amq.topic")
            .routing_key("order.created")
            .routing_key("order.paid");

        assert_eq!(binding.exchange, "amq.topic");
        assert_eq!(binding.routing_keys, vec!["order.created", "order.paid"]);
    }
}
