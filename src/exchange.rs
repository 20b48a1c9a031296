// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Declarations
//!
//! Exchanges route published messages to queues. A consumer can declare the
//! exchange its queue is bound to, the definition is replayed on every
//! sub-channel it opens.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// The default direct exchange
pub const DIRECT_EXCHANGE: &str = "amq.direct";
/// The default fanout exchange
pub const FANOUT_EXCHANGE: &str = "amq.fanout";
/// The default headers exchange
pub const HEADERS_EXCHANGE: &str = "amq.headers";
/// The default headers exchange, legacy name
pub const MATCH_EXCHANGE: &str = "amq.match";
/// The default topic exchange
pub const TOPIC_EXCHANGE: &str = "amq.topic";

/// Routing behavior of an exchange.
///
/// - Direct: exact routing-key match
/// - Fanout: every bound queue
/// - Topic: wildcard routing-key match
/// - Headers: header values instead of routing keys
/// - XMessageDelayed: delayed delivery, needs the broker plugin
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Definition of an exchange, built by chaining.
#[derive(Debug, Clone)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// A non-durable direct exchange named `name`.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
        }
    }

    /// Routing algorithm of the exchange.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    /// Delayed exchange routing like `kind` once the delay elapsed.
    ///
    /// Requires the x-delayed-message plugin on the broker.
    pub fn delayed(mut self, kind: ExchangeKind) -> Self {
        let routing = match kind {
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Direct | ExchangeKind::XMessageDelayed => "direct",
        };

        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(routing)),
        );
        self
    }

    /// Adds an `x-` argument to the declaration.
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Deletes the exchange once its last binding is gone.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Survives broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Only checks that the exchange exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Refuses direct publishes, only exchange-to-exchange routing reaches it.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Does not wait for the broker to confirm the declaration.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}
